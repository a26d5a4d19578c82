use {
    anyhow::Context,
    jiff::civil::{Date, DateTime},
};

/// One parsed iCalendar content line: `NAME[;PARAM=VALUE...]:VALUE`.
///
/// The pieces are stored exactly as they appeared, in order, so that
/// serializing a parsed line reproduces its input byte for byte. Lookups
/// are case-insensitive per RFC 5545, but nothing is case-folded in
/// storage.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContentLine {
    name: Box<str>,
    params: Vec<Param>,
    value: Box<str>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct Param {
    name: Box<str>,
    value: Box<str>,
}

impl ContentLine {
    /// Parses a single content line.
    ///
    /// Parameter values may be double-quoted, in which case `;`, `:` and
    /// `,` within the quotes are literal.
    pub fn parse(line: &str) -> anyhow::Result<ContentLine> {
        let colon = find_unquoted(line, ':').with_context(|| {
            format!("content line `{line}` has no `:` separator")
        })?;
        let (head, value) = (&line[..colon], &line[colon + 1..]);

        let mut segments = split_unquoted(head, ';');
        let name = segments.next().unwrap_or("");
        anyhow::ensure!(
            !name.is_empty() && name.chars().all(is_name_char),
            "content line `{line}` has an invalid name `{name}`",
        );
        let mut params = vec![];
        for segment in segments {
            let (pname, pvalue) =
                segment.split_once('=').with_context(|| {
                    format!(
                        "parameter `{segment}` in content line `{line}` \
                         is missing its `=`",
                    )
                })?;
            anyhow::ensure!(
                !pname.is_empty() && pname.chars().all(is_name_char),
                "parameter `{segment}` in content line `{line}` \
                 has an invalid name",
            );
            params.push(Param { name: pname.into(), value: pvalue.into() });
        }
        Ok(ContentLine { name: name.into(), params, value: value.into() })
    }

    /// Returns the property name as written.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if this line's name matches `tag`, ignoring case.
    pub fn is(&self, tag: &str) -> bool {
        self.name.eq_ignore_ascii_case(tag)
    }

    /// Returns the value of the first parameter with the given name,
    /// ignoring case.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| &*p.value)
    }

    /// Returns the raw value text after the `:`.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns the comma-separated value tokens, e.g. the individual
    /// dates of an `EXDATE` line.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        split_unquoted(&self.value, ',')
    }

    /// Splits the value as ordered `KEY=VALUE` rule parts, the shape of
    /// an `RRULE` value.
    pub fn rule_parts(&self) -> anyhow::Result<Vec<(&str, &str)>> {
        split_unquoted(&self.value, ';')
            .map(|part| {
                part.split_once('=').with_context(|| {
                    format!(
                        "rule part `{part}` in `{self}` is missing its `=`",
                    )
                })
            })
            .collect()
    }
}

impl std::fmt::Display for ContentLine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        for p in self.params.iter() {
            write!(f, ";{}={}", p.name, p.value)?;
        }
        write!(f, ":{}", self.value)
    }
}

impl std::str::FromStr for ContentLine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<ContentLine> {
        ContentLine::parse(s)
    }
}

/// Parses a block of content lines, one result per non-empty line.
///
/// A malformed line yields an error in its slot without disturbing its
/// siblings.
pub fn parse_block(text: &str) -> Vec<anyhow::Result<ContentLine>> {
    text.lines()
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.is_empty())
        .map(ContentLine::parse)
        .collect()
}

/// Parses a block of content lines, failing wholesale on the first
/// malformed line. For callers that treat the block as atomic.
pub fn parse_block_atomic(text: &str) -> anyhow::Result<Vec<ContentLine>> {
    parse_block(text).into_iter().collect()
}

/// A raw iCalendar date or date-time token.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DateToken {
    /// `YYYYMMDD`.
    Date(Date),
    /// `YYYYMMDD'T'HHMMSS`, optionally suffixed with `Z` for UTC.
    DateTime { dt: DateTime, utc: bool },
}

impl DateToken {
    /// Parses a basic-format iCalendar date or date-time token.
    pub fn parse(token: &str) -> anyhow::Result<DateToken> {
        let bad = || format!("`{token}` is not a valid iCalendar date token");
        let (date_part, time_part) = match token.split_once('T') {
            None => (token, None),
            Some((d, t)) => (d, Some(t)),
        };
        anyhow::ensure!(date_part.len() == 8, bad());
        let year: i16 = date_part[..4].parse().with_context(bad)?;
        let month: i8 = date_part[4..6].parse().with_context(bad)?;
        let day: i8 = date_part[6..8].parse().with_context(bad)?;
        let date = Date::new(year, month, day).with_context(bad)?;

        let Some(time_part) = time_part else {
            return Ok(DateToken::Date(date));
        };
        let (time_part, utc) = match time_part.strip_suffix('Z') {
            None => (time_part, false),
            Some(rest) => (rest, true),
        };
        anyhow::ensure!(time_part.len() == 6, bad());
        let hour: i8 = time_part[..2].parse().with_context(bad)?;
        let minute: i8 = time_part[2..4].parse().with_context(bad)?;
        let second: i8 = time_part[4..6].parse().with_context(bad)?;
        let time =
            jiff::civil::Time::new(hour, minute, second, 0).with_context(bad)?;
        Ok(DateToken::DateTime { dt: DateTime::from_parts(date, time), utc })
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

/// Returns the index of the first `needle` outside double quotes.
fn find_unquoted(s: &str, needle: char) -> Option<usize> {
    let mut quoted = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => quoted = !quoted,
            c if c == needle && !quoted => return Some(i),
            _ => {}
        }
    }
    None
}

/// Splits on `needle`, respecting double quotes.
fn split_unquoted(s: &str, needle: char) -> impl Iterator<Item = &str> {
    let mut rest = Some(s);
    std::iter::from_fn(move || {
        let cur = rest?;
        match find_unquoted(cur, needle) {
            None => {
                rest = None;
                Some(cur)
            }
            Some(i) => {
                rest = Some(&cur[i + 1..]);
                Some(&cur[..i])
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use jiff::civil::date;

    use super::*;

    fn roundtrip(line: &str) {
        let parsed = ContentLine::parse(line).unwrap();
        assert_eq!(parsed.to_string(), line, "round trip of `{line}`");
    }

    #[test]
    fn round_trips_are_byte_identical() {
        roundtrip("RRULE:FREQ=WEEKLY;WKST=WE");
        roundtrip("RRULE:FREQ=YEARLY;BYWEEKNO=1;BYDAY=MO");
        roundtrip("EXDATE;TZID=America/New_York:19970902T090000");
        roundtrip("EXDATE;VALUE=DATE:20240101,20240102,20240103");
        roundtrip("DTSTART;TZID=America/Los_Angeles:20241103T000000");
        // Parameter order and casing are preserved as written, even when
        // unconventional.
        roundtrip("dtstart;tzid=UTC;value=DATE-TIME:20240101T000000Z");
    }

    #[test]
    fn quoted_parameters() {
        let line = r#"DTSTART;TZID="Odd:Zone;Name":20240101T000000"#;
        let parsed = ContentLine::parse(line).unwrap();
        assert_eq!(parsed.param("TZID"), Some(r#""Odd:Zone;Name""#));
        assert_eq!(parsed.value(), "20240101T000000");
        assert_eq!(parsed.to_string(), line);
    }

    #[test]
    fn lookups_ignore_case() {
        let parsed =
            ContentLine::parse("ExDate;Tzid=UTC:20240101T000000Z").unwrap();
        assert!(parsed.is("EXDATE"));
        assert_eq!(parsed.param("TZID"), Some("UTC"));
    }

    #[test]
    fn rule_parts_keep_order() {
        let parsed = ContentLine::parse("RRULE:FREQ=WEEKLY;WKST=WE").unwrap();
        let parts = parsed.rule_parts().unwrap();
        assert_eq!(parts, vec![("FREQ", "WEEKLY"), ("WKST", "WE")]);
    }

    #[test]
    fn malformed_lines() {
        assert!(ContentLine::parse("RRULE").is_err());
        assert!(ContentLine::parse(":FREQ=DAILY").is_err());
        assert!(ContentLine::parse("RR ULE:FREQ=DAILY").is_err());
        assert!(ContentLine::parse("EXDATE;TZID:20240101").is_err());
        let parsed = ContentLine::parse("RRULE:FREQ=DAILY;COUNT").unwrap();
        assert!(parsed.rule_parts().is_err());
    }

    /// One bad line must not poison its siblings.
    #[test]
    fn block_isolates_failures() {
        let block = "DTSTART;TZID=UTC:19970902T090000\r\n\
                     BOGUS\n\
                     RRULE:FREQ=DAILY;COUNT=3\n";
        let lines = parse_block(block);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].is_ok());
        assert!(lines[1].is_err());
        assert!(lines[2].is_ok());

        assert!(parse_block_atomic(block).is_err());
    }

    #[test]
    fn date_tokens() {
        assert_eq!(
            DateToken::parse("19970902").unwrap(),
            DateToken::Date(date(1997, 9, 2)),
        );
        assert_eq!(
            DateToken::parse("19970902T090000").unwrap(),
            DateToken::DateTime { dt: date(1997, 9, 2).at(9, 0, 0, 0), utc: false },
        );
        assert_eq!(
            DateToken::parse("19970902T090000Z").unwrap(),
            DateToken::DateTime { dt: date(1997, 9, 2).at(9, 0, 0, 0), utc: true },
        );
        assert!(DateToken::parse("1997-09-02").is_err());
        assert!(DateToken::parse("19970230").is_err());
        assert!(DateToken::parse("19970902T2560").is_err());
    }
}
