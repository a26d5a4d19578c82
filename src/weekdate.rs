use {
    anyhow::Context,
    jiff::{
        ToSpan,
        civil::{Date, Weekday},
    },
};

/// A week numbering scheme.
///
/// Both schemes delimit weeks by a configurable start weekday (WKST in
/// RFC 5545 terms). They differ in which week is week one, and therefore
/// in which year a boundary week belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WeekNumbering {
    /// RFC 5545 week numbering: week one is the first week with at least
    /// four days in its year. A date near a year boundary can belong to
    /// week 52/53 of the previous year or week 1 of the next one, so the
    /// week year is not always the calendar year.
    Iso,
    /// The calendar provider's numbering: week one is the week containing
    /// January 1st, and every date belongs to its calendar year. Years
    /// under this scheme have 53 or 54 weeks.
    CalendarYear,
}

impl WeekNumbering {
    /// Returns the first day of week one of `year`, for weeks starting on
    /// `start`.
    ///
    /// The date returned always has weekday `start` and may fall in the
    /// previous calendar year.
    pub fn first_week_start(
        self,
        start: Weekday,
        year: i16,
    ) -> anyhow::Result<Date> {
        let pivot = match self {
            // RFC 5545 says week one is the first week with at least four
            // days in the year, which means January 4th is always in it.
            WeekNumbering::Iso => Date::new(year, 1, 4),
            WeekNumbering::CalendarYear => Date::new(year, 1, 1),
        }
        .with_context(|| {
            format!("year `{year}` has no week one for weeks on {start:?}")
        })?;
        let diff = pivot.weekday().since(start);
        pivot.checked_sub(diff.days()).with_context(|| {
            format!(
                "first week of `{year}` (weeks starting on {start:?}) \
                 is out of the supported range",
            )
        })
    }

    /// Returns the number of weeks in `year`.
    pub fn weeks_in_year(self, start: Weekday, year: i16) -> i8 {
        match self {
            WeekNumbering::Iso => {
                if is_long_year(start, year) { 53 } else { 52 }
            }
            WeekNumbering::CalendarYear => {
                let Ok(first) = self.first_week_start(start, year) else {
                    return 53;
                };
                let Ok(last) = Date::new(year, 12, 31) else { return 53 };
                // OK because `first` is never after December 31st.
                let days = first.until(last).unwrap().get_days();
                (days / 7) as i8 + 1
            }
        }
    }

    /// Returns the `(week year, week number)` pair for the given date.
    pub fn week_of(
        self,
        start: Weekday,
        date: Date,
    ) -> anyhow::Result<(i16, i8)> {
        let mut year = date.year();
        if self == WeekNumbering::CalendarYear {
            let first = self.first_week_start(start, year)?;
            // OK because week one always starts on or before January 1st.
            let days = first.until(date).unwrap().get_days();
            return Ok((year, (days / 7) as i8 + 1));
        }
        // A date may precede its own year's week one (it then belongs to
        // the previous week year) or land in week one of the next year.
        let mut first = self.first_week_start(start, year)?;
        if date < first {
            year -= 1;
            first = self.first_week_start(start, year)?;
        } else if let Ok(next) = self.first_week_start(start, year + 1) {
            if date >= next {
                year += 1;
                first = next;
            }
        }
        // OK because the branches above guarantee `first <= date`.
        let days = first.until(date).unwrap().get_days();
        Ok((year, (days / 7) as i8 + 1))
    }

    /// Returns the start date of week `week` of `year`, or `None` when the
    /// year has no such week. Week 53 of a short ISO year is the canonical
    /// empty case.
    ///
    /// `week` is one-based. Resolving a negative index against
    /// `weeks_in_year` is the caller's concern; zero is a programmer
    /// error.
    pub fn nth_week_start(
        self,
        start: Weekday,
        year: i16,
        week: i8,
    ) -> Option<Date> {
        assert!(week != 0, "week numbers are one-based");
        if week < 1 || week > self.weeks_in_year(start, year) {
            return None;
        }
        let first = self.first_week_start(start, year).ok()?;
        first.checked_add((i32::from(week) - 1).weeks()).ok()
    }
}

/// Returns the start of the week that the given date resides in.
pub fn first_of_week(start: Weekday, date: Date) -> anyhow::Result<Date> {
    if date.weekday() == start {
        return Ok(date);
    }
    date.nth_weekday(-1, start).with_context(|| {
        format!(
            "failed to find first day of week containing {date}, \
             for weeks starting on {start:?}",
        )
    })
}

/// Returns the end of the week that the given date resides in.
pub fn last_of_week(start: Weekday, date: Date) -> anyhow::Result<Date> {
    let last = start.wrapping_sub(1);
    if date.weekday() == last {
        return Ok(date);
    }
    date.nth_weekday(1, last).with_context(|| {
        format!(
            "failed to find last day of week containing {date}, \
             for weeks starting on {start:?}",
        )
    })
}

/// Returns true if the given week year (with weeks starting on `start`)
/// has 53 weeks under ISO-style numbering.
fn is_long_year(start: Weekday, year: i16) -> bool {
    let Ok(last) = Date::new(year, 12, 31) else { return false };
    let weekday = last.weekday();
    weekday == start.wrapping_add(3)
        || (last.in_leap_year() && weekday == start.wrapping_add(4))
}

#[cfg(test)]
mod tests {
    use jiff::civil::{Weekday::*, date};

    use super::*;

    /// Tests that ISO numbering with weeks starting on Monday agrees with
    /// Jiff's own ISO week dates, including across year boundaries.
    #[test]
    fn iso_consistent_with_jiff() {
        let dates = &[
            date(1996, 12, 30),
            date(1997, 1, 1),
            date(1997, 12, 28),
            date(1997, 12, 29),
            date(1998, 1, 4),
            date(2004, 12, 31),
            date(2005, 1, 1),
            date(2015, 12, 28),
            date(2020, 2, 29),
            date(2024, 12, 30),
        ];
        for &d in dates {
            let iso = d.iso_week_date();
            let (year, week) = WeekNumbering::Iso.week_of(Monday, d).unwrap();
            assert_eq!(
                (iso.year(), iso.week()),
                (year, week),
                "ISO week mismatch for {d}",
            );
        }
    }

    /// December 29th 1997 is a Monday and belongs to week one of 1998.
    #[test]
    fn iso_week_spillover() {
        let d = date(1997, 12, 29);
        assert_eq!(WeekNumbering::Iso.week_of(Monday, d).unwrap(), (1998, 1));
        assert_eq!(
            WeekNumbering::Iso.nth_week_start(Monday, 1998, 1),
            Some(d),
        );
    }

    #[test]
    fn iso_long_years() {
        // 2015 has 53 ISO weeks; 2014 and 2016 do not.
        assert_eq!(WeekNumbering::Iso.weeks_in_year(Monday, 2015), 53);
        assert_eq!(WeekNumbering::Iso.weeks_in_year(Monday, 2014), 52);
        assert_eq!(WeekNumbering::Iso.weeks_in_year(Monday, 2016), 52);

        assert!(WeekNumbering::Iso.nth_week_start(Monday, 2015, 53).is_some());
        assert_eq!(WeekNumbering::Iso.nth_week_start(Monday, 2014, 53), None);
    }

    #[test]
    fn calendar_year_numbering() {
        // January 1st 2015 is a Thursday, so with Monday weeks, week one
        // of 2015 starts on December 29th 2014.
        let first = WeekNumbering::CalendarYear
            .first_week_start(Monday, 2015)
            .unwrap();
        assert_eq!(first, date(2014, 12, 29));

        // Under calendar year numbering, December 29th 1997 is late in
        // 1997 rather than week one of 1998.
        let d = date(1997, 12, 29);
        assert_eq!(
            WeekNumbering::CalendarYear.week_of(Monday, d).unwrap(),
            (1997, 53),
        );

        // January 1st 2012 is a Sunday, the last day of a Monday week,
        // and 2012 is a leap year: its days spread across 54 week slots.
        assert_eq!(
            WeekNumbering::CalendarYear.weeks_in_year(Monday, 2012),
            54,
        );
        assert_eq!(
            WeekNumbering::CalendarYear.weeks_in_year(Monday, 2028),
            53,
        );
    }

    #[test]
    fn week_bounds() {
        let d = date(2025, 4, 16);
        assert_eq!(first_of_week(Monday, d).unwrap(), date(2025, 4, 14));
        assert_eq!(last_of_week(Monday, d).unwrap(), date(2025, 4, 20));
        assert_eq!(first_of_week(Wednesday, d).unwrap(), d);
        assert_eq!(last_of_week(Sunday, d).unwrap(), date(2025, 4, 19));
    }
}
