use std::{cmp::Ordering, collections::HashSet};

use {
    anyhow::Context,
    jiff::{
        ToSpan,
        civil::{Date, Weekday},
    },
};

use crate::weekdate::{WeekNumbering, first_of_week, last_of_week};

/// How much of the calendar a candidate date stands for.
///
/// A freshly stepped candidate stands for a whole year, month, week or
/// day depending on the rule's frequency. Filters refine candidates
/// toward `Day`; at `Day` every filter degenerates to a predicate.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Granularity {
    Year,
    Month,
    Week,
    Day,
}

/// A `(date, granularity)` pair emitted by a filter.
pub type Emitted = (Date, Granularity);

type Emit<'f> = Box<dyn Iterator<Item = Emitted> + 'f>;

/// One BYxxx constraint, as a pure generator over candidate dates.
///
/// Applying a filter to a candidate yields a lazy, finite, restartable
/// sequence of refined candidates. Filters hold no mutable state; all
/// iteration state lives in the iterators they hand out.
#[derive(Clone, Debug)]
pub enum Filter {
    /// BYMONTH.
    Months { months: Box<[i8]> },
    /// BYMONTHDAY. Negative values count from the end of the month.
    MonthDays { days: Box<[i8]> },
    /// BYYEARDAY. Negative values count from the end of the year.
    YearDays { days: Box<[i16]> },
    /// BYDAY, with or without ordinals.
    Weekdays { days: Box<[ByWeekday]>, week_start: Weekday },
    /// BYWEEKNO. Negative values count from the end of the week year.
    WeekNumbers {
        weeks: Box<[i8]>,
        week_start: Weekday,
        numbering: WeekNumbering,
    },
}

impl Filter {
    /// Creates a BYMONTH filter.
    pub fn months(months: Vec<i8>) -> anyhow::Result<Filter> {
        for &m in months.iter() {
            anyhow::ensure!(
                (1..=12).contains(&m),
                "invalid 'by month' value `{m}` \
                 (values must be in range 1..=12)",
            );
        }
        Ok(Filter::Months { months: sort_and_dedup(months) })
    }

    /// Creates a BYMONTHDAY filter.
    pub fn month_days(days: Vec<i8>) -> anyhow::Result<Filter> {
        for &d in days.iter() {
            anyhow::ensure!(
                (-31..=-1).contains(&d) || (1..=31).contains(&d),
                "invalid 'by day of the month' value `{d}` \
                 (values must be in range 1..=31 or -31..=-1)",
            );
        }
        Ok(Filter::MonthDays { days: sort_and_dedup(days) })
    }

    /// Creates a BYYEARDAY filter.
    pub fn year_days(days: Vec<i16>) -> anyhow::Result<Filter> {
        for &d in days.iter() {
            anyhow::ensure!(
                (-366..=-1).contains(&d) || (1..=366).contains(&d),
                "invalid 'by day of the year' value `{d}` \
                 (values must be in range 1..=366 or -366..=-1)",
            );
        }
        Ok(Filter::YearDays { days: sort_and_dedup(days) })
    }

    /// Creates a BYDAY filter.
    pub fn weekdays(
        days: Vec<ByWeekday>,
        week_start: Weekday,
    ) -> anyhow::Result<Filter> {
        for &d in days.iter() {
            if let ByWeekday::Numbered { nth, .. } = d {
                anyhow::ensure!(
                    (-53..=-1).contains(&nth) || (1..=53).contains(&nth),
                    "invalid numbered 'by week day' value `{d}` \
                     (ordinals must be in range 1..=53 or -53..=-1)",
                );
            }
        }
        Ok(Filter::Weekdays { days: sort_and_dedup(days), week_start })
    }

    /// Creates a BYWEEKNO filter.
    pub fn week_numbers(
        weeks: Vec<i8>,
        week_start: Weekday,
        numbering: WeekNumbering,
    ) -> anyhow::Result<Filter> {
        for &w in weeks.iter() {
            anyhow::ensure!(
                (-53..=-1).contains(&w) || (1..=53).contains(&w),
                "invalid 'by week' value `{w}` \
                 (values must be in range 1..=53 or -53..=-1)",
            );
        }
        Ok(Filter::WeekNumbers {
            weeks: sort_and_dedup(weeks),
            week_start,
            numbering,
        })
    }

    /// Applies this filter to a candidate, yielding refined candidates.
    ///
    /// Requesting something a period does not have (week 53 of a short
    /// year, February 30th) yields an empty sequence, never an error.
    pub fn apply(&self, date: Date, granularity: Granularity) -> Emit<'_> {
        match *self {
            Filter::Months { ref months } => match granularity {
                Granularity::Year => {
                    Box::new(months.iter().copied().filter_map(move |m| {
                        let d = Date::new(date.year(), m, date.day()).ok()?;
                        Some((d, Granularity::Month))
                    }))
                }
                _ => predicate(
                    months.binary_search(&date.month()).is_ok(),
                    date,
                    granularity,
                ),
            },
            Filter::MonthDays { ref days } => match granularity {
                Granularity::Year => {
                    Box::new((1..=12i8).flat_map(move |m| {
                        let month = Date::new(date.year(), m, 1).ok();
                        days.iter().copied().filter_map(move |day| {
                            let d = resolve_month_day(month?, day)?;
                            Some((d, Granularity::Day))
                        })
                    }))
                }
                Granularity::Month => {
                    Box::new(days.iter().copied().filter_map(move |day| {
                        let d = resolve_month_day(date.first_of_month(), day)?;
                        Some((d, Granularity::Day))
                    }))
                }
                _ => predicate(
                    matches_month_day(days, date),
                    date,
                    granularity,
                ),
            },
            Filter::YearDays { ref days } => match granularity {
                Granularity::Year => {
                    Box::new(days.iter().copied().filter_map(move |day| {
                        let days_in_year = date.days_in_year();
                        let day = if day < 0 {
                            days_in_year.checked_add(day + 1)?
                        } else {
                            day
                        };
                        let d = date.with().day_of_year(day).build().ok()?;
                        Some((d, Granularity::Day))
                    }))
                }
                _ => predicate(
                    matches_year_day(days, date),
                    date,
                    granularity,
                ),
            },
            Filter::Weekdays { ref days, week_start } => match granularity {
                Granularity::Year => {
                    let start = date.first_of_year();
                    let end = date.last_of_year();
                    Box::new(days.iter().copied().flat_map(move |by| {
                        by.emit_in_range(start, end)
                    }))
                }
                Granularity::Month => {
                    let start = date.first_of_month();
                    let end = date.last_of_month();
                    Box::new(days.iter().copied().flat_map(move |by| {
                        by.emit_in_range(start, end)
                    }))
                }
                Granularity::Week => {
                    let Ok(start) = first_of_week(week_start, date) else {
                        return Box::new(std::iter::empty());
                    };
                    let Ok(end) = last_of_week(week_start, date) else {
                        return Box::new(std::iter::empty());
                    };
                    Box::new(days.iter().copied().flat_map(move |by| {
                        by.emit_in_range(start, end)
                    }))
                }
                Granularity::Day => predicate(
                    days.iter().any(|by| by.weekday() == date.weekday()),
                    date,
                    granularity,
                ),
            },
            Filter::WeekNumbers { ref weeks, week_start, numbering } => {
                match granularity {
                    Granularity::Year => {
                        let year = date.year();
                        let total = numbering.weeks_in_year(week_start, year);
                        Box::new(weeks.iter().copied().filter_map(
                            move |mut week| {
                                if week < 0 {
                                    // Plus one because -1 is the last week
                                    // and week numbers are one-indexed.
                                    week = total.checked_add(week + 1)?;
                                    if week < 1 {
                                        return None;
                                    }
                                }
                                let d = numbering
                                    .nth_week_start(week_start, year, week)?;
                                Some((d, Granularity::Week))
                            },
                        ))
                    }
                    _ => predicate(
                        matches_week(weeks, week_start, numbering, date),
                        date,
                        granularity,
                    ),
                }
            }
        }
    }
}

/// Conjunction of filters, applied by nested depth-first expansion.
pub fn compose(filters: &[Filter]) -> Composed<'_> {
    Composed { filters }
}

#[derive(Clone, Copy, Debug)]
pub struct Composed<'f> {
    filters: &'f [Filter],
}

impl<'f> Composed<'f> {
    /// Expands one candidate through every filter in order.
    ///
    /// The expansion is an iterative depth-first walk: an explicit stack
    /// holds one sub-iterator per filter, each advanced lazily, so a date
    /// costs amortized constant work no matter how wide the intermediate
    /// periods are. Emitted dates are deduplicated by final date.
    pub fn expand(&self, date: Date, granularity: Granularity) -> Expansion<'f> {
        let seed: Emit<'f> = match self.filters.first() {
            None => Box::new(std::iter::once((date, granularity))),
            Some(first) => first.apply(date, granularity),
        };
        Expansion {
            filters: self.filters,
            stack: vec![seed],
            seen: HashSet::new(),
        }
    }
}

/// The lazy output of composing filters over one candidate.
pub struct Expansion<'f> {
    filters: &'f [Filter],
    /// `stack[d]` iterates the output of `filters[d]`; emissions from the
    /// deepest level are final.
    stack: Vec<Emit<'f>>,
    seen: HashSet<Date>,
}

impl<'f> Iterator for Expansion<'f> {
    type Item = Emitted;

    fn next(&mut self) -> Option<Emitted> {
        let filters = self.filters;
        let final_depth = filters.len().max(1);
        loop {
            let depth = self.stack.len();
            let top = self.stack.last_mut()?;
            let Some((date, granularity)) = top.next() else {
                self.stack.pop();
                if self.stack.is_empty() {
                    return None;
                }
                continue;
            };
            if depth == final_depth {
                if self.seen.insert(date) {
                    return Some((date, granularity));
                }
            } else {
                self.stack.push(filters[depth].apply(date, granularity));
            }
        }
    }
}

impl<'f> std::iter::FusedIterator for Expansion<'f> {}

/// A BYDAY entry: a weekday, optionally qualified by an ordinal within
/// the enclosing period (positive from the period start, negative from
/// its end).
///
/// `Ord` exists to make sorting and deduplicating collections of these
/// easy; the ordering itself is never used to sequence dates, since that
/// would require fixing a week start.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ByWeekday {
    Any(Weekday),
    Numbered { nth: i8, weekday: Weekday },
}

impl ByWeekday {
    /// Returns the weekday, disregarding any ordinal.
    pub fn weekday(&self) -> Weekday {
        match *self {
            ByWeekday::Any(weekday) => weekday,
            ByWeekday::Numbered { weekday, .. } => weekday,
        }
    }

    /// Emits this entry's dates within `start..=end`: every matching
    /// weekday for a plain entry, at most one date for an ordinal one.
    fn emit_in_range(
        self,
        start: Date,
        end: Date,
    ) -> impl Iterator<Item = Emitted> {
        let (walk, nth) = match self {
            ByWeekday::Any(weekday) => {
                (Some(weekdays_between(weekday, start, end)), None)
            }
            ByWeekday::Numbered { nth, weekday } => {
                (None, nth_weekday_in_range(nth, weekday, start, end))
            }
        };
        walk.into_iter()
            .flatten()
            .chain(nth)
            .map(|d| (d, Granularity::Day))
    }
}

impl Ord for ByWeekday {
    fn cmp(&self, rhs: &ByWeekday) -> Ordering {
        let key = |by: &ByWeekday| match *by {
            ByWeekday::Any(weekday) => (0i8, weekday.to_monday_one_offset()),
            ByWeekday::Numbered { nth, weekday } => {
                (nth, weekday.to_monday_one_offset())
            }
        };
        key(self).cmp(&key(rhs)).then_with(|| {
            let rank = |by: &ByWeekday| {
                matches!(by, ByWeekday::Numbered { .. }) as u8
            };
            rank(self).cmp(&rank(rhs))
        })
    }
}

impl PartialOrd for ByWeekday {
    fn partial_cmp(&self, rhs: &ByWeekday) -> Option<Ordering> {
        Some(self.cmp(rhs))
    }
}

impl std::str::FromStr for ByWeekday {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<ByWeekday> {
        let split = s.len().saturating_sub(2);
        anyhow::ensure!(
            s.is_char_boundary(split),
            "`{s}` is not a valid weekday entry",
        );
        let (nth, code) = (&s[..split], &s[split..]);
        let weekday = parse_weekday(code)
            .with_context(|| format!("failed to parse weekday in `{s}`"))?;
        if nth.is_empty() {
            return Ok(ByWeekday::Any(weekday));
        }
        let nth = nth.parse().with_context(|| {
            format!("failed to parse `{nth}` as an integer weekday ordinal")
        })?;
        anyhow::ensure!(nth != 0, "weekday ordinal in `{s}` may not be zero");
        Ok(ByWeekday::Numbered { nth, weekday })
    }
}

impl std::fmt::Display for ByWeekday {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let ByWeekday::Numbered { nth, .. } = *self {
            write!(f, "{nth}")?;
        }
        write!(f, "{}", weekday_code(self.weekday()))
    }
}

/// Parses an RFC 5545 two-letter weekday code.
pub(crate) fn parse_weekday(code: &str) -> anyhow::Result<Weekday> {
    let weekday = match &*code.to_ascii_uppercase() {
        "MO" => Weekday::Monday,
        "TU" => Weekday::Tuesday,
        "WE" => Weekday::Wednesday,
        "TH" => Weekday::Thursday,
        "FR" => Weekday::Friday,
        "SA" => Weekday::Saturday,
        "SU" => Weekday::Sunday,
        unk => anyhow::bail!("unrecognized weekday code: `{unk}`"),
    };
    Ok(weekday)
}

pub(crate) fn weekday_code(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Monday => "MO",
        Weekday::Tuesday => "TU",
        Weekday::Wednesday => "WE",
        Weekday::Thursday => "TH",
        Weekday::Friday => "FR",
        Weekday::Saturday => "SA",
        Weekday::Sunday => "SU",
    }
}

fn sort_and_dedup<T: Clone + Ord>(values: Vec<T>) -> Box<[T]> {
    let mut values = values;
    values.sort();
    values.dedup();
    values.into_boxed_slice()
}

/// An emission of zero or one `(date, granularity)` pairs, for the
/// predicate degenerations of each filter.
fn predicate<'f>(
    keep: bool,
    date: Date,
    granularity: Granularity,
) -> Emit<'f> {
    if keep {
        Box::new(std::iter::once((date, granularity)))
    } else {
        Box::new(std::iter::empty())
    }
}

fn resolve_month_day(first_of_month: Date, day: i8) -> Option<Date> {
    let days_in_month = first_of_month.days_in_month();
    let day = if day < 0 {
        // Plus one because -1 is the last day of the month and the days
        // of the month are one-indexed.
        days_in_month.checked_add(day + 1)?
    } else {
        day
    };
    Date::new(first_of_month.year(), first_of_month.month(), day).ok()
}

fn matches_month_day(days: &[i8], date: Date) -> bool {
    let positive = date.day();
    let negative = positive - 1 - date.days_in_month();
    days.binary_search(&positive).is_ok()
        || days.binary_search(&negative).is_ok()
}

fn matches_year_day(days: &[i16], date: Date) -> bool {
    let positive = date.day_of_year();
    let negative = positive - 1 - date.days_in_year();
    days.binary_search(&positive).is_ok()
        || days.binary_search(&negative).is_ok()
}

fn matches_week(
    weeks: &[i8],
    week_start: Weekday,
    numbering: WeekNumbering,
    date: Date,
) -> bool {
    let Ok((week_year, week)) = numbering.week_of(week_start, date) else {
        return false;
    };
    weeks.iter().any(|&w| {
        let resolved = if w < 0 {
            numbering.weeks_in_year(week_start, week_year) + w + 1
        } else {
            w
        };
        resolved == week
    })
}

/// Walks every date with the given weekday in `start..=end`, in order.
fn weekdays_between(
    weekday: Weekday,
    start: Date,
    end: Date,
) -> impl Iterator<Item = Date> {
    let mut cur = if start.weekday() == weekday {
        Some(start)
    } else {
        start.nth_weekday(1, weekday).ok()
    };
    std::iter::from_fn(move || {
        let next = cur.take()?;
        if next > end {
            return None;
        }
        cur = next.nth_weekday(1, weekday).ok();
        Some(next)
    })
}

/// Resolves an ordinal weekday within `start..=end`: positive ordinals
/// count matching weekdays from `start`, negative ones from `end`.
pub(crate) fn nth_weekday_in_range(
    nth: i8,
    weekday: Weekday,
    start: Date,
    end: Date,
) -> Option<Date> {
    let date = if nth > 0 {
        let first = if start.weekday() == weekday {
            start
        } else {
            start.nth_weekday(1, weekday).ok()?
        };
        first.checked_add((i32::from(nth) - 1).weeks()).ok()?
    } else {
        let last = if end.weekday() == weekday {
            end
        } else {
            end.nth_weekday(-1, weekday).ok()?
        };
        last.checked_sub((i32::from(-nth) - 1).weeks()).ok()?
    };
    (start <= date && date <= end).then_some(date)
}

#[cfg(test)]
mod tests {
    use jiff::civil::{Weekday::*, date};

    use super::*;

    fn dates(it: impl Iterator<Item = Emitted>) -> Vec<Date> {
        it.map(|(d, _)| d).collect()
    }

    #[test]
    fn months_expand_and_limit() {
        let f = Filter::months(vec![5, 2]).unwrap();
        assert_eq!(
            dates(f.apply(date(2025, 1, 15), Granularity::Year)),
            vec![date(2025, 2, 15), date(2025, 5, 15)],
        );
        // The day is carried from the candidate; a month without it
        // contributes nothing.
        let f = Filter::months(vec![2]).unwrap();
        assert_eq!(
            dates(f.apply(date(2025, 1, 31), Granularity::Year)),
            vec![],
        );
        // At finer granularities the filter only limits.
        assert_eq!(
            dates(f.apply(date(2025, 2, 10), Granularity::Day)),
            vec![date(2025, 2, 10)],
        );
        assert_eq!(dates(f.apply(date(2025, 3, 10), Granularity::Day)), vec![]);
    }

    #[test]
    fn negative_month_days() {
        let f = Filter::month_days(vec![-1]).unwrap();
        assert_eq!(
            dates(f.apply(date(2014, 2, 1), Granularity::Month)),
            vec![date(2014, 2, 28)],
        );
        assert_eq!(
            dates(f.apply(date(2016, 2, 1), Granularity::Month)),
            vec![date(2016, 2, 29)],
        );
        // February 30th simply does not exist: empty, not an error.
        let f = Filter::month_days(vec![30]).unwrap();
        assert_eq!(dates(f.apply(date(2014, 2, 1), Granularity::Month)), vec![]);
    }

    #[test]
    fn year_days_respect_leap_years() {
        let f = Filter::year_days(vec![60, -1]).unwrap();
        assert_eq!(
            dates(f.apply(date(2016, 1, 1), Granularity::Year)),
            vec![date(2016, 2, 29), date(2016, 12, 31)],
        );
        assert_eq!(
            dates(f.apply(date(2015, 1, 1), Granularity::Year)),
            vec![date(2015, 3, 1), date(2015, 12, 31)],
        );
        let f = Filter::year_days(vec![-366]).unwrap();
        assert_eq!(
            dates(f.apply(date(2015, 1, 1), Granularity::Year)),
            vec![],
        );
        assert_eq!(
            dates(f.apply(date(2016, 1, 1), Granularity::Year)),
            vec![date(2016, 1, 1)],
        );
    }

    #[test]
    fn ordinal_weekdays() {
        let f = Filter::weekdays(
            vec![
                ByWeekday::Numbered { nth: 1, weekday: Monday },
                ByWeekday::Numbered { nth: -1, weekday: Friday },
            ],
            Monday,
        )
        .unwrap();
        let mut got = dates(f.apply(date(2025, 4, 10), Granularity::Month));
        got.sort();
        assert_eq!(got, vec![date(2025, 4, 7), date(2025, 4, 25)]);

        // The 53rd Monday exists in some years only.
        let f = Filter::weekdays(
            vec![ByWeekday::Numbered { nth: 53, weekday: Monday }],
            Monday,
        )
        .unwrap();
        assert_eq!(dates(f.apply(date(2025, 1, 1), Granularity::Year)), vec![]);
        assert_eq!(
            dates(f.apply(date(2024, 1, 1), Granularity::Year)),
            vec![date(2024, 12, 30)],
        );
    }

    #[test]
    fn weekdays_within_week() {
        let f = Filter::weekdays(
            vec![ByWeekday::Any(Tuesday), ByWeekday::Any(Sunday)],
            Monday,
        )
        .unwrap();
        let mut got = dates(f.apply(date(2025, 4, 16), Granularity::Week));
        got.sort();
        assert_eq!(got, vec![date(2025, 4, 15), date(2025, 4, 20)]);
    }

    #[test]
    fn week_53_of_a_short_year_is_empty() {
        let f =
            Filter::week_numbers(vec![53], Monday, WeekNumbering::Iso).unwrap();
        assert_eq!(dates(f.apply(date(2014, 1, 1), Granularity::Year)), vec![]);
        assert_eq!(
            dates(f.apply(date(2015, 1, 1), Granularity::Year)),
            vec![date(2015, 12, 28)],
        );
    }

    #[test]
    fn negative_week_numbers() {
        let f = Filter::week_numbers(vec![-1], Monday, WeekNumbering::Iso)
            .unwrap();
        // Week -1 of 2015 is week 53; of 2014, week 52.
        assert_eq!(
            dates(f.apply(date(2015, 1, 1), Granularity::Year)),
            vec![date(2015, 12, 28)],
        );
        assert_eq!(
            dates(f.apply(date(2014, 1, 1), Granularity::Year)),
            vec![date(2014, 12, 22)],
        );
    }

    #[test]
    fn composition_is_conjunction() {
        // Every Friday falling on the 13th, within one year.
        let filters = vec![
            Filter::month_days(vec![13]).unwrap(),
            Filter::weekdays(vec![ByWeekday::Any(Friday)], Monday).unwrap(),
        ];
        let composed = compose(&filters);
        let mut got = dates(composed.expand(date(2025, 1, 1), Granularity::Year));
        got.sort();
        assert_eq!(got, vec![date(2025, 6, 13)]);
    }

    /// Overlapping constraints may select the same date more than once;
    /// the composition emits it once.
    #[test]
    fn composition_deduplicates() {
        let filters =
            vec![Filter::month_days(vec![31, -1]).unwrap()];
        let composed = compose(&filters);
        let got = dates(composed.expand(date(2025, 1, 1), Granularity::Month));
        assert_eq!(got, vec![date(2025, 1, 31)]);
    }

    /// Expansions are restartable: the same composition expands any
    /// number of candidates independently.
    #[test]
    fn expansion_is_restartable() {
        let filters = vec![Filter::months(vec![2]).unwrap()];
        let composed = compose(&filters);
        let first = dates(composed.expand(date(2025, 1, 10), Granularity::Year));
        let again = dates(composed.expand(date(2025, 1, 10), Granularity::Year));
        assert_eq!(first, again);
    }

    #[test]
    fn empty_composition_is_identity() {
        let composed = compose(&[]);
        assert_eq!(
            dates(composed.expand(date(2025, 4, 16), Granularity::Day)),
            vec![date(2025, 4, 16)],
        );
    }

    #[test]
    fn by_weekday_text() {
        let by: ByWeekday = "MO".parse().unwrap();
        assert_eq!(by, ByWeekday::Any(Monday));
        let by: ByWeekday = "-1FR".parse().unwrap();
        assert_eq!(by, ByWeekday::Numbered { nth: -1, weekday: Friday });
        let by: ByWeekday = "2sa".parse().unwrap();
        assert_eq!(by, ByWeekday::Numbered { nth: 2, weekday: Saturday });
        assert_eq!(by.to_string(), "2SA");
        assert!("0MO".parse::<ByWeekday>().is_err());
        assert!("XX".parse::<ByWeekday>().is_err());
    }

    #[test]
    fn filter_construction_errors() {
        assert!(Filter::months(vec![13]).is_err());
        assert!(Filter::month_days(vec![0]).is_err());
        assert!(Filter::year_days(vec![367]).is_err());
        assert!(
            Filter::week_numbers(vec![0], Monday, WeekNumbering::Iso).is_err()
        );
    }
}
