use std::{collections::BTreeSet, sync::Arc};

use {
    anyhow::Context,
    jiff::{
        Span, ToSpan,
        civil::{Date, DateTime, Weekday},
    },
};

use crate::{
    filter::{ByWeekday, Filter, Granularity, compose, parse_weekday},
    instant::{Instant, UtcOffset},
    line::{ContentLine, DateToken, parse_block},
    weekdate::WeekNumbering,
    zone::{LogicalZone, TransitionTable},
};

/// How many consecutive fruitless interval steps the generator tolerates
/// before declaring a rule non-terminating. An impossible constraint like
/// "February 30th, yearly" never produces a date, and without this bound
/// the stepper would walk to the end of the calendar looking for one.
const DEFAULT_STEP_LIMIT: u32 = 1000;

/// How far past the UNTIL horizon the stepper is allowed to wander before
/// giving up on a step producing admissible dates. Week number expansion
/// can reach one week behind a period start; nothing reaches further.
const UNTIL_SLACK_DAYS: i32 = 35;

/// The frequency of a recurrence rule.
///
/// The provider generates recurrences at day granularity and coarser;
/// sub-daily frequencies are rejected at parse time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Frequency {
    Yearly,
    Monthly,
    Weekly,
    Daily,
}

impl Frequency {
    fn unit(self) -> Span {
        match self {
            Frequency::Yearly => 1.year(),
            Frequency::Monthly => 1.month(),
            Frequency::Weekly => 1.week(),
            Frequency::Daily => 1.day(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Frequency::Yearly => "yearly",
            Frequency::Monthly => "monthly",
            Frequency::Weekly => "weekly",
            Frequency::Daily => "daily",
        }
    }
}

impl std::str::FromStr for Frequency {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Frequency> {
        let freq = match &*s.to_ascii_uppercase() {
            "YEARLY" => Frequency::Yearly,
            "MONTHLY" => Frequency::Monthly,
            "WEEKLY" => Frequency::Weekly,
            "DAILY" => Frequency::Daily,
            "HOURLY" | "MINUTELY" | "SECONDLY" => anyhow::bail!(
                "sub-daily frequency `{s}` is not supported",
            ),
            unk => anyhow::bail!("unrecognized frequency: `{unk}`"),
        };
        Ok(freq)
    }
}

/// The end bound of a recurrence rule.
///
/// The provider's UNTIL semantics depend on whether a time of day is
/// present: a bare date excludes its entire day, while a date-time is an
/// inclusive bound.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Until {
    Date(Date),
    DateTime(DateTime),
}

impl Until {
    fn admits(self, dt: DateTime) -> bool {
        match self {
            Until::Date(d) => dt.date() < d,
            Until::DateTime(u) => dt <= u,
        }
    }

    fn horizon(self) -> Date {
        match self {
            Until::Date(d) => d,
            Until::DateTime(u) => u.date(),
        }
    }
}

/// A set of dates and datetimes to suppress from a rule's output.
///
/// A date-only entry suppresses every occurrence on that local day; a
/// date-time entry suppresses only the exact local reading.
#[derive(Clone, Debug, Default)]
pub struct ExceptionSet {
    dates: BTreeSet<Date>,
    date_times: BTreeSet<DateTime>,
}

impl ExceptionSet {
    pub fn new() -> ExceptionSet {
        ExceptionSet::default()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty() && self.date_times.is_empty()
    }

    pub fn insert_date(&mut self, date: Date) {
        self.dates.insert(date);
    }

    pub fn insert_date_time(&mut self, dt: DateTime) {
        self.date_times.insert(dt);
    }

    /// Returns true if the given occurrence is suppressed.
    pub fn contains(&self, dt: DateTime) -> bool {
        self.dates.contains(&dt.date()) || self.date_times.contains(&dt)
    }

    pub fn extend(&mut self, other: ExceptionSet) {
        self.dates.extend(other.dates);
        self.date_times.extend(other.date_times);
    }

    /// Parses the exception dates of a single `EXDATE` line.
    pub fn parse_line(line: &ContentLine) -> anyhow::Result<ExceptionSet> {
        anyhow::ensure!(
            line.is("EXDATE"),
            "expected an EXDATE line, got `{}`",
            line.name(),
        );
        let mut set = ExceptionSet::new();
        for token in line.values() {
            match DateToken::parse(token.trim()).with_context(|| {
                format!("failed to parse exception date in `{line}`")
            })? {
                DateToken::Date(date) => set.insert_date(date),
                DateToken::DateTime { dt, .. } => set.insert_date_time(dt),
            }
        }
        Ok(set)
    }
}

/// A parsed `DTSTART` line: the rule's starting point and its zone.
#[derive(Clone, Debug)]
pub struct DtStart {
    pub zone: LogicalZone,
    pub datetime: DateTime,
    pub date_only: bool,
}

impl DtStart {
    pub fn parse(line: &ContentLine) -> anyhow::Result<DtStart> {
        anyhow::ensure!(
            line.is("DTSTART"),
            "expected a DTSTART line, got `{}`",
            line.name(),
        );
        let token =
            DateToken::parse(line.value().trim()).with_context(|| {
                format!("failed to parse start date in `{line}`")
            })?;
        let tzid = match line.param("TZID") {
            None => None,
            Some(tzid) => Some(tzid.parse::<LogicalZone>()?),
        };
        // A floating start (no TZID, no Z suffix) is pinned to UTC; the
        // provider resolves floating times against the calendar's own
        // zone, which is outside this crate's model.
        let zone = tzid.unwrap_or(LogicalZone::Utc);
        let start = match token {
            DateToken::Date(date) => DtStart {
                zone,
                datetime: date.at(0, 0, 0, 0),
                date_only: true,
            },
            DateToken::DateTime { dt, .. } => {
                DtStart { zone, datetime: dt, date_only: false }
            }
        };
        Ok(start)
    }
}

/// The RFC 5545 recurrence rule implementation, with the provider's
/// deviations layered in.
#[derive(Clone, Debug)]
pub struct RecurrenceRule {
    inner: Arc<RuleInner>,
}

#[derive(Debug)]
struct RuleInner {
    freq: Frequency,
    start: DateTime,
    date_only: bool,
    zone: LogicalZone,
    interval: i32,
    count: Option<u32>,
    until: Option<Until>,
    week_start: Weekday,
    numbering: WeekNumbering,
    by_month: Box<[i8]>,
    // can be negative
    by_week: Box<[i8]>,
    // can be negative
    by_year_day: Box<[i16]>,
    // can be negative
    by_month_day: Box<[i8]>,
    by_week_day: Box<[ByWeekday]>,
    /// The composed filter chain, in evaluation order.
    filters: Box<[Filter]>,
    exceptions: ExceptionSet,
    step_limit: u32,
    /// The stepping span: the frequency unit times the interval, except
    /// that monthly rules with BYWEEKNO step by weeks instead.
    step_span: Span,
}

impl RecurrenceRule {
    /// Returns a builder for constructing a `RecurrenceRule`.
    ///
    /// The frequency and the starting point are the only two things
    /// required to create a rule; a rule without a frequency is
    /// unrepresentable.
    pub fn builder(freq: Frequency, start: DateTime) -> RecurrenceRuleBuilder {
        RecurrenceRuleBuilder::new(freq, start)
    }

    /// Parses a rule from an `RRULE` content line and its `DTSTART`.
    ///
    /// The returned builder can be adjusted (exception dates, week
    /// numbering mode) before building.
    pub fn from_line(
        line: &ContentLine,
        start: &DtStart,
    ) -> anyhow::Result<RecurrenceRuleBuilder> {
        anyhow::ensure!(
            line.is("RRULE"),
            "expected an RRULE line, got `{}`",
            line.name(),
        );
        let parts = line.rule_parts()?;
        let freq = parts
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("FREQ"))
            .map(|&(_, value)| value)
            .context("recurrence rule is missing its FREQ part")?
            .parse::<Frequency>()?;
        let mut builder = RecurrenceRule::builder(freq, start.datetime);
        builder.zone(start.zone.clone()).date_only(start.date_only);
        for (key, value) in parts {
            match &*key.to_ascii_uppercase() {
                "FREQ" => {}
                "INTERVAL" => {
                    let interval = value.parse().with_context(|| {
                        format!("failed to parse INTERVAL value `{value}`")
                    })?;
                    builder.interval(interval);
                }
                "COUNT" => {
                    let count = value.parse().with_context(|| {
                        format!("failed to parse COUNT value `{value}`")
                    })?;
                    builder.count(count);
                }
                "UNTIL" => {
                    let until = match DateToken::parse(value).with_context(
                        || format!("failed to parse UNTIL value `{value}`"),
                    )? {
                        DateToken::Date(d) => Until::Date(d),
                        // The time is compared as written, in the rule's
                        // own local time.
                        DateToken::DateTime { dt, .. } => Until::DateTime(dt),
                    };
                    builder.until(until);
                }
                "WKST" => {
                    builder.week_start(parse_weekday(value)?);
                }
                "BYDAY" => {
                    builder.by_week_day(parse_list::<ByWeekday>(value)?);
                }
                "BYMONTH" => {
                    builder.by_month(parse_list::<i8>(value)?);
                }
                "BYMONTHDAY" => {
                    builder.by_month_day(parse_list::<i8>(value)?);
                }
                "BYYEARDAY" => {
                    builder.by_year_day(parse_list::<i16>(value)?);
                }
                "BYWEEKNO" => {
                    builder.by_week(parse_list::<i8>(value)?);
                }
                "BYHOUR" | "BYMINUTE" | "BYSECOND" | "BYSETPOS" => {
                    anyhow::bail!("rule part `{key}` is not supported");
                }
                _ => anyhow::bail!("unrecognized rule part `{key}`"),
            }
        }
        Ok(builder)
    }

    /// Returns an iterator over all civil datetimes in this recurrence
    /// rule.
    ///
    /// The iterator may be "infinite" for an unbounded rule; callers
    /// should specify `count`/`until` or bound consumption themselves,
    /// e.g. with [`Occurrences`].
    pub fn iter(&self) -> OccurrenceIter {
        let inner = &self.inner;
        let pending_start = inner.leading_start();
        OccurrenceIter {
            rule: self.clone(),
            step: 0,
            buffer: vec![],
            pending_start,
            last: None,
            emitted: 0,
            barren: 0,
            emitted_since_refill: true,
            termination: Termination::Running,
        }
    }

    /// Returns an incremental pump over this rule's occurrences.
    pub fn occurrences(&self) -> Occurrences {
        Occurrences {
            iter: self.iter(),
            lookahead: None,
            generated: vec![],
            returned: 0,
        }
    }

    /// Returns an iterator that projects each occurrence onto a concrete
    /// instant and offset through the given transition table, preserving
    /// the start's wall clock reading the way the provider does.
    pub fn projected<'t>(&self, table: &'t TransitionTable) -> Projected<'t> {
        Projected { iter: self.iter(), table, original: self.inner.start }
    }

    /// The logical zone this rule's occurrences belong to.
    pub fn zone(&self) -> &LogicalZone {
        &self.inner.zone
    }

    /// True when the rule was built from a date-only start.
    pub fn is_date_only(&self) -> bool {
        self.inner.date_only
    }

    pub fn frequency(&self) -> Frequency {
        self.inner.freq
    }

    pub fn interval(&self) -> i32 {
        self.inner.interval
    }

    pub fn count(&self) -> Option<u32> {
        self.inner.count
    }

    pub fn until(&self) -> Option<Until> {
        self.inner.until
    }

    pub fn week_start(&self) -> Weekday {
        self.inner.week_start
    }

    pub fn week_numbering(&self) -> WeekNumbering {
        self.inner.numbering
    }
}

impl<'r> IntoIterator for &'r RecurrenceRule {
    type IntoIter = OccurrenceIter;
    type Item = DateTime;

    fn into_iter(self) -> OccurrenceIter {
        self.iter()
    }
}

impl RuleInner {
    fn admits_until(&self, dt: DateTime) -> bool {
        self.until.is_none_or(|until| until.admits(dt))
    }

    fn step_granularity(&self) -> Granularity {
        match self.freq {
            Frequency::Yearly => Granularity::Year,
            // With BYWEEKNO the provider steps monthly rules week by
            // week, so candidates stand for weeks.
            Frequency::Monthly if !self.by_week.is_empty() => {
                Granularity::Week
            }
            Frequency::Monthly => Granularity::Month,
            Frequency::Weekly => Granularity::Week,
            Frequency::Daily => Granularity::Day,
        }
    }

    /// Materializes a final `(date, granularity)` emission: coarser
    /// granularities inherit the missing pieces from the start date.
    fn resolve_final(&self, date: Date, granularity: Granularity) -> Option<Date> {
        match granularity {
            Granularity::Day | Granularity::Year => Some(date),
            Granularity::Week => {
                let target = self.start.date().weekday();
                if date.weekday() == target {
                    Some(date)
                } else {
                    date.nth_weekday(1, target).ok()
                }
            }
            Granularity::Month => {
                Date::new(date.year(), date.month(), self.start.date().day())
                    .ok()
            }
        }
    }

    /// The literal start, queued as a separate leading occurrence when
    /// BYDAY is present and the start satisfies it. Yearly BYWEEKNO rules
    /// are the exception: their base generator already covers the start.
    fn leading_start(&self) -> Option<DateTime> {
        if self.by_week_day.is_empty() {
            return None;
        }
        if self.freq == Frequency::Yearly && !self.by_week.is_empty() {
            return None;
        }
        self.start_matches_by_day().then_some(self.start)
    }

    fn start_matches_by_day(&self) -> bool {
        let date = self.start.date();
        self.by_week_day.iter().any(|by| match *by {
            ByWeekday::Any(weekday) => weekday == date.weekday(),
            ByWeekday::Numbered { nth, weekday } => {
                let (start, end) = self.ordinal_period(date);
                crate::filter::nth_weekday_in_range(nth, weekday, start, end)
                    == Some(date)
            }
        })
    }

    /// The period an ordinal BYDAY counts within: the month for monthly
    /// rules (and yearly rules constrained by BYMONTH), the year
    /// otherwise.
    fn ordinal_period(&self, date: Date) -> (Date, Date) {
        let monthly = self.freq == Frequency::Monthly
            || (self.freq == Frequency::Yearly && !self.by_month.is_empty());
        if monthly {
            (date.first_of_month(), date.last_of_month())
        } else {
            (date.first_of_year(), date.last_of_year())
        }
    }
}

/// A builder for constructing a valid recurrence rule.
#[derive(Clone, Debug)]
pub struct RecurrenceRuleBuilder {
    freq: Frequency,
    start: DateTime,
    date_only: bool,
    zone: LogicalZone,
    interval: i32,
    count: Option<u32>,
    until: Option<Until>,
    week_start: Weekday,
    numbering: WeekNumbering,
    by_month: Vec<i8>,
    by_week: Vec<i8>,
    by_year_day: Vec<i16>,
    by_month_day: Vec<i8>,
    by_week_day: Vec<ByWeekday>,
    exceptions: ExceptionSet,
    step_limit: u32,
}

impl RecurrenceRuleBuilder {
    fn new(freq: Frequency, start: DateTime) -> RecurrenceRuleBuilder {
        RecurrenceRuleBuilder {
            freq,
            start,
            date_only: false,
            zone: LogicalZone::Utc,
            interval: 1,
            count: None,
            until: None,
            week_start: Weekday::Monday,
            numbering: WeekNumbering::Iso,
            by_month: vec![],
            by_week: vec![],
            by_year_day: vec![],
            by_month_day: vec![],
            by_week_day: vec![],
            exceptions: ExceptionSet::new(),
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    pub fn build(&self) -> anyhow::Result<RecurrenceRule> {
        anyhow::ensure!(
            self.interval >= 1,
            "interval value of `{}` is invalid \
             (interval must be greater than or equal to 1)",
            self.interval,
        );
        if let Some(count) = self.count {
            anyhow::ensure!(
                count >= 1,
                "count value of `{count}` is invalid \
                 (count must be greater than or equal to 1)",
            );
        }
        anyhow::ensure!(
            self.step_limit >= 1,
            "the step safety limit must be at least 1",
        );

        // Frequency restrictions, mostly straight from RFC 5545. The
        // provider departs in one place: BYWEEKNO is accepted for monthly
        // and weekly rules, which then step weekly.
        if !self.by_week.is_empty() {
            anyhow::ensure!(
                self.freq != Frequency::Daily,
                "'by week' cannot be used with daily frequency",
            );
        }
        if !self.by_year_day.is_empty() {
            anyhow::ensure!(
                !matches!(
                    self.freq,
                    Frequency::Monthly | Frequency::Weekly | Frequency::Daily
                ),
                "'by day of the year' cannot be used \
                 with monthly, weekly or daily frequency",
            );
        }
        if !self.by_month_day.is_empty() {
            anyhow::ensure!(
                self.freq != Frequency::Weekly,
                "'by day of the month' cannot be used with weekly frequency",
            );
        }
        for &by in self.by_week_day.iter() {
            let ByWeekday::Numbered { .. } = by else { continue };
            anyhow::ensure!(
                matches!(self.freq, Frequency::Yearly | Frequency::Monthly),
                "numbered weekday `{by}` is only allowed at \
                 yearly or monthly frequencies",
            );
            anyhow::ensure!(
                self.by_week.is_empty(),
                "numbered weekday `{by}` is not allowed \
                 when 'by week' is used",
            );
        }

        let filters = self.filters()?;
        let step_span = self
            .step_unit()
            .checked_mul(i64::from(self.interval))
            .with_context(|| {
                format!(
                    "could not convert {freq} interval of `{interval}` to \
                     a time span",
                    freq = self.freq.as_str(),
                    interval = self.interval,
                )
            })?;
        let inner = Arc::new(RuleInner {
            freq: self.freq,
            start: self.start,
            date_only: self.date_only,
            zone: self.zone.clone(),
            interval: self.interval,
            count: self.count,
            until: self.until,
            week_start: self.week_start,
            numbering: self.numbering,
            by_month: self.by_month.clone().into_boxed_slice(),
            by_week: self.by_week.clone().into_boxed_slice(),
            by_year_day: self.by_year_day.clone().into_boxed_slice(),
            by_month_day: self.by_month_day.clone().into_boxed_slice(),
            by_week_day: self.by_week_day.clone().into_boxed_slice(),
            filters,
            exceptions: self.exceptions.clone(),
            step_limit: self.step_limit,
            step_span,
        });
        Ok(RecurrenceRule { inner })
    }

    /// Builds the filter chain in evaluation order.
    ///
    /// The provider's default order evaluates BYDAY before BYWEEKNO.
    /// Yearly rules carrying both reverse that, expanding weeks first so
    /// a week spilling across the year boundary still contributes its
    /// days.
    fn filters(&self) -> anyhow::Result<Box<[Filter]>> {
        let mut filters = vec![];
        if !self.by_month.is_empty() {
            filters.push(Filter::months(self.by_month.clone())?);
        }
        let weeks_first = self.freq == Frequency::Yearly
            && !self.by_week.is_empty()
            && !self.by_week_day.is_empty();
        if weeks_first {
            filters.push(self.week_filter()?);
        }
        if !self.by_year_day.is_empty() {
            filters.push(Filter::year_days(self.by_year_day.clone())?);
        }
        if !self.by_month_day.is_empty() {
            filters.push(Filter::month_days(self.by_month_day.clone())?);
        }
        if !self.by_week_day.is_empty() {
            filters.push(Filter::weekdays(
                self.by_week_day.clone(),
                self.week_start,
            )?);
        }
        if !weeks_first && !self.by_week.is_empty() {
            filters.push(self.week_filter()?);
        }
        Ok(filters.into_boxed_slice())
    }

    fn week_filter(&self) -> anyhow::Result<Filter> {
        Filter::week_numbers(
            self.by_week.clone(),
            self.week_start,
            self.numbering,
        )
    }

    fn step_unit(&self) -> Span {
        match self.freq {
            // The provider's BYWEEKNO post-processing: monthly rules with
            // week numbers step weekly instead of monthly.
            Frequency::Monthly if !self.by_week.is_empty() => 1.week(),
            freq => freq.unit(),
        }
    }

    pub fn interval(&mut self, interval: i32) -> &mut RecurrenceRuleBuilder {
        self.interval = interval;
        self
    }

    pub fn count(&mut self, count: u32) -> &mut RecurrenceRuleBuilder {
        self.count = Some(count);
        self
    }

    pub fn until(&mut self, until: Until) -> &mut RecurrenceRuleBuilder {
        self.until = Some(until);
        self
    }

    pub fn week_start(&mut self, weekday: Weekday) -> &mut RecurrenceRuleBuilder {
        self.week_start = weekday;
        self
    }

    /// Selects the week numbering scheme used by BYWEEKNO.
    pub fn week_numbering(
        &mut self,
        numbering: WeekNumbering,
    ) -> &mut RecurrenceRuleBuilder {
        self.numbering = numbering;
        self
    }

    pub fn zone(&mut self, zone: LogicalZone) -> &mut RecurrenceRuleBuilder {
        self.zone = zone;
        self
    }

    pub fn date_only(&mut self, date_only: bool) -> &mut RecurrenceRuleBuilder {
        self.date_only = date_only;
        self
    }

    pub fn by_month(
        &mut self,
        months: impl IntoIterator<Item = i8>,
    ) -> &mut RecurrenceRuleBuilder {
        self.by_month.extend(months);
        self
    }

    pub fn by_week(
        &mut self,
        weeks: impl IntoIterator<Item = i8>,
    ) -> &mut RecurrenceRuleBuilder {
        self.by_week.extend(weeks);
        self
    }

    pub fn by_year_day(
        &mut self,
        days: impl IntoIterator<Item = i16>,
    ) -> &mut RecurrenceRuleBuilder {
        self.by_year_day.extend(days);
        self
    }

    pub fn by_month_day(
        &mut self,
        days: impl IntoIterator<Item = i8>,
    ) -> &mut RecurrenceRuleBuilder {
        self.by_month_day.extend(days);
        self
    }

    pub fn by_week_day(
        &mut self,
        days: impl IntoIterator<Item = ByWeekday>,
    ) -> &mut RecurrenceRuleBuilder {
        self.by_week_day.extend(days);
        self
    }

    /// Adds exception dates to suppress.
    pub fn except(
        &mut self,
        exceptions: ExceptionSet,
    ) -> &mut RecurrenceRuleBuilder {
        self.exceptions.extend(exceptions);
        self
    }

    /// Overrides the step safety limit (mainly useful in tests).
    pub fn step_limit(&mut self, limit: u32) -> &mut RecurrenceRuleBuilder {
        self.step_limit = limit;
        self
    }
}

/// Why an occurrence iterator stopped, or that it has not.
///
/// `SafetyLimit` is a soft termination: the rule could not be proven
/// exhausted, but too many consecutive interval steps produced nothing.
/// Diagnostics can distinguish it from a legitimately finished rule.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Termination {
    Running,
    Exhausted,
    SafetyLimit,
}

/// A pull iterator over the civil occurrences of one rule.
///
/// Occurrences come out strictly increasing and duplicate free. The
/// iterator suspends exactly at its yield point: each `next` does only
/// the stepping and filtering needed to reach one more occurrence.
#[derive(Clone, Debug)]
pub struct OccurrenceIter {
    rule: RecurrenceRule,
    /// The next interval step to expand. The candidate for step `n` is
    /// always derived as `start + n * step_span` rather than by repeated
    /// addition, so month-end clamping never compounds.
    step: i64,
    /// Dates expanded from the current step, sorted descending so that
    /// popping yields chronological order.
    buffer: Vec<DateTime>,
    /// The literal start, queued ahead of everything else when the
    /// provider's leading-start rule applies.
    pending_start: Option<DateTime>,
    last: Option<DateTime>,
    emitted: u32,
    barren: u32,
    emitted_since_refill: bool,
    termination: Termination,
}

impl OccurrenceIter {
    /// Reports why iteration stopped. While the iterator is still
    /// producing, this is `Termination::Running`.
    pub fn termination(&self) -> Termination {
        self.termination
    }

    fn refill(&mut self) {
        if self.emitted_since_refill {
            self.barren = 0;
        } else {
            self.barren += 1;
            if self.barren >= self.rule.inner.step_limit {
                log::warn!(
                    "recurrence rule from {} produced nothing for {} \
                     consecutive steps; treating it as non-terminating",
                    self.rule.inner.start,
                    self.barren,
                );
                self.termination = Termination::SafetyLimit;
                return;
            }
        }
        self.emitted_since_refill = false;

        let Some(candidate) = self.next_base_candidate() else {
            self.termination = Termination::Exhausted;
            return;
        };
        let rule = &self.rule.inner;
        if let Some(until) = rule.until {
            let horizon = until.horizon().saturating_add(UNTIL_SLACK_DAYS.days());
            if candidate > horizon {
                self.termination = Termination::Exhausted;
                return;
            }
        }
        let composed = compose(&rule.filters);
        let mut dates: Vec<Date> = composed
            .expand(candidate, rule.step_granularity())
            .filter_map(|(date, granularity)| {
                rule.resolve_final(date, granularity)
            })
            .collect();
        dates.sort();
        dates.dedup();
        self.buffer = dates
            .iter()
            .rev()
            .map(|&date| DateTime::from_parts(date, rule.start.time()))
            .collect();
    }

    /// Advances to the next base candidate date, skipping steps whose
    /// day-of-month was clamped when no BYxxx part would re-derive the
    /// day anyway. (2024-02-29 plus one year clamps to 2025-02-28; a bare
    /// yearly rule must skip it rather than drift to the 28th forever.)
    fn next_base_candidate(&mut self) -> Option<Date> {
        let rule = &self.rule.inner;
        loop {
            let step = self.step;
            self.step = self.step.checked_add(1)?;
            if step == 0 {
                return Some(rule.start.date());
            }
            let span = rule.step_span.checked_mul(step).ok()?;
            let next = rule.start.date().checked_add(span).ok()?;
            if next.day() != rule.start.date().day() {
                let skip = match rule.freq {
                    Frequency::Yearly => {
                        rule.by_month.is_empty()
                            && rule.by_week.is_empty()
                            && rule.by_year_day.is_empty()
                            && rule.by_month_day.is_empty()
                            && rule.by_week_day.is_empty()
                    }
                    Frequency::Monthly => {
                        rule.by_week_day.is_empty()
                            && rule.by_month_day.is_empty()
                            && rule.by_week.is_empty()
                    }
                    _ => false,
                };
                if skip {
                    continue;
                }
            }
            return Some(next);
        }
    }
}

impl Iterator for OccurrenceIter {
    type Item = DateTime;

    fn next(&mut self) -> Option<DateTime> {
        while self.termination == Termination::Running {
            let next = self.pending_start.take().or_else(|| self.buffer.pop());
            let Some(dt) = next else {
                self.refill();
                continue;
            };
            let rule = &self.rule.inner;
            if dt < rule.start {
                continue;
            }
            if self.last.is_some_and(|last| dt <= last) {
                continue;
            }
            if !rule.admits_until(dt) {
                // Candidates only move forward, so nothing later can be
                // admissible either.
                self.termination = Termination::Exhausted;
                break;
            }
            if rule.exceptions.contains(dt) {
                continue;
            }
            self.last = Some(dt);
            self.emitted += 1;
            self.emitted_since_refill = true;
            if self.rule.inner.count.is_some_and(|count| self.emitted >= count)
            {
                self.termination = Termination::Exhausted;
            }
            return Some(dt);
        }
        None
    }
}

impl std::iter::FusedIterator for OccurrenceIter {}

/// An incremental, resumable pump over a rule's occurrences.
///
/// Asking for "everything up to D" and later "everything up to D' > D"
/// never re-scans: already computed occurrences are buffered, and a
/// cursor tracks what has been handed out.
#[derive(Clone, Debug)]
pub struct Occurrences {
    iter: OccurrenceIter,
    /// An occurrence pulled past a previous window boundary, waiting for
    /// the window to catch up.
    lookahead: Option<DateTime>,
    generated: Vec<DateTime>,
    returned: usize,
}

impl Occurrences {
    /// Extends generation up to `end` (inclusive) and returns the
    /// occurrences not yet returned by earlier calls.
    pub fn take_until(&mut self, end: DateTime) -> &[DateTime] {
        loop {
            let next = match self.lookahead.take() {
                Some(dt) => Some(dt),
                None => self.iter.next(),
            };
            match next {
                None => break,
                Some(dt) if dt > end => {
                    self.lookahead = Some(dt);
                    break;
                }
                Some(dt) => self.generated.push(dt),
            }
        }
        let newly = &self.generated[self.returned..];
        self.returned = self.generated.len();
        newly
    }

    /// Every occurrence computed so far, from the rule's beginning.
    pub fn generated(&self) -> &[DateTime] {
        &self.generated
    }

    /// Reports why generation stopped, if it has.
    pub fn termination(&self) -> Termination {
        self.iter.termination()
    }
}

/// Occurrences projected onto concrete instants through a transition
/// table, preserving the start's wall clock reading across transitions.
#[derive(Clone, Debug)]
pub struct Projected<'t> {
    iter: OccurrenceIter,
    table: &'t TransitionTable,
    original: DateTime,
}

impl<'t> Iterator for Projected<'t> {
    type Item = (Instant, UtcOffset);

    fn next(&mut self) -> Option<(Instant, UtcOffset)> {
        let dt = self.iter.next()?;
        Some(self.table.project_local(dt, self.original))
    }
}

/// The recurrence-bearing lines of one component, parsed line by line.
///
/// Each line parses independently: a malformed EXDATE does not corrupt a
/// well-formed RRULE next to it. [`RecurrenceBlock::build`] is the atomic
/// view, failing if anything in the block failed.
#[derive(Debug, Default)]
pub struct RecurrenceBlock {
    pub dtstart: Option<anyhow::Result<DtStart>>,
    pub rrule: Option<anyhow::Result<ContentLine>>,
    pub exdates: Vec<anyhow::Result<ExceptionSet>>,
    /// Lines that did not parse far enough to reveal a name.
    pub malformed: Vec<anyhow::Error>,
}

impl RecurrenceBlock {
    pub fn parse(text: &str) -> RecurrenceBlock {
        let mut block = RecurrenceBlock::default();
        for line in parse_block(text) {
            match line {
                Err(err) => block.malformed.push(err),
                Ok(line) if line.is("DTSTART") => {
                    block.dtstart = Some(DtStart::parse(&line));
                }
                Ok(line) if line.is("RRULE") => {
                    block.rrule = Some(Ok(line));
                }
                Ok(line) if line.is("EXDATE") => {
                    block.exdates.push(ExceptionSet::parse_line(&line));
                }
                // Other component lines (SUMMARY and friends) are not
                // ours to interpret.
                Ok(_) => {}
            }
        }
        block
    }

    /// Builds the rule atomically: every line in the block must have
    /// parsed.
    pub fn build(&self) -> anyhow::Result<RecurrenceRule> {
        if let Some(err) = self.malformed.first() {
            anyhow::bail!("block contains a malformed line: {err:#}");
        }
        let dtstart = match self.dtstart {
            None => anyhow::bail!("block is missing a DTSTART line"),
            Some(Err(ref err)) => anyhow::bail!("invalid DTSTART: {err:#}"),
            Some(Ok(ref dtstart)) => dtstart,
        };
        let rrule = match self.rrule {
            None => anyhow::bail!("block is missing an RRULE line"),
            Some(Err(ref err)) => anyhow::bail!("invalid RRULE: {err:#}"),
            Some(Ok(ref line)) => line,
        };
        let mut builder = RecurrenceRule::from_line(rrule, dtstart)?;
        for exdate in self.exdates.iter() {
            match *exdate {
                Err(ref err) => anyhow::bail!("invalid EXDATE: {err:#}"),
                Ok(ref set) => {
                    builder.except(set.clone());
                }
            }
        }
        builder.build()
    }
}

fn parse_list<T>(value: &str) -> anyhow::Result<Vec<T>>
where
    T: std::str::FromStr,
    anyhow::Error: From<T::Err>,
{
    value
        .split(',')
        .map(|token| {
            token.trim().parse::<T>().map_err(|err| {
                anyhow::Error::from(err)
                    .context(format!("failed to parse list item `{token}`"))
            })
        })
        .collect()
}
