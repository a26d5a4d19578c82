use {
    anyhow::Context,
    jiff::{
        Timestamp,
        civil::{DateTime, Time},
        tz,
    },
};

/// The number of milliseconds in a civil day.
pub const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1_000;

/// An absolute point in time, in signed milliseconds since the Unix epoch.
///
/// This is a distinct unit type so an instant can never be silently
/// substituted for a count of local milliseconds (or the reverse). The
/// recurrence and timezone code below trades in both, and mixing them up
/// is precisely the class of bug this wrapper exists to rule out.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Instant(i64);

impl Instant {
    /// Creates an instant from a count of milliseconds since the Unix epoch.
    pub const fn from_millis(millis: i64) -> Instant {
        Instant(millis)
    }

    /// Returns this instant as milliseconds since the Unix epoch.
    pub const fn millis(self) -> i64 {
        self.0
    }

    /// Creates an instant from a Jiff timestamp, truncating any
    /// sub-millisecond precision.
    pub fn from_timestamp(ts: Timestamp) -> Instant {
        Instant(ts.as_millisecond())
    }

    /// Converts this instant to a Jiff timestamp.
    pub fn to_timestamp(self) -> anyhow::Result<Timestamp> {
        Timestamp::from_millisecond(self.0).with_context(|| {
            format!("millisecond instant `{}` is out of Jiff's range", self.0)
        })
    }

    /// Interprets a naive datetime as local time at the given offset.
    pub fn from_local(dt: DateTime, offset: UtcOffset) -> Instant {
        Instant(local_millis(dt) - i64::from(offset.seconds()) * 1_000)
    }

    /// Returns the local datetime for this instant at the given offset.
    ///
    /// Instants outside Jiff's civil datetime range (year -9999 through
    /// 9999) are an error.
    pub fn to_local(self, offset: UtcOffset) -> anyhow::Result<DateTime> {
        let local =
            Instant(self.0.saturating_add(i64::from(offset.seconds()) * 1_000));
        let ts = local.to_timestamp()?;
        Ok(tz::Offset::UTC.to_datetime(ts))
    }

    /// Adds a number of milliseconds, saturating at the representable
    /// boundaries.
    pub fn saturating_add(self, millis: i64) -> Instant {
        Instant(self.0.saturating_add(millis))
    }
}

impl std::fmt::Display for Instant {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.to_timestamp() {
            Ok(ts) => write!(f, "{ts}"),
            Err(_) => write!(f, "{}ms", self.0),
        }
    }
}

impl std::str::FromStr for Instant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Instant> {
        let ts: Timestamp = s.parse().with_context(|| {
            format!("failed to parse `{s}` as an RFC 3339 instant")
        })?;
        Ok(Instant::from_timestamp(ts))
    }
}

/// Returns the number of milliseconds between the Unix epoch and the given
/// naive datetime, as if the datetime were in UTC.
///
/// This is the "local millisecond" count that wall clock resolution works
/// in. It is *not* an instant unless the datetime really is UTC.
pub(crate) fn local_millis(dt: DateTime) -> i64 {
    // OK because every civil datetime is in Timestamp's range.
    tz::Offset::UTC.to_timestamp(dt).unwrap().as_millisecond()
}

/// A signed offset from UTC, in seconds.
///
/// Positive offsets are east of Greenwich. Seconds rather than minutes
/// because pre-standardization transition records carry sub-minute local
/// mean time offsets.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct UtcOffset(i32);

impl UtcOffset {
    /// The zero offset.
    pub const UTC: UtcOffset = UtcOffset(0);

    /// Creates an offset from a count of seconds east of UTC.
    ///
    /// The offset must be within Jiff's supported range (strictly less
    /// than 26 hours from UTC in either direction).
    pub fn from_seconds(seconds: i32) -> anyhow::Result<UtcOffset> {
        anyhow::ensure!(
            seconds.unsigned_abs() < 26 * 60 * 60,
            "UTC offset of `{seconds}` seconds is out of range",
        );
        Ok(UtcOffset(seconds))
    }

    /// Creates an offset from whole hours east of UTC.
    pub fn from_hours(hours: i8) -> anyhow::Result<UtcOffset> {
        UtcOffset::from_seconds(i32::from(hours) * 60 * 60)
    }

    /// Returns this offset as seconds east of UTC.
    pub const fn seconds(self) -> i32 {
        self.0
    }

    pub(crate) fn from_jiff(offset: tz::Offset) -> UtcOffset {
        UtcOffset(offset.seconds())
    }

    pub(crate) fn to_jiff(self) -> tz::Offset {
        // OK because construction checks Jiff's documented range.
        tz::Offset::from_seconds(self.0).unwrap()
    }
}

impl std::fmt::Display for UtcOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let sign = if self.0 < 0 { '-' } else { '+' };
        let secs = self.0.unsigned_abs();
        let (hours, mins, rest) = (secs / 3600, (secs % 3600) / 60, secs % 60);
        write!(f, "{sign}{hours:02}:{mins:02}")?;
        if rest != 0 {
            write!(f, ":{rest:02}")?;
        }
        Ok(())
    }
}

/// A time of day, in milliseconds after midnight.
///
/// Like `Instant`, this is a unit type: a millisecond-of-day can never be
/// confused with an epoch millisecond. Arithmetic wraps or checks
/// explicitly, and formatting is strictly `HH:MM:SS` with a fractional
/// `.mmm` part only when one is present.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ClockTime(i64);

impl ClockTime {
    /// Midnight.
    pub const MIDNIGHT: ClockTime = ClockTime(0);

    /// Creates a clock time from a count of milliseconds after midnight.
    pub fn new(millis: i64) -> anyhow::Result<ClockTime> {
        anyhow::ensure!(
            0 <= millis && millis < MILLIS_PER_DAY,
            "`{millis}` is not a valid millisecond of the day \
             (must be in range 0..{MILLIS_PER_DAY})",
        );
        Ok(ClockTime(millis))
    }

    /// Creates a clock time from hour, minute and second components.
    pub fn from_hms(hour: i8, minute: i8, second: i8) -> anyhow::Result<ClockTime> {
        anyhow::ensure!(
            (0..24).contains(&hour)
                && (0..60).contains(&minute)
                && (0..60).contains(&second),
            "`{hour:02}:{minute:02}:{second:02}` is not a valid clock time",
        );
        Ok(ClockTime(
            (i64::from(hour) * 3600 + i64::from(minute) * 60 + i64::from(second))
                * 1_000,
        ))
    }

    /// Returns this clock time as milliseconds after midnight.
    pub const fn millis(self) -> i64 {
        self.0
    }

    /// Adds a number of milliseconds, wrapping around midnight.
    pub fn wrapping_add(self, millis: i64) -> ClockTime {
        ClockTime((self.0 + millis).rem_euclid(MILLIS_PER_DAY))
    }

    /// Adds a number of milliseconds, failing if the result leaves the day.
    pub fn checked_add(self, millis: i64) -> Option<ClockTime> {
        let sum = self.0.checked_add(millis)?;
        (0..MILLIS_PER_DAY).contains(&sum).then_some(ClockTime(sum))
    }

    /// Rounds this clock time to the nearest multiple of `step` milliseconds,
    /// with halfway values rounding up. The result saturates at the last
    /// representable multiple within the day.
    pub fn round_to(self, step: i64) -> anyhow::Result<ClockTime> {
        anyhow::ensure!(
            0 < step && step <= MILLIS_PER_DAY,
            "rounding step of `{step}` milliseconds is invalid",
        );
        let rounded = (self.0 + step / 2) / step * step;
        if rounded >= MILLIS_PER_DAY {
            return Ok(ClockTime(((MILLIS_PER_DAY - 1) / step) * step));
        }
        Ok(ClockTime(rounded))
    }

    pub(crate) fn from_time(time: Time) -> ClockTime {
        ClockTime(
            (i64::from(time.hour()) * 3600
                + i64::from(time.minute()) * 60
                + i64::from(time.second()))
                * 1_000
                + i64::from(time.millisecond()),
        )
    }

    pub(crate) fn to_time(self) -> Time {
        let (hour, minute, second, milli) = self.parts();
        // OK because our invariant keeps every component in range.
        Time::new(hour, minute, second, milli * 1_000_000).unwrap()
    }

    fn parts(self) -> (i8, i8, i8, i32) {
        let secs = self.0 / 1_000;
        (
            (secs / 3600) as i8,
            ((secs % 3600) / 60) as i8,
            (secs % 60) as i8,
            (self.0 % 1_000) as i32,
        )
    }
}

impl std::fmt::Display for ClockTime {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let (hour, minute, second, milli) = self.parts();
        write!(f, "{hour:02}:{minute:02}:{second:02}")?;
        if milli != 0 {
            write!(f, ".{milli:03}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ClockTime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<ClockTime> {
        let bad = || format!("`{s}` is not a valid `HH:MM:SS[.mmm]` time");
        let (hms, milli) = match s.split_once('.') {
            None => (s, 0),
            Some((hms, frac)) => {
                anyhow::ensure!(frac.len() == 3, bad());
                (hms, frac.parse::<i64>().with_context(bad)?)
            }
        };
        let mut it = hms.splitn(3, ':');
        let mut part = || -> anyhow::Result<&str> {
            let part = it.next().with_context(bad)?;
            anyhow::ensure!(part.len() == 2, bad());
            Ok(part)
        };
        let hour: i8 = part()?.parse().with_context(bad)?;
        let minute: i8 = part()?.parse().with_context(bad)?;
        let second: i8 = part()?.parse().with_context(bad)?;
        let clock = ClockTime::from_hms(hour, minute, second)?;
        clock
            .checked_add(milli)
            .with_context(|| format!("`{s}` overflows the day"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_time_formatting() {
        let t = ClockTime::from_hms(9, 5, 0).unwrap();
        insta::assert_snapshot!(t, @"09:05:00");

        let t = t.checked_add(250).unwrap();
        insta::assert_snapshot!(t, @"09:05:00.250");

        let t = ClockTime::new(MILLIS_PER_DAY - 1).unwrap();
        insta::assert_snapshot!(t, @"23:59:59.999");
    }

    #[test]
    fn clock_time_parsing() {
        let t: ClockTime = "14:30:15".parse().unwrap();
        assert_eq!(t, ClockTime::from_hms(14, 30, 15).unwrap());

        let t: ClockTime = "00:00:00.001".parse().unwrap();
        assert_eq!(t.millis(), 1);

        assert!("24:00:00".parse::<ClockTime>().is_err());
        assert!("1:00:00".parse::<ClockTime>().is_err());
        assert!("01:00:00.1".parse::<ClockTime>().is_err());
        assert!("01:00".parse::<ClockTime>().is_err());
    }

    #[test]
    fn clock_time_arithmetic() {
        let t = ClockTime::from_hms(23, 30, 0).unwrap();
        assert_eq!(
            t.wrapping_add(60 * 60 * 1_000),
            ClockTime::from_hms(0, 30, 0).unwrap(),
        );
        assert_eq!(t.checked_add(60 * 60 * 1_000), None);

        let t = ClockTime::from_hms(9, 7, 31).unwrap();
        assert_eq!(
            t.round_to(15 * 60 * 1_000).unwrap(),
            ClockTime::from_hms(9, 15, 0).unwrap(),
        );
        let t = ClockTime::from_hms(23, 59, 0).unwrap();
        assert_eq!(
            t.round_to(60 * 60 * 1_000).unwrap(),
            ClockTime::from_hms(23, 0, 0).unwrap(),
        );
    }

    #[test]
    fn instant_round_trips_rfc3339() {
        let instant: Instant = "2024-11-03T09:00:00Z".parse().unwrap();
        insta::assert_snapshot!(instant, @"2024-11-03T09:00:00Z");

        let instant: Instant = "2024-11-03T01:00:00-08:00".parse().unwrap();
        insta::assert_snapshot!(instant, @"2024-11-03T09:00:00Z");
    }

    #[test]
    fn instant_local_conversion() {
        let offset = UtcOffset::from_hours(-7).unwrap();
        let dt = jiff::civil::date(2024, 11, 3).at(0, 0, 0, 0);
        let instant = Instant::from_local(dt, offset);
        insta::assert_snapshot!(instant, @"2024-11-03T07:00:00Z");
        assert_eq!(instant.to_local(offset).unwrap(), dt);
    }

    #[test]
    fn offset_formatting() {
        insta::assert_snapshot!(UtcOffset::from_hours(-8).unwrap(), @"-08:00");
        insta::assert_snapshot!(UtcOffset::UTC, @"+00:00");
        // Amsterdam's 1937 local mean time.
        insta::assert_snapshot!(
            UtcOffset::from_seconds(1172).unwrap(),
            @"+00:19:32",
        );
    }
}
