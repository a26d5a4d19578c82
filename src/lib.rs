/*!
Timezone-aware instants and RFC 5545 recurrence expansion, faithful to
Google Calendar's semantics.

This crate covers the two subsystems where calendar interoperability is
actually hard: resolving naive wall clock times against IANA timezone
transition tables (daylight saving gaps, repeated hours, and the
provider's "preserve the local reading across a transition" projection
rule), and expanding `RRULE`/`EXDATE` recurrences into ordered,
deduplicated occurrence sequences, including the provider's documented
deviations from RFC 5545.

A quick tour:

```
use ritmo::{RecurrenceBlock, ZoneCache};

fn example() -> anyhow::Result<()> {
    let block = RecurrenceBlock::parse(
        "DTSTART;TZID=America/Los_Angeles:20241101T013000\n\
         RRULE:FREQ=DAILY;COUNT=4\n",
    );
    let rule = block.build()?;

    let mut zones = ZoneCache::new();
    let table = zones.get(rule.zone());
    for (instant, offset) in rule.projected(&table) {
        println!("{instant} at {offset}");
    }
    Ok(())
}
```

Civil datetime arithmetic is delegated to [`jiff`]; everything on top of
it (transition tables, the provider projection rule, the filter algebra,
the stepping engine) lives here.
*/

pub use crate::{
    filter::{
        ByWeekday, Composed, Emitted, Expansion, Filter, Granularity, compose,
    },
    instant::{ClockTime, Instant, MILLIS_PER_DAY, UtcOffset},
    line::{ContentLine, DateToken, parse_block, parse_block_atomic},
    rrule::{
        DtStart, ExceptionSet, Frequency, OccurrenceIter, Occurrences,
        Projected, RecurrenceBlock, RecurrenceRule, RecurrenceRuleBuilder,
        Termination, Until,
    },
    weekdate::{WeekNumbering, first_of_week, last_of_week},
    zone::{
        Fragment, LogicalZone, Transition, TransitionSource, TransitionTable,
        TzdbSource, ZoneCache,
    },
};

mod filter;
mod instant;
mod line;
mod rrule;
mod weekdate;
mod zone;
