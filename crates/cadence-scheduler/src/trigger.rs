//! Trigger evaluation: pure "when does this fire next" computations.
//!
//! Every variant answers [`Trigger::next_fire_after`] for a reference instant
//! and the engine timezone. Results are always strictly after the reference,
//! or `None` once the trigger is exhausted.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, Months, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use thiserror::Error;
use tracing::warn;

/// Upper bound on the search rounds an `And` trigger may spend looking for
/// an instant shared by all of its children.
pub const MAX_COMBINATION_ROUNDS: usize = 10_000;

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// Longest DST gap we walk across when a local wall time does not exist.
const MAX_GAP_MINUTES: u32 = 4 * 60;

/// Smallest step used to move a search cursor past a reference instant.
fn epsilon() -> TimeDelta {
    TimeDelta::nanoseconds(1)
}

/// Errors raised while constructing a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    /// Zero or out-of-range interval period.
    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    /// Cron expression that does not parse.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Zero or out-of-range calendar step.
    #[error("invalid calendar interval: {0}")]
    InvalidCalendarInterval(String),
}

/// Defines when a job fires.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Fixed period, optionally aligned to an anchor instant.
    Interval(IntervalTrigger),
    /// Cron expression evaluated in the engine timezone.
    Cron(CronTrigger),
    /// Step of whole days, weeks, months or years in the engine timezone.
    CalendarInterval(CalendarIntervalTrigger),
    /// Single fire at an absolute instant.
    Date(DateTime<Utc>),
    /// Fires only when every child fires at the same instant.
    And(Vec<Trigger>),
    /// Fires whenever any child fires.
    Or(Vec<Trigger>),
}

impl Trigger {
    /// Repeat every `period`, counted from the reference instant.
    pub fn interval(period: std::time::Duration) -> Result<Self, TriggerError> {
        Ok(Trigger::Interval(IntervalTrigger::new(period, None)?))
    }

    /// Repeat every `period` on the grid `anchor + k * period`.
    pub fn interval_anchored(
        period: std::time::Duration,
        anchor: DateTime<Utc>,
    ) -> Result<Self, TriggerError> {
        Ok(Trigger::Interval(IntervalTrigger::new(period, Some(anchor))?))
    }

    /// Parse a 5-field, 6-field or `@shortcut` cron expression.
    pub fn cron(expression: &str) -> Result<Self, TriggerError> {
        Ok(Trigger::Cron(CronTrigger::parse(expression)?))
    }

    /// Advance `count` calendar units and fire at local midnight.
    pub fn calendar_interval(unit: CalendarUnit, count: u32) -> Result<Self, TriggerError> {
        Ok(Trigger::CalendarInterval(CalendarIntervalTrigger::new(
            unit,
            count,
            NaiveTime::MIN,
        )?))
    }

    /// Advance `count` calendar units and fire at the local time `at`.
    pub fn calendar_interval_at(
        unit: CalendarUnit,
        count: u32,
        at: NaiveTime,
    ) -> Result<Self, TriggerError> {
        Ok(Trigger::CalendarInterval(CalendarIntervalTrigger::new(
            unit, count, at,
        )?))
    }

    pub fn date(at: DateTime<Utc>) -> Self {
        Trigger::Date(at)
    }

    pub fn and(children: Vec<Trigger>) -> Self {
        Trigger::And(children)
    }

    pub fn or(children: Vec<Trigger>) -> Self {
        Trigger::Or(children)
    }

    /// Compute the next fire time strictly after `reference`.
    ///
    /// Returns `None` when the trigger can never fire again.
    pub fn next_fire_after(&self, reference: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let next = self.compute(reference, tz)?;
        if next > reference {
            return Some(next);
        }
        // Degenerate result: search once more from just past the reference.
        let nudged = reference.checked_add_signed(epsilon())?;
        self.compute(nudged, tz).filter(|at| *at > reference)
    }

    fn compute(&self, reference: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval(interval) => interval.next_after(reference),
            Trigger::Cron(cron) => cron.next_after(reference, tz),
            Trigger::CalendarInterval(calendar) => calendar.next_after(reference, tz),
            Trigger::Date(at) => (*at > reference).then_some(*at),
            Trigger::And(children) => next_common(children, reference, tz),
            Trigger::Or(children) => children
                .iter()
                .filter_map(|child| child.next_fire_after(reference, tz))
                .min(),
        }
    }
}

/// Least instant after `reference` at which every child fires.
fn next_common(children: &[Trigger], reference: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    if children.is_empty() {
        return None;
    }

    // Unanchored intervals count from the reference, not from each search cursor.
    let children: Vec<Trigger> = children
        .iter()
        .map(|child| match child {
            Trigger::Interval(interval) if interval.anchor.is_none() => {
                Trigger::Interval(IntervalTrigger {
                    anchor: Some(reference),
                    ..interval.clone()
                })
            }
            other => other.clone(),
        })
        .collect();

    let mut cursor = reference;
    for _ in 0..MAX_COMBINATION_ROUNDS {
        let mut earliest: Option<DateTime<Utc>> = None;
        let mut latest: Option<DateTime<Utc>> = None;
        for child in &children {
            let fire = child.next_fire_after(cursor, tz)?;
            earliest = Some(earliest.map_or(fire, |e| e.min(fire)));
            latest = Some(latest.map_or(fire, |l| l.max(fire)));
        }
        let (earliest, latest) = (earliest?, latest?);
        if earliest == latest {
            return Some(latest);
        }
        // No child can agree before `latest`; look for fires at or after it.
        cursor = latest.checked_sub_signed(epsilon())?;
    }

    warn!(
        rounds = MAX_COMBINATION_ROUNDS,
        "and-trigger found no common fire time; treating as exhausted"
    );
    None
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Interval(interval) => write!(f, "{interval}"),
            Trigger::Cron(cron) => write!(f, "{cron}"),
            Trigger::CalendarInterval(calendar) => write!(f, "{calendar}"),
            Trigger::Date(at) => write!(f, "date[{}]", at.to_rfc3339()),
            Trigger::And(children) => write_children(f, "and", children),
            Trigger::Or(children) => write_children(f, "or", children),
        }
    }
}

fn write_children(f: &mut fmt::Formatter<'_>, name: &str, children: &[Trigger]) -> fmt::Result {
    write!(f, "{name}[")?;
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{child}")?;
    }
    write!(f, "]")
}

// --- Interval ----------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalTrigger {
    period: std::time::Duration,
    step: TimeDelta,
    anchor: Option<DateTime<Utc>>,
}

impl IntervalTrigger {
    pub fn new(
        period: std::time::Duration,
        anchor: Option<DateTime<Utc>>,
    ) -> Result<Self, TriggerError> {
        if period.is_zero() {
            return Err(TriggerError::InvalidInterval(
                "period must be greater than zero".to_string(),
            ));
        }
        let step = TimeDelta::from_std(period)
            .map_err(|_| TriggerError::InvalidInterval(format!("period {period:?} is too large")))?;
        Ok(Self {
            period,
            step,
            anchor,
        })
    }

    pub fn period(&self) -> std::time::Duration {
        self.period
    }

    pub fn anchor(&self) -> Option<DateTime<Utc>> {
        self.anchor
    }

    fn next_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let Some(anchor) = self.anchor else {
            return reference.checked_add_signed(self.step);
        };
        if reference < anchor {
            return Some(anchor);
        }
        let step = total_nanos(self.step);
        let elapsed = total_nanos(reference - anchor);
        let offset = (elapsed / step + 1).checked_mul(step)?;
        anchor.checked_add_signed(from_nanos(offset)?)
    }
}

fn total_nanos(delta: TimeDelta) -> i128 {
    i128::from(delta.num_seconds()) * NANOS_PER_SEC + i128::from(delta.subsec_nanos())
}

fn from_nanos(nanos: i128) -> Option<TimeDelta> {
    let secs = i64::try_from(nanos.div_euclid(NANOS_PER_SEC)).ok()?;
    let subsec = u32::try_from(nanos.rem_euclid(NANOS_PER_SEC)).ok()?;
    TimeDelta::new(secs, subsec)
}

impl fmt::Display for IntervalTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.anchor {
            Some(anchor) => write!(
                f,
                "interval[{:?} from {}]",
                self.period,
                anchor.to_rfc3339()
            ),
            None => write!(f, "interval[{:?}]", self.period),
        }
    }
}

// --- Cron --------------------------------------------------------------------

/// Cron expression trigger.
///
/// Accepts:
/// - 5-field cron: `minute hour day month weekday`
/// - 6-field cron: `second minute hour day month weekday`
/// - Shortcuts: `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`,
///   `@midnight`, `@hourly`
///
/// Weekdays are best written by name (`MON-FRI`); numeric weekdays follow
/// the `cron` crate convention where 1 is Sunday.
#[derive(Debug, Clone)]
pub struct CronTrigger {
    expression: String,
    schedule: Box<CronSchedule>,
}

impl CronTrigger {
    pub fn parse(expression: &str) -> Result<Self, TriggerError> {
        let trimmed = expression.trim();
        let normalized = if trimmed.starts_with('@') {
            expand_shortcut(trimmed)?
        } else {
            trimmed.to_string()
        };

        let fields = normalized.split_whitespace().count();
        let full = match fields {
            5 => format!("0 {normalized}"),
            6 => normalized,
            n => {
                return Err(TriggerError::InvalidCron(format!(
                    "expected 5 or 6 fields, got {n}"
                )))
            }
        };

        let schedule =
            CronSchedule::from_str(&full).map_err(|e| TriggerError::InvalidCron(e.to_string()))?;

        Ok(Self {
            expression: trimmed.to_string(),
            schedule: Box::new(schedule),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn next_after(&self, reference: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = reference.with_timezone(&tz);
        self.schedule
            .after(&local)
            .next()
            .map(|at| at.with_timezone(&Utc))
    }
}

fn expand_shortcut(expression: &str) -> Result<String, TriggerError> {
    let expanded = match expression.to_lowercase().as_str() {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * SUN",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        _ => {
            return Err(TriggerError::InvalidCron(format!(
                "unknown shortcut: {expression}"
            )))
        }
    };
    Ok(expanded.to_string())
}

impl fmt::Display for CronTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cron[{}]", self.expression)
    }
}

// --- Calendar interval -------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarUnit {
    Day,
    Week,
    Month,
    Year,
}

impl fmt::Display for CalendarUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CalendarUnit::Day => "day",
            CalendarUnit::Week => "week",
            CalendarUnit::Month => "month",
            CalendarUnit::Year => "year",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarIntervalTrigger {
    unit: CalendarUnit,
    count: u32,
    /// Local time of day of every fire, re-applied after each step.
    at: NaiveTime,
}

impl CalendarIntervalTrigger {
    pub fn new(unit: CalendarUnit, count: u32, at: NaiveTime) -> Result<Self, TriggerError> {
        if count == 0 {
            return Err(TriggerError::InvalidCalendarInterval(
                "count must be greater than zero".to_string(),
            ));
        }
        if unit == CalendarUnit::Year && count.checked_mul(12).is_none() {
            return Err(TriggerError::InvalidCalendarInterval(format!(
                "{count} years is out of range"
            )));
        }
        Ok(Self { unit, count, at })
    }

    pub fn time_of_day(&self) -> NaiveTime {
        self.at
    }

    fn next_after(&self, reference: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = reference.with_timezone(&tz).naive_local();
        let date = local.date();
        let count = u64::from(self.count);
        // Month arithmetic clamps to the last day of shorter months.
        let date = match self.unit {
            CalendarUnit::Day => date.checked_add_days(Days::new(count)),
            CalendarUnit::Week => date.checked_add_days(Days::new(count * 7)),
            CalendarUnit::Month => date.checked_add_months(Months::new(self.count)),
            CalendarUnit::Year => date.checked_add_months(Months::new(self.count * 12)),
        }?;
        resolve_local(tz, date.and_time(self.at))
    }
}

/// Map a local wall time to UTC: earlier instant on DST overlaps, first valid
/// instant after a DST gap.
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    if let Some(at) = tz.from_local_datetime(&naive).earliest() {
        return Some(at.with_timezone(&Utc));
    }
    let mut local = naive;
    for _ in 0..MAX_GAP_MINUTES {
        local += TimeDelta::minutes(1);
        if let Some(at) = tz.from_local_datetime(&local).earliest() {
            return Some(at.with_timezone(&Utc));
        }
    }
    None
}

impl fmt::Display for CalendarIntervalTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "calendar_interval[{} {} at {}]", self.count, self.unit, self.at)
    }
}
