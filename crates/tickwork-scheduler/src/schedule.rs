//! Next-run calculation for cron expressions and `PT` intervals.
//!
//! A schedule string is either an interval (`PT1H`, `PT90S`, `PT1H30M`) or a
//! five-field cron expression (`minute hour day-of-month month day-of-week`).
//! Cron fields accept `*`, `*/n`, `n`, `a-b` and comma lists of those.
//! Day-of-week runs 0 (Sunday) to 6 (Saturday). All five fields must match.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Local, TimeZone, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tickwork_core::ScheduleTimezone;

use crate::error::{Result, SchedulerError};

/// Cron search gives up after this many candidate minutes (one week).
pub const SEARCH_HORIZON_MINUTES: u32 = 10_080;

static INTERVAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^PT(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?$").expect("interval pattern is valid")
});

/// A parsed schedule string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed delay after the reference time.
    Interval(Duration),
    /// Calendar match, searched minute by minute.
    Cron(CronExpr),
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self> {
        if expr.starts_with("PT") {
            parse_interval(expr).map(Schedule::Interval)
        } else {
            CronExpr::parse(expr).map(Schedule::Cron)
        }
    }

    /// First due time strictly after `from`.
    ///
    /// Intervals return exactly `from + interval`. Cron expressions start from
    /// `from` truncated to the minute and step forward one minute at a time,
    /// reading calendar fields in `from`'s time zone.
    pub fn next_after<Tz: TimeZone>(&self, from: &DateTime<Tz>) -> Result<DateTime<Tz>> {
        match self {
            Schedule::Interval(every) => from
                .clone()
                .checked_add_signed(*every)
                .ok_or_else(|| SchedulerError::InvalidSchedule("interval overflows".to_string())),
            Schedule::Cron(cron) => cron.next_after(from),
        }
    }
}

impl FromStr for Schedule {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Schedule::parse(s)
    }
}

/// Parse `schedule` and compute its next due time after `from`.
pub fn next_run<Tz: TimeZone>(schedule: &str, from: &DateTime<Tz>) -> Result<DateTime<Tz>> {
    Schedule::parse(schedule)?.next_after(from)
}

/// Next-run calculator bound to the calendar configured for the engine.
///
/// Due times are always stored in UTC; only cron field matching depends on
/// the configured zone.
#[derive(Debug, Clone, Copy, Default)]
pub struct Calculator {
    timezone: ScheduleTimezone,
}

impl Calculator {
    pub fn new(timezone: ScheduleTimezone) -> Self {
        Self { timezone }
    }

    pub fn next_run(&self, schedule: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self.timezone {
            ScheduleTimezone::Utc => next_run(schedule, &from),
            ScheduleTimezone::Local => {
                next_run(schedule, &from.with_timezone(&Local)).map(|dt| dt.with_timezone(&Utc))
            }
        }
    }
}

fn parse_interval(expr: &str) -> Result<Duration> {
    let invalid = || SchedulerError::InvalidSchedule(format!("bad interval '{expr}'"));
    let caps = INTERVAL_RE.captures(expr).ok_or_else(invalid)?;

    let mut total_secs: u64 = 0;
    for (group, unit_secs) in [(1, 3600u64), (2, 60), (3, 1)] {
        if let Some(m) = caps.get(group) {
            let n: u64 = m.as_str().parse().map_err(|_| invalid())?;
            total_secs = n
                .checked_mul(unit_secs)
                .and_then(|secs| total_secs.checked_add(secs))
                .ok_or_else(invalid)?;
        }
    }

    if total_secs == 0 {
        return Err(SchedulerError::InvalidSchedule(format!(
            "interval '{expr}' has zero length"
        )));
    }
    let secs = i64::try_from(total_secs).map_err(|_| invalid())?;
    Duration::try_seconds(secs).ok_or_else(invalid)
}

/// A five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(SchedulerError::InvalidSchedule(format!(
                "cron expression '{expr}' must have 5 fields, found {}",
                fields.len()
            )));
        };

        Ok(Self {
            source: expr.to_string(),
            minute: CronField::parse(FieldKind::Minute, minute)?,
            hour: CronField::parse(FieldKind::Hour, hour)?,
            day_of_month: CronField::parse(FieldKind::DayOfMonth, dom)?,
            month: CronField::parse(FieldKind::Month, month)?,
            day_of_week: CronField::parse(FieldKind::DayOfWeek, dow)?,
        })
    }

    /// True when every field accepts the corresponding calendar value of `at`.
    pub fn matches<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.day_of_month.matches(at.day())
            && self.month.matches(at.month())
            && self.day_of_week.matches(at.weekday().num_days_from_sunday())
    }

    pub fn next_after<Tz: TimeZone>(&self, from: &DateTime<Tz>) -> Result<DateTime<Tz>> {
        let step = Duration::minutes(1);
        let mut candidate = truncate_to_minute(from);
        for _ in 0..SEARCH_HORIZON_MINUTES {
            candidate = candidate.checked_add_signed(step).ok_or_else(|| {
                SchedulerError::NoFeasibleRun(format!("'{}' ran past the calendar", self.source))
            })?;
            if self.matches(&candidate) {
                return Ok(candidate);
            }
        }
        Err(SchedulerError::NoFeasibleRun(format!(
            "'{}' matches nothing within {SEARCH_HORIZON_MINUTES} minutes",
            self.source
        )))
    }
}

fn truncate_to_minute<Tz: TimeZone>(at: &DateTime<Tz>) -> DateTime<Tz> {
    // Subtracting keeps us on the same instant line even inside DST gaps.
    at.clone()
        - Duration::seconds(i64::from(at.second()))
        - Duration::nanoseconds(i64::from(at.nanosecond()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl FieldKind {
    fn bounds(self) -> (u32, u32) {
        match self {
            FieldKind::Minute => (0, 59),
            FieldKind::Hour => (0, 23),
            FieldKind::DayOfMonth => (1, 31),
            FieldKind::Month => (1, 12),
            FieldKind::DayOfWeek => (0, 6),
        }
    }

    fn name(self) -> &'static str {
        match self {
            FieldKind::Minute => "minute",
            FieldKind::Hour => "hour",
            FieldKind::DayOfMonth => "day-of-month",
            FieldKind::Month => "month",
            FieldKind::DayOfWeek => "day-of-week",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Any,
    Step(u32),
    Value(u32),
    Range(u32, u32),
}

impl Token {
    fn matches(self, value: u32) -> bool {
        match self {
            Token::Any => true,
            Token::Step(n) => value % n == 0,
            Token::Value(v) => value == v,
            Token::Range(lo, hi) => (lo..=hi).contains(&value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CronField {
    tokens: Vec<Token>,
}

impl CronField {
    fn parse(kind: FieldKind, raw: &str) -> Result<Self> {
        let tokens = raw
            .split(',')
            .map(|part| parse_token(kind, raw, part))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { tokens })
    }

    fn matches(&self, value: u32) -> bool {
        self.tokens.iter().any(|t| t.matches(value))
    }
}

fn parse_token(kind: FieldKind, field: &str, part: &str) -> Result<Token> {
    let invalid = |why: &str| {
        SchedulerError::InvalidSchedule(format!("{} field '{field}': {why}", kind.name()))
    };

    if part == "*" {
        return Ok(Token::Any);
    }
    if let Some(step) = part.strip_prefix("*/") {
        let n = parse_number(step).ok_or_else(|| invalid("step is not a number"))?;
        if n == 0 {
            return Err(invalid("step must be positive"));
        }
        return Ok(Token::Step(n));
    }

    let (lo, hi) = kind.bounds();
    let in_bounds = |n: u32| (lo..=hi).contains(&n);

    if let Some((a, b)) = part.split_once('-') {
        let a = parse_number(a).ok_or_else(|| invalid("range start is not a number"))?;
        let b = parse_number(b).ok_or_else(|| invalid("range end is not a number"))?;
        if !in_bounds(a) || !in_bounds(b) {
            return Err(invalid("range out of bounds"));
        }
        if a > b {
            return Err(invalid("range start exceeds end"));
        }
        return Ok(Token::Range(a, b));
    }

    let v = parse_number(part).ok_or_else(|| invalid("unsupported syntax"))?;
    if !in_bounds(v) {
        return Err(invalid("value out of bounds"));
    }
    Ok(Token::Value(v))
}

/// Plain ASCII digits only; `u32::from_str` would also accept a leading `+`.
fn parse_number(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
