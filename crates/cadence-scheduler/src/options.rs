//! Resolution of a task's `every` / `cron` / `offset` options.
//!
//! An `every` interval is mapped onto a single 7-field cron expression
//! (`sec min hour dom month dow year`) with exactly one `*/N` field, picked
//! by magnitude:
//!
//! | Interval        | Expression              |
//! |-----------------|-------------------------|
//! | `< 1m`          | `*/S */1 */1 * * * *`   |
//! | `1m ..< 1h`     | `0 */M */1 * * * *`     |
//! | `1h ..= 23h`    | `0 0 */H * * * *`       |
//!
//! Intervals that are not a whole number of their band's unit, or that are a
//! day or longer, are rejected rather than approximated.

use chrono::Duration;

use crate::error::{Result, SchedulerError};
use crate::types::Task;

const NANOS_PER_MICRO: i64 = 1_000;
const NANOS_PER_MILLI: i64 = 1_000_000;
const NANOS_PER_SECOND: i64 = 1_000_000_000;
const NANOS_PER_MINUTE: i64 = 60 * NANOS_PER_SECOND;
const NANOS_PER_HOUR: i64 = 60 * NANOS_PER_MINUTE;
const NANOS_PER_DAY: i64 = 24 * NANOS_PER_HOUR;
const NANOS_PER_WEEK: i64 = 7 * NANOS_PER_DAY;

const MAX_INTERVAL_HOURS: i64 = 23;

/// The single cron expression that drives `task`.
///
/// A non-empty `cron` is returned verbatim; otherwise `every` is mapped per
/// the table in the module docs.
pub fn effective_cron(task: &Task) -> Result<String> {
    if let Some(cron) = non_empty(task.cron.as_deref()) {
        return Ok(cron.to_string());
    }
    let every = non_empty(task.every.as_deref()).ok_or_else(|| {
        SchedulerError::InvalidSchedule(format!("task {} has neither every nor cron", task.id))
    })?;
    interval_cron(parse_duration(every)?)
}

/// The task's offset, or zero when unset. Negative offsets are rejected.
pub fn effective_offset(task: &Task) -> Result<Duration> {
    let Some(literal) = non_empty(task.offset.as_deref()) else {
        return Ok(Duration::zero());
    };
    let offset = parse_duration(literal)?;
    if offset < Duration::zero() {
        return Err(SchedulerError::InvalidSchedule(format!(
            "offset must not be negative: {literal}"
        )));
    }
    Ok(offset)
}

/// Map a positive interval onto a 7-field cron expression.
pub fn interval_cron(every: Duration) -> Result<String> {
    if every <= Duration::zero() {
        return Err(SchedulerError::InvalidSchedule(format!(
            "every must be positive, got {}s",
            every.num_seconds()
        )));
    }
    if every.subsec_nanos() != 0 {
        return Err(SchedulerError::InvalidSchedule(
            "every must be a whole number of seconds".to_string(),
        ));
    }

    let secs = every.num_seconds();
    if secs < 60 {
        return Ok(format!("*/{secs} */1 */1 * * * *"));
    }
    if secs < 3600 {
        if secs % 60 != 0 {
            return Err(SchedulerError::InvalidSchedule(format!(
                "every of {secs}s is not a whole number of minutes"
            )));
        }
        return Ok(format!("0 */{} */1 * * * *", secs / 60));
    }
    if secs % 3600 != 0 {
        return Err(SchedulerError::InvalidSchedule(format!(
            "every of {secs}s is not a whole number of hours"
        )));
    }
    let hours = secs / 3600;
    if hours > MAX_INTERVAL_HOURS {
        return Err(SchedulerError::InvalidSchedule(format!(
            "every of {hours}h cannot be expressed as an hourly schedule; use cron"
        )));
    }
    Ok(format!("0 0 */{hours} * * * *"))
}

/// Parse a duration literal such as `10s`, `1h30m` or `-7d`.
///
/// Accepted units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`, `d`, `w`.
/// Calendar units (`mo`, `y`) have no fixed length and are rejected.
pub fn parse_duration(literal: &str) -> Result<Duration> {
    let invalid = |reason: &str| {
        SchedulerError::InvalidSchedule(format!("invalid duration {literal:?}: {reason}"))
    };

    let trimmed = literal.trim();
    let (negative, mut rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    if rest.is_empty() {
        return Err(invalid("empty"));
    }

    let mut total: i64 = 0;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits_end == 0 {
            return Err(invalid("expected a number"));
        }
        let magnitude: i64 = rest[..digits_end]
            .parse()
            .map_err(|_| invalid("number out of range"))?;
        rest = &rest[digits_end..];

        let unit_end = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let scale = unit_nanos(&rest[..unit_end]).ok_or_else(|| {
            if rest[..unit_end].is_empty() {
                invalid("missing unit")
            } else {
                invalid("unsupported unit")
            }
        })?;
        rest = &rest[unit_end..];

        total = magnitude
            .checked_mul(scale)
            .and_then(|n| total.checked_add(n))
            .ok_or_else(|| invalid("overflow"))?;
    }

    Ok(Duration::nanoseconds(if negative { -total } else { total }))
}

fn unit_nanos(unit: &str) -> Option<i64> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" => Some(NANOS_PER_MICRO),
        "ms" => Some(NANOS_PER_MILLI),
        "s" => Some(NANOS_PER_SECOND),
        "m" => Some(NANOS_PER_MINUTE),
        "h" => Some(NANOS_PER_HOUR),
        "d" => Some(NANOS_PER_DAY),
        "w" => Some(NANOS_PER_WEEK),
        _ => None,
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
