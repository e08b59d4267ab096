use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};
use crate::options::effective_cron;
use crate::types::Task;

/// A parsed cron schedule.
///
/// Accepts 6- and 7-field expressions (with seconds, optional year) as well
/// as classic 5-field crontab lines, which fire at second 0.
#[derive(Debug, Clone)]
pub struct TaskSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl TaskSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let normalized = normalize_cron_expr(expression);
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
            SchedulerError::InvalidSchedule(format!("invalid cron expression {expression:?}: {e}"))
        })?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    /// Schedule derived from the task's effective cron.
    pub fn for_task(task: &Task) -> Result<Self> {
        Self::parse(&effective_cron(task)?)
    }

    /// First tick strictly after `from`.
    ///
    /// Fails with `InvalidSchedule` when the expression has no further
    /// occurrences (e.g. a year field entirely in the past).
    pub fn next_after(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.schedule.after(&from).next().ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!(
                "cron expression {:?} has no occurrence after {from}",
                self.expression
            ))
        })
    }

    /// The expression as written, before normalization.
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

/// Prepend a seconds field to 5-field crontab lines.
fn normalize_cron_expr(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn five_field_gets_seconds() {
        assert_eq!(normalize_cron_expr("* * * * *"), "0 * * * * *");
        assert_eq!(normalize_cron_expr("0 0 */2 * * * *"), "0 0 */2 * * * *");
        assert_eq!(normalize_cron_expr("@hourly"), "@hourly");
    }

    #[test]
    fn every_ten_seconds_from_epoch() {
        let schedule = TaskSchedule::parse("*/10 */1 */1 * * * *").unwrap();
        assert_eq!(schedule.next_after(at(0)).unwrap(), at(10));
        assert_eq!(schedule.next_after(at(10)).unwrap(), at(20));
        assert_eq!(schedule.next_after(at(15)).unwrap(), at(20));
    }

    #[test]
    fn hourly_lands_on_the_hour() {
        let schedule = TaskSchedule::parse("0 0 */1 * * * *").unwrap();
        assert_eq!(schedule.next_after(at(1)).unwrap(), at(3600));
    }

    #[test]
    fn five_field_minutely() {
        let schedule = TaskSchedule::parse("* * * * *").unwrap();
        assert_eq!(schedule.next_after(at(30)).unwrap(), at(60));
        assert_eq!(schedule.expression(), "* * * * *");
    }

    #[test]
    fn garbage_is_invalid_schedule() {
        let err = TaskSchedule::parse("every tuesday").unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEDULE");
    }
}
