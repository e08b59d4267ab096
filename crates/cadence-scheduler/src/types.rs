use cadence_core::config::{TaskConfig, TaskStatusConfig};
use cadence_core::{OrgId, RunId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Whether a task is eligible to produce runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Active,
    Inactive,
}

/// A scheduled unit of recurring work, as resolved from its options block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub org_id: OrgId,
    pub name: String,
    /// Interval literal such as "10s" or "1h". Ignored when `cron` is set.
    pub every: Option<String>,
    /// Cron expression. Takes precedence over `every`.
    pub cron: Option<String>,
    /// Non-negative delay added to each computed due time.
    pub offset: Option<String>,
    /// Maximum simultaneously in-flight runs. Enforced by the executor side.
    pub concurrency: u32,
    pub status: TaskStatus,
    /// `scheduled_for` of the most recently finished run. Only moves forward.
    pub latest_completed: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a task from its config definition.
    ///
    /// The watermark starts at `now` so a freshly provisioned task begins at
    /// the next tick instead of backfilling from the epoch.
    pub fn from_config(config: &TaskConfig, now: DateTime<Utc>) -> Self {
        Self {
            id: config
                .id
                .as_deref()
                .map(TaskId::from)
                .unwrap_or_default(),
            org_id: OrgId::new(&config.org_id),
            name: config.name.clone(),
            every: config.every.clone(),
            cron: config.cron.clone(),
            offset: config.offset.clone(),
            concurrency: config.concurrency,
            status: match config.status {
                TaskStatusConfig::Active => TaskStatus::Active,
                TaskStatusConfig::Inactive => TaskStatus::Inactive,
            },
            latest_completed: Some(now),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active
    }
}

/// Lifecycle state of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, waiting for the executor to pick it up.
    Scheduled,
    /// The executor has begun running it.
    Started,
    Success,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Canceled
        )
    }

    /// Whether `self -> next` is a legal move.
    ///
    /// `Scheduled -> Scheduled` is accepted as a no-op; nothing re-enters
    /// `Scheduled` once it has left, and terminal states are final.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Scheduled, _) => true,
            (RunStatus::Started, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Scheduled => "scheduled",
            RunStatus::Started => "started",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(RunStatus::Scheduled),
            "started" => Ok(RunStatus::Started),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "canceled" => Ok(RunStatus::Canceled),
            other => Err(SchedulerError::InvalidState(format!(
                "unknown run status: {other}"
            ))),
        }
    }
}

/// One line of a run's append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: RunId,
    pub time: DateTime<Utc>,
    pub message: String,
}

/// One execution attempt of a task, tied to a logical tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub task_id: TaskId,
    /// Logical tick this run represents. Dedup key for the regular gate.
    pub scheduled_for: DateTime<Utc>,
    /// Wall-clock creation time.
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub log: Vec<RunLog>,
}

impl Run {
    /// A fresh `Scheduled` run with a new time-ordered ID.
    pub fn new(task_id: TaskId, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            id: RunId::new(),
            task_id,
            scheduled_for,
            requested_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status: RunStatus::Scheduled,
            log: Vec::new(),
        }
    }
}

/// Handle returned across the service boundary instead of the full run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedRun {
    pub task_id: TaskId,
    pub run_id: RunId,
    pub scheduled_for: DateTime<Utc>,
}

impl From<&Run> for QueuedRun {
    fn from(run: &Run) -> Self {
        Self {
            task_id: run.task_id.clone(),
            run_id: run.id.clone(),
            scheduled_for: run.scheduled_for,
        }
    }
}

/// Result of a successful `create_next_run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCreation {
    pub created: QueuedRun,
    /// When the caller should poll again (offset already applied).
    pub next_due: DateTime<Utc>,
    /// Manual runs are still waiting in the queue.
    pub has_queue: bool,
}

/// Query over a task's runs, finished and in flight.
#[derive(Debug, Clone)]
pub struct RunFilter {
    pub task_id: TaskId,
    /// Only runs scheduled strictly after this instant.
    pub after: Option<DateTime<Utc>>,
    /// Only runs scheduled strictly before this instant.
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RunFilter {
    pub fn for_task(task_id: TaskId) -> Self {
        Self {
            task_id,
            after: None,
            before: None,
            limit: None,
        }
    }

    pub fn matches(&self, run: &Run) -> bool {
        run.task_id == self.task_id
            && self.after.is_none_or(|after| run.scheduled_for > after)
            && self.before.is_none_or(|before| run.scheduled_for < before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn scheduled_can_go_anywhere() {
        for next in [
            RunStatus::Scheduled,
            RunStatus::Started,
            RunStatus::Success,
            RunStatus::Failed,
            RunStatus::Canceled,
        ] {
            assert!(RunStatus::Scheduled.can_transition_to(next), "{next}");
        }
    }

    #[test]
    fn started_only_moves_to_terminal() {
        assert!(!RunStatus::Started.can_transition_to(RunStatus::Scheduled));
        assert!(!RunStatus::Started.can_transition_to(RunStatus::Started));
        assert!(RunStatus::Started.can_transition_to(RunStatus::Success));
        assert!(RunStatus::Started.can_transition_to(RunStatus::Failed));
        assert!(RunStatus::Started.can_transition_to(RunStatus::Canceled));
    }

    #[test]
    fn terminal_states_are_final() {
        for from in [RunStatus::Success, RunStatus::Failed, RunStatus::Canceled] {
            assert!(!from.can_transition_to(RunStatus::Scheduled));
            assert!(!from.can_transition_to(RunStatus::Started));
            assert!(!from.can_transition_to(RunStatus::Failed));
        }
    }

    #[test]
    fn status_parses_from_display() {
        let parsed: RunStatus = RunStatus::Canceled.to_string().parse().unwrap();
        assert_eq!(parsed, RunStatus::Canceled);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::Started).unwrap();
        assert_eq!(json, r#""started""#);
    }

    #[test]
    fn unknown_status_is_invalid_state() {
        let err = "exploded".parse::<RunStatus>().unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
    }

    #[test]
    fn filter_bounds_are_exclusive() {
        let t = |s| Utc.timestamp_opt(s, 0).unwrap();
        let mut run = Run::new(TaskId::from("t"), t(100));
        let filter = RunFilter {
            after: Some(t(50)),
            before: Some(t(100)),
            ..RunFilter::for_task(TaskId::from("t"))
        };
        assert!(!filter.matches(&run));
        run.scheduled_for = t(99);
        assert!(filter.matches(&run));
        run.task_id = TaskId::from("other");
        assert!(!filter.matches(&run));
    }

    #[test]
    fn from_config_starts_watermark_at_now() {
        let config = TaskConfig {
            id: Some("abc".into()),
            name: "rollup".into(),
            org_id: "acme".into(),
            every: Some("1m".into()),
            cron: None,
            offset: None,
            concurrency: 2,
            status: TaskStatusConfig::Inactive,
        };
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let task = Task::from_config(&config, now);
        assert_eq!(task.id, TaskId::from("abc"));
        assert_eq!(task.latest_completed, Some(now));
        assert!(!task.is_active());
    }
}
