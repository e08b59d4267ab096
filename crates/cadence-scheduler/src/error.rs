use cadence_core::{RunId, TaskId};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No task with the given ID exists in the store.
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: TaskId },

    /// The run is not tracked for this task (never created, or already finished).
    #[error("Run not found: {run_id} (task {task_id})")]
    RunNotFound { task_id: TaskId, run_id: RunId },

    /// The task's every/cron/offset cannot be turned into a schedule.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Nothing to do yet. Poll again once `due_at` has passed.
    #[error("Run not due until {due_at}")]
    RunNotDueYet { due_at: DateTime<Utc> },

    /// The caller asked for a transition the run state machine forbids.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A run for this tick is already in flight or waiting in the manual queue.
    #[error("Run already queued for {scheduled_for} (task {task_id})")]
    RunAlreadyQueued {
        task_id: TaskId,
        scheduled_for: DateTime<Utc>,
    },

    /// Failure reported by the backing task/run store.
    #[error("Store error: {0}")]
    Store(String),
}

impl SchedulerError {
    /// Short error code string for API layers.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::TaskNotFound { .. } | SchedulerError::RunNotFound { .. } => {
                "NOT_FOUND"
            }
            SchedulerError::InvalidSchedule(_) => "INVALID_SCHEDULE",
            SchedulerError::RunNotDueYet { .. } => "RUN_NOT_DUE_YET",
            SchedulerError::InvalidState(_) => "INVALID_STATE",
            SchedulerError::RunAlreadyQueued { .. } => "RUN_ALREADY_QUEUED",
            SchedulerError::Store(_) => "STORE_ERROR",
        }
    }

    /// True for the expected "poll again later" signal, which is not a failure.
    pub fn is_not_due_yet(&self) -> bool {
        matches!(self, SchedulerError::RunNotDueYet { .. })
    }

    pub(crate) fn run_not_found(task_id: &TaskId, run_id: &RunId) -> Self {
        SchedulerError::RunNotFound {
            task_id: task_id.clone(),
            run_id: run_id.clone(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
