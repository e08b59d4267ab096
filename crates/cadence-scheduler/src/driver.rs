use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::TaskId;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::service::{SchedulerService, TaskControlService};
use crate::types::{QueuedRun, Task};

/// How long a task whose run creation failed is left alone before retrying.
const FAILURE_BACKOFF_SECS: i64 = 60;

/// Polling loop that asks the service for due runs and hands them to an executor.
///
/// Remembers each task's next due time so idle tasks are not re-evaluated on
/// every tick. Tasks with queued manual runs are always evaluated unless
/// they are backing off after a failure.
pub struct SchedulerDriver {
    service: Arc<SchedulerService>,
    poll_interval: Duration,
    /// Created runs are sent here for execution.
    created_tx: mpsc::Sender<QueuedRun>,
    next_due: HashMap<TaskId, DateTime<Utc>>,
    /// Tasks whose last creation attempt failed, and when to try again.
    retry_at: HashMap<TaskId, DateTime<Utc>>,
}

/// Why a task's poll loop stopped early.
enum PollEnd {
    Done,
    ExecutorClosed,
}

impl SchedulerDriver {
    pub fn new(
        service: Arc<SchedulerService>,
        poll_interval: Duration,
        created_tx: mpsc::Sender<QueuedRun>,
    ) -> Self {
        Self {
            service,
            poll_interval,
            created_tx,
            next_due: HashMap::new(),
            retry_at: HashMap::new(),
        }
    }

    /// Main event loop. Polls until `shutdown` broadcasts `true` or the
    /// executor drops its receiver.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_ms = self.poll_interval.as_millis() as u64, "scheduler driver started");

        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()) {
                        error!("scheduler tick error: {e}");
                    }
                    if self.created_tx.is_closed() {
                        warn!("executor channel closed; scheduler driver stopping");
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler driver shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Evaluate every active task once. Returns the number of runs created.
    ///
    /// A failing task is logged and skipped; it does not stop the others.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let tasks = self.service.store().list_tasks()?;
        let mut created = 0;
        for task in tasks.iter().filter(|t| t.is_active()) {
            match self.poll_task(task, now) {
                Ok((n, PollEnd::Done)) => created += n,
                Ok((n, PollEnd::ExecutorClosed)) => {
                    created += n;
                    break;
                }
                Err(e) => warn!(task_id = %task.id, error = %e, "task poll failed"),
            }
        }
        Ok(created)
    }

    fn poll_task(&mut self, task: &Task, now: DateTime<Utc>) -> Result<(usize, PollEnd)> {
        if self.retry_at.get(&task.id).is_some_and(|at| *at > now) {
            return Ok((0, PollEnd::Done));
        }
        let has_manual = !self.service.manual_runs(&task.id)?.is_empty();
        if !has_manual && self.next_due.get(&task.id).is_some_and(|due| *due > now) {
            return Ok((0, PollEnd::Done));
        }

        let limit = task.concurrency.max(1) as usize;
        let mut created = 0;
        loop {
            if self.service.currently_running(&task.id)?.len() >= limit {
                debug!(task_id = %task.id, limit, "concurrency limit reached");
                break;
            }
            // Reserve executor capacity first: a run is only created when it
            // can be handed over.
            let permit = match self.created_tx.try_reserve() {
                Ok(permit) => permit,
                Err(TrySendError::Full(())) => {
                    debug!(task_id = %task.id, "executor channel full; deferring");
                    break;
                }
                Err(TrySendError::Closed(())) => return Ok((created, PollEnd::ExecutorClosed)),
            };
            match self.service.create_next_run(&task.id, now) {
                Ok(rc) => {
                    created += 1;
                    self.retry_at.remove(&task.id);
                    if rc.has_queue {
                        self.next_due.remove(&task.id);
                    } else {
                        self.next_due.insert(task.id.clone(), rc.next_due);
                    }
                    permit.send(rc.created);
                    if !rc.has_queue && rc.next_due > now {
                        break;
                    }
                }
                Err(SchedulerError::RunNotDueYet { due_at }) => {
                    self.retry_at.remove(&task.id);
                    self.next_due.insert(task.id.clone(), due_at);
                    break;
                }
                Err(e) => {
                    let retry_at = now + chrono::Duration::seconds(FAILURE_BACKOFF_SECS);
                    warn!(task_id = %task.id, error = %e, %retry_at, "failed to create run");
                    self.retry_at.insert(task.id.clone(), retry_at);
                    break;
                }
            }
        }
        Ok((created, PollEnd::Done))
    }
}
