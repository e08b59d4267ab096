//! `SchedulerService`: the control surface the executor talks to.
//!
//! Per-task state lives in its own `Mutex` inside a `DashMap`, so calls for
//! different tasks never contend while calls for the same task are
//! serialized. The task's watermark is read and written while that task's
//! lock is held, which keeps `finish_run` and `create_next_run` linearizable.

use std::sync::{Arc, Mutex, MutexGuard};

use cadence_core::{RunId, TaskId};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, info, instrument};

use crate::error::{Result, SchedulerError};
use crate::options::effective_offset;
use crate::schedule::TaskSchedule;
use crate::state::TaskState;
use crate::store::TaskStore;
use crate::types::{QueuedRun, Run, RunCreation, RunFilter, RunLog, RunStatus, Task};

/// Operations an executor needs to drive runs through their lifecycle.
pub trait TaskControlService: Send + Sync {
    /// Serve the next manual run, or create the next regular run if it is due.
    fn create_next_run(&self, task_id: &TaskId, now: DateTime<Utc>) -> Result<RunCreation>;

    /// Create an in-flight run for `scheduled_for` without consulting the gate.
    fn create_run(&self, task_id: &TaskId, scheduled_for: DateTime<Utc>) -> Result<Run>;

    /// Pull a specific run out of the manual queue and mark it in flight.
    fn start_manual_run(&self, task_id: &TaskId, run_id: &RunId) -> Result<Run>;

    /// Stop tracking a run and advance the task's watermark if needed.
    fn finish_run(&self, task_id: &TaskId, run_id: &RunId) -> Result<Run>;

    fn currently_running(&self, task_id: &TaskId) -> Result<Vec<Run>>;

    fn manual_runs(&self, task_id: &TaskId) -> Result<Vec<Run>>;

    /// When the next regular run becomes due, offset included.
    fn next_due_run(&self, task_id: &TaskId) -> Result<DateTime<Utc>>;

    fn update_run_state(
        &self,
        task_id: &TaskId,
        run_id: &RunId,
        status: RunStatus,
        when: DateTime<Utc>,
    ) -> Result<()>;

    fn add_run_log(
        &self,
        task_id: &TaskId,
        run_id: &RunId,
        when: DateTime<Utc>,
        message: &str,
    ) -> Result<()>;
}

/// The next regular tick for a task given its current state.
struct NextTick {
    schedule: TaskSchedule,
    offset: Duration,
    scheduled_for: DateTime<Utc>,
}

impl NextTick {
    fn due_at(&self) -> DateTime<Utc> {
        self.scheduled_for + self.offset
    }
}

pub struct SchedulerService {
    store: Arc<dyn TaskStore>,
    states: DashMap<TaskId, Arc<Mutex<TaskState>>>,
}

impl SchedulerService {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            states: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Enqueue a backfill run for an arbitrary tick.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub fn force_run(&self, task_id: &TaskId, scheduled_for: DateTime<Utc>) -> Result<Run> {
        let state = self.known_state(task_id)?;
        let mut state = lock(&state)?;
        ensure_tick_free(&state, task_id, scheduled_for)?;

        let run = Run::new(task_id.clone(), scheduled_for);
        state.push_manual(run.clone());
        info!(run_id = %run.id, %scheduled_for, "manual run queued");
        Ok(run)
    }

    /// Append pre-built runs to the manual queue, all or nothing.
    #[instrument(skip(self, runs), fields(task_id = %task_id, count = runs.len()))]
    pub fn enqueue_manual_runs(&self, task_id: &TaskId, runs: Vec<Run>) -> Result<()> {
        let state = self.known_state(task_id)?;
        let mut state = lock(&state)?;

        for (i, run) in runs.iter().enumerate() {
            ensure_tick_free(&state, task_id, run.scheduled_for)?;
            if runs[..i].iter().any(|r| r.scheduled_for == run.scheduled_for) {
                return Err(SchedulerError::RunAlreadyQueued {
                    task_id: task_id.clone(),
                    scheduled_for: run.scheduled_for,
                });
            }
        }
        for mut run in runs {
            run.task_id = task_id.clone();
            state.push_manual(run);
        }
        Ok(())
    }

    /// Queue a fresh run for the tick of a previously finished run.
    ///
    /// The watermark does not block this: re-running a historical tick is
    /// the whole point.
    #[instrument(skip(self), fields(task_id = %task_id, run_id = %run_id))]
    pub fn retry_run(&self, task_id: &TaskId, run_id: &RunId) -> Result<Run> {
        let state = self.known_state(task_id)?;
        let mut state = lock(&state)?;

        let previous = self
            .store
            .find_finished_run(task_id, run_id)?
            .ok_or_else(|| SchedulerError::run_not_found(task_id, run_id))?;
        ensure_tick_free(&state, task_id, previous.scheduled_for)?;

        let run = Run::new(task_id.clone(), previous.scheduled_for);
        state.push_manual(run.clone());
        info!(new_run_id = %run.id, scheduled_for = %run.scheduled_for, "retry queued");
        Ok(run)
    }

    /// Finished and in-flight runs matching `filter`, ordered by tick.
    pub fn find_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let mut runs = self.store.find_runs(&RunFilter {
            limit: None,
            ..filter.clone()
        })?;
        if let Some(state) = self.existing_state(&filter.task_id) {
            let state = lock(&state)?;
            runs.extend(state.running().into_iter().filter(|r| filter.matches(r)));
        }
        runs.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for));
        if let Some(limit) = filter.limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }

    /// Log lines of a run, whether still in flight or already finished.
    pub fn run_logs(&self, task_id: &TaskId, run_id: &RunId) -> Result<Vec<RunLog>> {
        if let Some(state) = self.existing_state(task_id) {
            let state = lock(&state)?;
            if let Some(run) = state.in_flight(run_id) {
                return Ok(run.log.clone());
            }
        }
        self.store
            .find_finished_run(task_id, run_id)?
            .map(|run| run.log)
            .ok_or_else(|| SchedulerError::run_not_found(task_id, run_id))
    }

    // --- private helpers ---------------------------------------------------

    fn find_task(&self, task_id: &TaskId) -> Result<Task> {
        self.store
            .find_task(task_id)?
            .ok_or_else(|| SchedulerError::TaskNotFound {
                task_id: task_id.clone(),
            })
    }

    fn state_for(&self, task_id: &TaskId) -> Arc<Mutex<TaskState>> {
        // Clone the Arc out so the map shard is released before locking.
        self.states.entry(task_id.clone()).or_default().clone()
    }

    /// State for a task the store knows about. Unknown IDs never get an entry.
    ///
    /// Callers re-read the task once the lock is held so the watermark they
    /// see cannot move underneath them.
    fn known_state(&self, task_id: &TaskId) -> Result<Arc<Mutex<TaskState>>> {
        self.find_task(task_id)?;
        Ok(self.state_for(task_id))
    }

    fn existing_state(&self, task_id: &TaskId) -> Option<Arc<Mutex<TaskState>>> {
        self.states.get(task_id).map(|s| Arc::clone(&s))
    }

    /// `schedule.next(max(watermark, latest in-flight tick, epoch))`.
    fn next_tick(task: &Task, state: &TaskState) -> Result<NextTick> {
        let schedule = TaskSchedule::for_task(task)?;
        let offset = effective_offset(task)?;
        let latest = [task.latest_completed, state.latest_in_flight()]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let scheduled_for = schedule.next_after(latest)?;
        Ok(NextTick {
            schedule,
            offset,
            scheduled_for,
        })
    }
}

impl TaskControlService for SchedulerService {
    #[instrument(skip(self), fields(task_id = %task_id))]
    fn create_next_run(&self, task_id: &TaskId, now: DateTime<Utc>) -> Result<RunCreation> {
        let state = self.known_state(task_id)?;
        let mut state = lock(&state)?;
        let task = self.find_task(task_id)?;

        if state.has_manual() {
            // Resolve the regular schedule first so a bad schedule leaves the
            // queue untouched.
            Self::next_tick(&task, &state)?;
            if let Some(run) = state.pop_manual() {
                let created = QueuedRun::from(&run);
                state.insert_in_flight(run);
                let next_due = Self::next_tick(&task, &state)?.due_at();
                info!(run_id = %created.run_id, scheduled_for = %created.scheduled_for, "manual run created");
                return Ok(RunCreation {
                    created,
                    next_due,
                    has_queue: state.has_manual(),
                });
            }
        }

        let tick = Self::next_tick(&task, &state)?;
        let due_at = tick.due_at();
        if due_at > now {
            debug!(%due_at, "run not due yet");
            return Err(SchedulerError::RunNotDueYet { due_at });
        }

        let next_due = tick.schedule.next_after(tick.scheduled_for)? + tick.offset;
        let run = Run::new(task.id.clone(), tick.scheduled_for);
        let created = QueuedRun::from(&run);
        state.insert_in_flight(run);
        info!(run_id = %created.run_id, scheduled_for = %created.scheduled_for, %next_due, "run created");

        Ok(RunCreation {
            created,
            next_due,
            has_queue: false,
        })
    }

    #[instrument(skip(self), fields(task_id = %task_id))]
    fn create_run(&self, task_id: &TaskId, scheduled_for: DateTime<Utc>) -> Result<Run> {
        let state = self.known_state(task_id)?;
        let mut state = lock(&state)?;
        ensure_tick_free(&state, task_id, scheduled_for)?;

        let run = Run::new(task_id.clone(), scheduled_for);
        state.insert_in_flight(run.clone());
        info!(run_id = %run.id, %scheduled_for, "run created directly");
        Ok(run)
    }

    #[instrument(skip(self), fields(task_id = %task_id, run_id = %run_id))]
    fn start_manual_run(&self, task_id: &TaskId, run_id: &RunId) -> Result<Run> {
        let state = self
            .existing_state(task_id)
            .ok_or_else(|| SchedulerError::run_not_found(task_id, run_id))?;
        let mut state = lock(&state)?;

        let run = state
            .take_manual(run_id)
            .ok_or_else(|| SchedulerError::run_not_found(task_id, run_id))?;
        state.insert_in_flight(run.clone());
        debug!("manual run moved in flight");
        Ok(run)
    }

    #[instrument(skip(self), fields(task_id = %task_id, run_id = %run_id))]
    fn finish_run(&self, task_id: &TaskId, run_id: &RunId) -> Result<Run> {
        let state = self
            .existing_state(task_id)
            .ok_or_else(|| SchedulerError::run_not_found(task_id, run_id))?;
        let mut state = lock(&state)?;

        let run = state
            .in_flight(run_id)
            .cloned()
            .ok_or_else(|| SchedulerError::run_not_found(task_id, run_id))?;

        // Store writes happen before the run leaves the in-flight set, so a
        // store failure leaves the run tracked and the call can be repeated.
        let task = self.find_task(task_id)?;
        if task
            .latest_completed
            .is_none_or(|latest| run.scheduled_for > latest)
        {
            self.store
                .update_latest_completed(task_id, run.scheduled_for)?;
            debug!(latest_completed = %run.scheduled_for, "watermark advanced");
        }
        self.store.insert_finished_run(run.clone())?;
        state.remove_in_flight(run_id);

        info!(status = %run.status, scheduled_for = %run.scheduled_for, "run finished");
        Ok(run)
    }

    fn currently_running(&self, task_id: &TaskId) -> Result<Vec<Run>> {
        match self.existing_state(task_id) {
            Some(state) => Ok(lock(&state)?.running()),
            None => Ok(Vec::new()),
        }
    }

    fn manual_runs(&self, task_id: &TaskId) -> Result<Vec<Run>> {
        match self.existing_state(task_id) {
            Some(state) => Ok(lock(&state)?.manual_runs()),
            None => Ok(Vec::new()),
        }
    }

    fn next_due_run(&self, task_id: &TaskId) -> Result<DateTime<Utc>> {
        let state = self.known_state(task_id)?;
        let state = lock(&state)?;
        let task = self.find_task(task_id)?;
        Ok(Self::next_tick(&task, &state)?.due_at())
    }

    #[instrument(skip(self), fields(task_id = %task_id, run_id = %run_id))]
    fn update_run_state(
        &self,
        task_id: &TaskId,
        run_id: &RunId,
        status: RunStatus,
        when: DateTime<Utc>,
    ) -> Result<()> {
        let state = self
            .existing_state(task_id)
            .ok_or_else(|| SchedulerError::run_not_found(task_id, run_id))?;
        let mut state = lock(&state)?;
        let run = state
            .in_flight_mut(run_id)
            .ok_or_else(|| SchedulerError::run_not_found(task_id, run_id))?;

        if !run.status.can_transition_to(status) {
            return Err(SchedulerError::InvalidState(format!(
                "run {run_id} cannot move from {} to {status}",
                run.status
            )));
        }
        match status {
            RunStatus::Scheduled => {}
            RunStatus::Started => run.started_at = Some(when),
            RunStatus::Success | RunStatus::Failed | RunStatus::Canceled => {
                run.finished_at = Some(when)
            }
        }
        debug!(from = %run.status, to = %status, "run state updated");
        run.status = status;
        Ok(())
    }

    fn add_run_log(
        &self,
        task_id: &TaskId,
        run_id: &RunId,
        when: DateTime<Utc>,
        message: &str,
    ) -> Result<()> {
        let state = self
            .existing_state(task_id)
            .ok_or_else(|| SchedulerError::run_not_found(task_id, run_id))?;
        let mut state = lock(&state)?;
        let run = state
            .in_flight_mut(run_id)
            .ok_or_else(|| SchedulerError::run_not_found(task_id, run_id))?;
        run.log.push(RunLog {
            run_id: run_id.clone(),
            time: when,
            message: message.to_string(),
        });
        Ok(())
    }
}

fn lock(state: &Mutex<TaskState>) -> Result<MutexGuard<'_, TaskState>> {
    state
        .lock()
        .map_err(|_| SchedulerError::InvalidState("task state lock poisoned".to_string()))
}

fn ensure_tick_free(
    state: &TaskState,
    task_id: &TaskId,
    scheduled_for: DateTime<Utc>,
) -> Result<()> {
    if state.has_tick(scheduled_for) {
        return Err(SchedulerError::RunAlreadyQueued {
            task_id: task_id.clone(),
            scheduled_for,
        });
    }
    Ok(())
}
