use cadence_core::{RunId, TaskId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::{Result, SchedulerError};
use crate::types::{Run, RunFilter, Task};

/// Persistence seam for tasks and finished runs.
///
/// The scheduler only keeps in-flight state in memory; everything that must
/// outlive a run goes through this trait.
pub trait TaskStore: Send + Sync {
    fn find_task(&self, task_id: &TaskId) -> Result<Option<Task>>;

    fn list_tasks(&self) -> Result<Vec<Task>>;

    /// Move the task's watermark to `at` if that is later than the current one.
    fn update_latest_completed(&self, task_id: &TaskId, at: DateTime<Utc>) -> Result<()>;

    fn insert_finished_run(&self, run: Run) -> Result<()>;

    fn find_finished_run(&self, task_id: &TaskId, run_id: &RunId) -> Result<Option<Run>>;

    /// Finished runs matching `filter`, ordered by `scheduled_for`.
    fn find_runs(&self, filter: &RunFilter) -> Result<Vec<Run>>;
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: DashMap<TaskId, Task>,
    finished: DashMap<TaskId, Vec<Run>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a task definition.
    pub fn upsert_task(&self, task: Task) {
        self.tasks.insert(task.id.clone(), task);
    }
}

impl TaskStore for InMemoryTaskStore {
    fn find_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        Ok(self.tasks.get(task_id).map(|t| t.clone()))
    }

    fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.tasks.iter().map(|t| t.clone()).collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    fn update_latest_completed(&self, task_id: &TaskId, at: DateTime<Utc>) -> Result<()> {
        let mut task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound {
                task_id: task_id.clone(),
            })?;
        if task.latest_completed.is_none_or(|latest| at > latest) {
            task.latest_completed = Some(at);
        }
        Ok(())
    }

    fn insert_finished_run(&self, run: Run) -> Result<()> {
        self.finished
            .entry(run.task_id.clone())
            .or_default()
            .push(run);
        Ok(())
    }

    fn find_finished_run(&self, task_id: &TaskId, run_id: &RunId) -> Result<Option<Run>> {
        Ok(self
            .finished
            .get(task_id)
            .and_then(|runs| runs.iter().find(|r| &r.id == run_id).cloned()))
    }

    fn find_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .finished
            .get(&filter.task_id)
            .map(|runs| runs.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default();
        runs.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for));
        if let Some(limit) = filter.limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::OrgId;
    use chrono::TimeZone;

    use crate::types::TaskStatus;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn store_with_task() -> (InMemoryTaskStore, TaskId) {
        let store = InMemoryTaskStore::new();
        let id = TaskId::from("t1");
        store.upsert_task(Task {
            id: id.clone(),
            org_id: OrgId::new("o"),
            name: "t".into(),
            every: Some("10s".into()),
            cron: None,
            offset: None,
            concurrency: 1,
            status: TaskStatus::Active,
            latest_completed: None,
        });
        (store, id)
    }

    #[test]
    fn watermark_never_moves_back() {
        let (store, id) = store_with_task();
        store.update_latest_completed(&id, at(20)).unwrap();
        store.update_latest_completed(&id, at(10)).unwrap();
        let task = store.find_task(&id).unwrap().unwrap();
        assert_eq!(task.latest_completed, Some(at(20)));
    }

    #[test]
    fn watermark_on_unknown_task_is_not_found() {
        let store = InMemoryTaskStore::new();
        let err = store
            .update_latest_completed(&TaskId::from("nope"), at(1))
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn find_runs_sorts_and_limits() {
        let (store, id) = store_with_task();
        for secs in [30, 10, 20, 40] {
            store.insert_finished_run(Run::new(id.clone(), at(secs))).unwrap();
        }
        let filter = RunFilter {
            after: Some(at(10)),
            limit: Some(2),
            ..RunFilter::for_task(id.clone())
        };
        let ticks: Vec<i64> = store
            .find_runs(&filter)
            .unwrap()
            .iter()
            .map(|r| r.scheduled_for.timestamp())
            .collect();
        assert_eq!(ticks, vec![20, 30]);
    }

    #[test]
    fn finished_run_lookup() {
        let (store, id) = store_with_task();
        let run = Run::new(id.clone(), at(10));
        let run_id = run.id.clone();
        store.insert_finished_run(run).unwrap();
        assert!(store.find_finished_run(&id, &run_id).unwrap().is_some());
        assert!(store
            .find_finished_run(&id, &RunId::from("missing"))
            .unwrap()
            .is_none());
    }
}
