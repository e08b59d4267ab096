use std::collections::{HashMap, VecDeque};

use cadence_core::RunId;
use chrono::{DateTime, Utc};

use crate::types::Run;

/// Mutable scheduling state for a single task.
///
/// Holds the in-flight runs and the pending manual queue. One instance per
/// task, always accessed under that task's lock.
#[derive(Debug, Default)]
pub struct TaskState {
    in_flight: HashMap<RunId, Run>,
    manual_queue: VecDeque<Run>,
}

impl TaskState {
    /// Latest `scheduled_for` among in-flight runs.
    pub fn latest_in_flight(&self) -> Option<DateTime<Utc>> {
        self.in_flight.values().map(|r| r.scheduled_for).max()
    }

    /// Whether any in-flight or queued run already covers this tick.
    pub fn has_tick(&self, scheduled_for: DateTime<Utc>) -> bool {
        self.in_flight
            .values()
            .chain(self.manual_queue.iter())
            .any(|r| r.scheduled_for == scheduled_for)
    }

    pub fn insert_in_flight(&mut self, run: Run) {
        self.in_flight.insert(run.id.clone(), run);
    }

    pub fn in_flight(&self, run_id: &RunId) -> Option<&Run> {
        self.in_flight.get(run_id)
    }

    pub fn in_flight_mut(&mut self, run_id: &RunId) -> Option<&mut Run> {
        self.in_flight.get_mut(run_id)
    }

    pub fn remove_in_flight(&mut self, run_id: &RunId) -> Option<Run> {
        self.in_flight.remove(run_id)
    }

    /// In-flight runs ordered by tick.
    pub fn running(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.in_flight.values().cloned().collect();
        runs.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for).then(a.id.cmp(&b.id)));
        runs
    }

    pub fn running_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn push_manual(&mut self, run: Run) {
        self.manual_queue.push_back(run);
    }

    pub fn pop_manual(&mut self) -> Option<Run> {
        self.manual_queue.pop_front()
    }

    /// Remove a queued run by ID, wherever it sits in the queue.
    pub fn take_manual(&mut self, run_id: &RunId) -> Option<Run> {
        let index = self.manual_queue.iter().position(|r| &r.id == run_id)?;
        self.manual_queue.remove(index)
    }

    pub fn has_manual(&self) -> bool {
        !self.manual_queue.is_empty()
    }

    /// Queue contents in FIFO order.
    pub fn manual_runs(&self) -> Vec<Run> {
        self.manual_queue.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::TaskId;
    use chrono::TimeZone;

    fn run_at(secs: i64) -> Run {
        Run::new(TaskId::from("t"), Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[test]
    fn latest_in_flight_is_max_tick() {
        let mut state = TaskState::default();
        assert!(state.latest_in_flight().is_none());
        state.insert_in_flight(run_at(30));
        state.insert_in_flight(run_at(10));
        assert_eq!(
            state.latest_in_flight(),
            Some(Utc.timestamp_opt(30, 0).unwrap())
        );
    }

    #[test]
    fn take_manual_removes_from_middle() {
        let mut state = TaskState::default();
        let runs: Vec<Run> = (1..=3).map(|i| run_at(i * 10)).collect();
        let middle = runs[1].id.clone();
        for run in runs {
            state.push_manual(run);
        }
        let taken = state.take_manual(&middle).expect("queued");
        assert_eq!(taken.id, middle);
        let left: Vec<i64> = state
            .manual_runs()
            .iter()
            .map(|r| r.scheduled_for.timestamp())
            .collect();
        assert_eq!(left, vec![10, 30]);
        assert!(state.take_manual(&middle).is_none());
    }

    #[test]
    fn has_tick_sees_queue_and_in_flight() {
        let mut state = TaskState::default();
        state.insert_in_flight(run_at(10));
        state.push_manual(run_at(20));
        assert!(state.has_tick(Utc.timestamp_opt(10, 0).unwrap()));
        assert!(state.has_tick(Utc.timestamp_opt(20, 0).unwrap()));
        assert!(!state.has_tick(Utc.timestamp_opt(30, 0).unwrap()));
    }
}
