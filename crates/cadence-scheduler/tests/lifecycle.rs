// End-to-end run lifecycle scenarios against the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;

use cadence_core::{OrgId, TaskId};
use cadence_scheduler::options::effective_cron;
use cadence_scheduler::schedule::TaskSchedule;
use cadence_scheduler::{
    InMemoryTaskStore, RunStatus, SchedulerError, SchedulerService, Task, TaskControlService,
    TaskStatus, TaskStore,
};
use chrono::{DateTime, TimeZone, Utc};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn every_task(id: &str, every: &str) -> Task {
    Task {
        id: TaskId::from(id),
        org_id: OrgId::new("org"),
        name: id.to_string(),
        every: Some(every.to_string()),
        cron: None,
        offset: None,
        concurrency: 1,
        status: TaskStatus::Active,
        latest_completed: None,
    }
}

fn setup(task: Task) -> (SchedulerService, Arc<InMemoryTaskStore>, TaskId) {
    let id = task.id.clone();
    let store = Arc::new(InMemoryTaskStore::new());
    store.upsert_task(task);
    (SchedulerService::new(store.clone()), store, id)
}

#[test]
fn ten_second_task_first_run_then_not_due() {
    let (svc, store, id) = setup(every_task("every-10s", "10s"));
    let schedule = TaskSchedule::parse(&effective_cron(&every_task("x", "10s")).unwrap()).unwrap();
    let now = at(15);

    let rc = svc.create_next_run(&id, now).unwrap();
    let first_tick = schedule.next_after(at(0)).unwrap();
    assert_eq!(rc.created.scheduled_for, first_tick);
    assert_eq!(rc.next_due, schedule.next_after(first_tick).unwrap());
    assert_eq!(rc.created.task_id, id);

    let finished = svc.finish_run(&id, &rc.created.run_id).unwrap();
    assert_eq!(finished.scheduled_for, first_tick);
    let task = store.find_task(&id).unwrap().unwrap();
    assert_eq!(task.latest_completed, Some(first_tick));

    // Less than 10s after the first tick: nothing to do until the next one.
    match svc.create_next_run(&id, now) {
        Err(SchedulerError::RunNotDueYet { due_at }) => assert_eq!(due_at, at(20)),
        other => panic!("expected RunNotDueYet, got {other:?}"),
    }
}

#[test]
fn no_duplicate_ticks_while_in_flight() {
    let (svc, _, id) = setup(every_task("t", "1m"));
    let mut seen = HashSet::new();
    for now in (0..20).map(|i| at(3_600 + i * 7)) {
        match svc.create_next_run(&id, now) {
            Ok(rc) => assert!(seen.insert(rc.created.scheduled_for), "duplicate tick"),
            Err(e) => assert!(e.is_not_due_yet(), "unexpected error {e}"),
        }
    }
    let running = svc.currently_running(&id).unwrap();
    assert_eq!(running.len(), seen.len());
}

#[test]
fn watermark_is_monotone_for_any_finish_order() {
    let (svc, store, id) = setup(every_task("t", "10s"));
    let created: Vec<_> = (0..5)
        .map(|_| svc.create_next_run(&id, at(1_000)).unwrap().created)
        .collect();

    let order = [3, 0, 4, 1, 2];
    let mut previous = None;
    for i in order {
        svc.finish_run(&id, &created[i].run_id).unwrap();
        let current = store.find_task(&id).unwrap().unwrap().latest_completed;
        assert!(current >= previous, "watermark moved backwards");
        previous = current;
    }
    assert_eq!(previous, Some(at(50)));
}

#[test]
fn finished_watermark_feeds_next_gate_evaluation() {
    let (svc, _, id) = setup(every_task("t", "10s"));
    let rc = svc.create_next_run(&id, at(10)).unwrap();
    svc.update_run_state(&id, &rc.created.run_id, RunStatus::Started, at(10))
        .unwrap();
    svc.update_run_state(&id, &rc.created.run_id, RunStatus::Success, at(11))
        .unwrap();
    svc.finish_run(&id, &rc.created.run_id).unwrap();

    assert_eq!(svc.next_due_run(&id).unwrap(), at(20));
    let rc = svc.create_next_run(&id, at(20)).unwrap();
    assert_eq!(rc.created.scheduled_for, at(20));
}

#[test]
fn cron_task_uses_literal_expression() {
    let mut task = every_task("cron", "7h");
    task.cron = Some("0 */5 * * * *".to_string());
    let (svc, _, id) = setup(task);
    assert_eq!(svc.next_due_run(&id).unwrap(), at(300));
}

#[test]
fn retry_after_failure_round_trip() {
    let (svc, _, id) = setup(every_task("t", "10s"));
    let rc = svc.create_next_run(&id, at(10)).unwrap();
    let original = rc.created.run_id;
    svc.add_run_log(&id, &original, at(10), "boom").unwrap();
    svc.update_run_state(&id, &original, RunStatus::Failed, at(11))
        .unwrap();
    svc.finish_run(&id, &original).unwrap();

    let retry = svc.retry_run(&id, &original).unwrap();
    let queued = svc.manual_runs(&id).unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, retry.id);

    let rc = svc.create_next_run(&id, at(0)).unwrap();
    assert_eq!(rc.created.run_id, retry.id);
    assert_eq!(rc.created.scheduled_for, at(10));

    // The failed original keeps its log after leaving the in-flight set.
    let logs = svc.run_logs(&id, &original).unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].message, "boom");
}

#[test]
fn concurrent_tasks_progress_independently() {
    let store = Arc::new(InMemoryTaskStore::new());
    let ids: Vec<TaskId> = (0..8)
        .map(|i| {
            let task = every_task(&format!("task-{i}"), "1s");
            let id = task.id.clone();
            store.upsert_task(task);
            id
        })
        .collect();
    let svc = Arc::new(SchedulerService::new(store.clone()));

    let handles: Vec<_> = ids
        .iter()
        .cloned()
        .map(|id| {
            let svc = svc.clone();
            std::thread::spawn(move || {
                for _ in 0..25 {
                    let rc = svc.create_next_run(&id, at(1_000)).unwrap();
                    svc.finish_run(&id, &rc.created.run_id).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for id in &ids {
        let task = store.find_task(id).unwrap().unwrap();
        assert_eq!(task.latest_completed, Some(at(25)));
        assert!(svc.currently_running(id).unwrap().is_empty());
    }
}
