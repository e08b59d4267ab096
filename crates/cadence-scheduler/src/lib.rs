//! `cadence-scheduler`: task scheduling and run lifecycle tracking.
//!
//! # Overview
//!
//! A task carries either an `every` interval or a `cron` expression. The
//! [`service::SchedulerService`] resolves that into a cron schedule, decides
//! whether the next tick is due for a given "now", and creates at most one
//! run per tick. Executors then move runs through their states and finish
//! them, which advances the task's completion watermark.
//!
//! # Run states
//!
//! | From        | To                                 |
//! |-------------|------------------------------------|
//! | `Scheduled` | `Started`, `Success`, `Failed`, `Canceled` |
//! | `Started`   | `Success`, `Failed`, `Canceled`    |
//!
//! Manual runs (backfills and retries) sit in a per-task FIFO queue and are
//! served ahead of the regular schedule. [`driver::SchedulerDriver`] is a
//! ready-made polling loop on top of the service.

pub mod driver;
pub mod error;
pub mod options;
pub mod schedule;
pub mod service;
pub mod state;
pub mod store;
pub mod types;

pub use driver::SchedulerDriver;
pub use error::{Result, SchedulerError};
pub use service::{SchedulerService, TaskControlService};
pub use store::{InMemoryTaskStore, TaskStore};
pub use types::{QueuedRun, Run, RunCreation, RunFilter, RunLog, RunStatus, Task, TaskStatus};
