use std::sync::Arc;

use cadence_scheduler::{QueuedRun, RunStatus, TaskControlService};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Executor that records each run as a successful no-op.
///
/// Query execution lives outside this process; this executor only walks
/// runs through their lifecycle so the schedule and watermark advance.
pub struct LogExecutor {
    control: Arc<dyn TaskControlService>,
}

impl LogExecutor {
    pub fn new(control: Arc<dyn TaskControlService>) -> Self {
        Self { control }
    }

    /// Consume created runs until the driver drops its sender.
    pub async fn run(self, mut created_rx: mpsc::Receiver<QueuedRun>) {
        while let Some(run) = created_rx.recv().await {
            if let Err(e) = self.execute(&run) {
                warn!(task_id = %run.task_id, run_id = %run.run_id, error = %e, "run execution failed");
            }
        }
        info!("executor channel closed");
    }

    fn execute(&self, run: &QueuedRun) -> cadence_scheduler::Result<()> {
        let (task_id, run_id) = (&run.task_id, &run.run_id);

        self.control
            .update_run_state(task_id, run_id, RunStatus::Started, Utc::now())?;
        self.control.add_run_log(
            task_id,
            run_id,
            Utc::now(),
            &format!("executing tick {}", run.scheduled_for.to_rfc3339()),
        )?;
        self.control
            .update_run_state(task_id, run_id, RunStatus::Success, Utc::now())?;
        let finished = self.control.finish_run(task_id, run_id)?;

        info!(%task_id, %run_id, scheduled_for = %finished.scheduled_for, "run succeeded");
        Ok(())
    }
}
