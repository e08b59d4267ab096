use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::CadenceConfig;
use cadence_scheduler::options::effective_offset;
use cadence_scheduler::schedule::TaskSchedule;
use cadence_scheduler::{InMemoryTaskStore, SchedulerDriver, SchedulerService, Task};
use clap::Parser;
use tracing::{info, warn};

mod executor;

#[derive(Debug, Parser)]
#[command(name = "cadence-daemon", about = "Run scheduled tasks on an interval or cron schedule")]
struct Args {
    /// Path to cadence.toml (default: ~/.cadence/cadence.toml)
    #[arg(short, long, env = "CADENCE_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_daemon=info,cadence_scheduler=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = CadenceConfig::load(args.config.as_deref())?;

    let store = Arc::new(InMemoryTaskStore::new());
    let provisioned = provision_tasks(&store, &config);
    info!(tasks = provisioned, "tasks provisioned");

    let service = Arc::new(SchedulerService::new(store));
    let (created_tx, created_rx) = tokio::sync::mpsc::channel(config.scheduler.channel_capacity);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let driver = SchedulerDriver::new(
        service.clone(),
        Duration::from_millis(config.scheduler.poll_interval_ms),
        created_tx,
    );
    let driver_handle = tokio::spawn(driver.run(shutdown_rx));
    let executor_handle = tokio::spawn(executor::LogExecutor::new(service).run(created_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown_tx.send(true)?;

    // The driver owns the only sender; once it exits the executor drains and stops.
    driver_handle.await?;
    executor_handle.await?;
    Ok(())
}

/// Load every valid task definition into the store. Returns how many were accepted.
fn provision_tasks(store: &InMemoryTaskStore, config: &CadenceConfig) -> usize {
    let now = chrono::Utc::now();
    let mut accepted = 0;
    for task_config in &config.tasks {
        let task = Task::from_config(task_config, now);
        match resolve_schedule(&task) {
            Ok((schedule, offset)) => {
                info!(
                    task_id = %task.id,
                    name = %task.name,
                    cron = schedule.expression(),
                    offset_secs = offset.num_seconds(),
                    "task provisioned"
                );
                store.upsert_task(task);
                accepted += 1;
            }
            Err(e) => warn!(name = %task.name, error = %e, "skipping task with invalid schedule"),
        }
    }
    accepted
}

fn resolve_schedule(task: &Task) -> cadence_scheduler::Result<(TaskSchedule, chrono::Duration)> {
    Ok((TaskSchedule::for_task(task)?, effective_offset(task)?))
}
