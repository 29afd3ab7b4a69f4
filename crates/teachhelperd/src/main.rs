//! TeachHelper evaluation daemon.
//!
//! Builds the evaluation service, forwards task updates to the log stream
//! and runs the maintenance jobs until ctrl-c.

mod config;
mod jobs;
mod scheduler;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use teachhelper_core::{init_tracing, EvaluationService, TaskUpdate};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::jobs::{PruneFinishedTasks, RuntimeStats};
use crate::scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    let config = DaemonConfig::parse();
    init_tracing(config.log_json, config.log_level);

    let service = EvaluationService::new(config.batch_config(), config.update_capacity);
    let forwarder = spawn_update_forwarder(service.updates().subscribe());

    let mut scheduler = Scheduler::new();
    scheduler.register(
        Arc::new(PruneFinishedTasks::new(
            Arc::clone(service.tracker()),
            Arc::clone(service.updates()),
            config.retention(),
        )),
        config.prune_interval(),
    );
    scheduler.register(
        Arc::new(RuntimeStats::new(
            Arc::clone(service.runtime()),
            Arc::clone(service.tracker()),
        )),
        config.stats_interval(),
    );

    info!(
        version = teachhelper_core::VERSION,
        max_concurrency = config.max_concurrency,
        max_attempts = config.max_attempts,
        jobs = scheduler.job_count(),
        "teachhelperd started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    for task_id in service.runtime().running_ids() {
        service.cancel(&task_id).await;
    }
    scheduler.shutdown().await;
    forwarder.abort();

    info!("teachhelperd stopped");
    Ok(())
}

/// Forward task updates to the log as client-ready JSON.
fn spawn_update_forwarder(mut updates: broadcast::Receiver<TaskUpdate>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => match update.to_json() {
                    Ok(json) => debug!(task_id = %update.task_id, payload = %json, "task update"),
                    Err(e) => {
                        warn!(task_id = %update.task_id, error = %e, "failed to encode task update")
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "task update forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
