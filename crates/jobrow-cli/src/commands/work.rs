//! The long-running worker command.

use anyhow::{Context, Result};
use jobrow_config::QueueConfig;
use jobrow_scheduler::{
    JobRunner, PerformOptions, SchedulerHooks, SchedulerRegistry, from_configuration,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::connect;
use crate::WorkArgs;
use crate::command_executor::CommandExecutor;

/// Connections beyond one per worker, for selection queries.
const SPARE_CONNECTIONS: usize = 2;

/// Run schedulers for the configured queue groups until Ctrl-C.
pub async fn run(database_url: &str, args: WorkArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    let groups = config.queue_groups().context("Invalid queue configuration")?;
    let workers: usize = groups.iter().map(|g| g.max_threads).sum();
    let max_connections = u32::try_from(workers + SPARE_CONNECTIONS).unwrap_or(u32::MAX);

    let repo = Arc::new(connect(database_url, max_connections).await?);
    let executor = Arc::new(CommandExecutor::new(args.command, args.args));
    let runner = Arc::new(JobRunner::new(repo, executor, PerformOptions::from(&config)));

    let registry = SchedulerRegistry::new();
    let dispatcher = from_configuration(&config, runner, SchedulerHooks::default(), &registry)?;
    info!(
        queues = %config.queue_string,
        workers,
        poll_interval = config.poll_interval.as_secs_f64(),
        "Worker started"
    );

    // Pick up any backlog without waiting for the first poll.
    for _ in 0..workers {
        if !dispatcher.wake(None).is_started() {
            break;
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupt received, waiting for running jobs");

    registry.shutdown_all(true).await;
    info!("Worker stopped");
    Ok(())
}

/// File configuration, when given, overridden by flags and environment.
fn resolve_config(args: &WorkArgs) -> Result<QueueConfig> {
    let mut config = match &args.config {
        Some(path) => QueueConfig::load(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?,
        None => QueueConfig::default(),
    };

    if let Some(queues) = &args.queues {
        config.queue_string = queues.clone();
    }
    if let Some(max_threads) = args.max_threads {
        anyhow::ensure!(max_threads > 0, "max-threads must be at least 1");
        config.max_threads = max_threads;
    }
    if let Some(secs) = args.poll_interval {
        config.poll_interval = seconds(secs);
    }
    if let Some(secs) = args.shutdown_timeout {
        config.shutdown_timeout = seconds(secs);
    }
    if let Some(preserve) = args.preserve_job_records {
        config.preserve_job_records = preserve;
    }
    if let Some(reperform) = args.reperform_jobs_on_standard_error {
        config.reperform_jobs_on_standard_error = reperform;
    }

    Ok(config)
}

/// Non-positive or unrepresentable values become zero.
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::ZERO)
}
