//! Building schedulers from worker configuration.

use jobrow_config::QueueConfig;
use jobrow_db::JobStore;
use std::sync::Arc;
use tracing::info;

use crate::{
    JobRunner, MultiScheduler, Performer, Scheduler, SchedulerHooks, SchedulerOptions,
    SchedulerRegistry, SchedulerResult, WakeOutcome, WakeState,
};

/// The schedulers for one worker process.
#[derive(Debug, Clone)]
pub enum Dispatcher {
    Single(Scheduler),
    Multi(MultiScheduler),
}

impl Dispatcher {
    pub fn wake(&self, state: Option<&WakeState>) -> WakeOutcome {
        match self {
            Dispatcher::Single(s) => s.wake(state),
            Dispatcher::Multi(m) => m.wake(state),
        }
    }

    pub async fn shutdown(&self, wait: bool) {
        match self {
            Dispatcher::Single(s) => s.shutdown(wait).await,
            Dispatcher::Multi(m) => m.shutdown(wait).await,
        }
    }

    pub async fn restart(&self, wait: bool) {
        match self {
            Dispatcher::Single(s) => s.restart(wait).await,
            Dispatcher::Multi(m) => m.restart(wait).await,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        match self {
            Dispatcher::Single(s) => s.is_shutdown(),
            Dispatcher::Multi(m) => m.is_shutdown(),
        }
    }

    pub fn schedulers(&self) -> Vec<Scheduler> {
        match self {
            Dispatcher::Single(s) => vec![s.clone()],
            Dispatcher::Multi(m) => m.schedulers().to_vec(),
        }
    }
}

/// One scheduler per queue group in `config`, in configured order.
///
/// A single group yields a plain scheduler; several are wrapped in a
/// [`MultiScheduler`]. Every scheduler is added to `registry`.
pub fn from_configuration<R: JobStore>(
    config: &QueueConfig,
    runner: Arc<JobRunner<R>>,
    hooks: SchedulerHooks,
    registry: &SchedulerRegistry,
) -> SchedulerResult<Dispatcher> {
    let groups = config.queue_groups()?;

    let mut schedulers = Vec::with_capacity(groups.len());
    for group in &groups {
        let performer = Performer::for_queue_group(runner.clone(), group);
        let options = SchedulerOptions::for_group(group, config);
        schedulers.push(Scheduler::new(performer, options, hooks.clone(), registry)?);
    }

    info!(groups = schedulers.len(), queues = %config.queue_string, "Schedulers configured");

    if schedulers.len() == 1 {
        if let Some(only) = schedulers.pop() {
            return Ok(Dispatcher::Single(only));
        }
    }
    Ok(Dispatcher::Multi(MultiScheduler::new(schedulers)))
}
