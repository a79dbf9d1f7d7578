//! Live scheduler bookkeeping.

use futures::future::join_all;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

use crate::Scheduler;

/// Every scheduler built against this registry, in creation order.
///
/// Cloning shares the same collection. Entries are never removed; the
/// registry lives as long as whatever owns the schedulers.
#[derive(Clone, Default)]
pub struct SchedulerRegistry {
    instances: Arc<Mutex<Vec<Scheduler>>>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, scheduler: Scheduler) {
        self.lock().push(scheduler);
    }

    /// A snapshot of the registered schedulers.
    pub fn instances(&self) -> Vec<Scheduler> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Shut down every registered scheduler concurrently.
    pub async fn shutdown_all(&self, wait: bool) {
        let instances = self.instances();
        info!(count = instances.len(), wait, "Shutting down schedulers");
        join_all(instances.iter().map(|s| s.shutdown(wait))).await;
    }

    /// Restart every registered scheduler concurrently.
    pub async fn restart_all(&self, wait: bool) {
        let instances = self.instances();
        info!(count = instances.len(), wait, "Restarting schedulers");
        join_all(instances.iter().map(|s| s.restart(wait))).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Scheduler>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SchedulerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.instances().iter().map(|s| s.name().to_string())).finish()
    }
}
