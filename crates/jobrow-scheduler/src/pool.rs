//! Bounded worker pool.
//!
//! Workers are tokio tasks; a semaphore caps how many run at once. A slot
//! is reserved before a task is spawned and is returned when the task's
//! work is done, before its completion callback runs.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub(crate) struct WorkerPool {
    name: String,
    max_workers: usize,
    slots: Arc<Semaphore>,
    running: AtomicBool,
}

impl WorkerPool {
    pub(crate) fn new(name: impl Into<String>, max_workers: usize) -> Self {
        Self {
            name: name.into(),
            max_workers,
            slots: Arc::new(Semaphore::new(max_workers)),
            running: AtomicBool::new(true),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Workers that could start a task right now.
    pub(crate) fn ready_worker_count(&self) -> usize {
        if self.is_running() {
            self.slots.available_permits()
        } else {
            0
        }
    }

    /// Tasks still executing.
    pub(crate) fn active_count(&self) -> usize {
        self.max_workers
            .saturating_sub(self.slots.available_permits())
    }

    /// Reserve a worker slot without waiting.
    pub(crate) fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        if !self.is_running() {
            return None;
        }
        self.slots.clone().try_acquire_owned().ok()
    }

    /// Run `work` on a reserved slot, then hand its output to `on_complete`.
    pub(crate) fn execute<F, C>(&self, slot: OwnedSemaphorePermit, work: F, on_complete: C)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
        C: FnOnce(F::Output) + Send + 'static,
    {
        tokio::spawn(async move {
            let output = work.await;
            drop(slot);
            on_complete(output);
        });
    }

    /// Stop accepting work. Running tasks are left to finish.
    pub(crate) fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait up to `timeout` for every running task to finish.
    /// Returns whether the pool drained in time.
    pub(crate) async fn wait_for_termination(&self, timeout: Duration) -> bool {
        let all = u32::try_from(self.max_workers).unwrap_or(u32::MAX);
        match tokio::time::timeout(timeout, self.slots.acquire_many(all)).await {
            Ok(Ok(permits)) => {
                drop(permits);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        !self.is_running() && self.active_count() == 0
    }
}
