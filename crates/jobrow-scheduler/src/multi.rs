//! Fan-out of wake-ups across queue-scoped schedulers.

use futures::future::join_all;

use crate::{Scheduler, WakeOutcome, WakeState};

/// An ordered list of schedulers that share one wake signal.
///
/// Children are offered a wake-up in order, so earlier groups get first
/// refusal when queue scopes overlap.
#[derive(Debug, Clone)]
pub struct MultiScheduler {
    schedulers: Vec<Scheduler>,
}

impl MultiScheduler {
    pub fn new(schedulers: Vec<Scheduler>) -> Self {
        Self { schedulers }
    }

    pub fn schedulers(&self) -> &[Scheduler] {
        &self.schedulers
    }

    /// Offer the wake-up to each child until one starts work.
    ///
    /// If none starts, the result is [`WakeOutcome::Declined`] when at least
    /// one child declined the hint, otherwise [`WakeOutcome::Unavailable`].
    pub fn wake(&self, state: Option<&WakeState>) -> WakeOutcome {
        let mut declined = false;
        for scheduler in &self.schedulers {
            match scheduler.wake(state) {
                WakeOutcome::Started => return WakeOutcome::Started,
                WakeOutcome::Declined => declined = true,
                WakeOutcome::Unavailable => {}
            }
        }

        if declined {
            WakeOutcome::Declined
        } else {
            WakeOutcome::Unavailable
        }
    }

    pub async fn shutdown(&self, wait: bool) {
        join_all(self.schedulers.iter().map(|s| s.shutdown(wait))).await;
    }

    pub async fn restart(&self, wait: bool) {
        join_all(self.schedulers.iter().map(|s| s.restart(wait))).await;
    }

    /// Whether every child has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.schedulers.iter().all(Scheduler::is_shutdown)
    }
}
