//! Job execution and scheduling for jobrow.
//!
//! A [`JobRunner`] owns the execution protocol for a single job. Claiming
//! takes the best eligible row under a session advisory lock, so exactly
//! one worker runs it. [`Scheduler`]s keep a bounded pool of tokio tasks
//! fed with claim attempts, and a [`MultiScheduler`] splits work across
//! queue groups.

pub mod builder;
pub mod claim;
pub mod error;
pub mod multi;
pub mod performer;
mod pool;
pub mod registry;
pub mod runner;
pub mod scheduler;

#[cfg(test)]
mod test_support;

pub use builder::{Dispatcher, from_configuration};
pub use error::{SchedulerError, SchedulerResult, ThreadErrorHandler};
pub use multi::MultiScheduler;
pub use performer::{Performer, WakeState};
pub use registry::SchedulerRegistry;
pub use runner::{JobRunner, PerformOptions, PerformedJob, enqueue};
pub use scheduler::{Scheduler, SchedulerHooks, SchedulerOptions, WakeOutcome};
