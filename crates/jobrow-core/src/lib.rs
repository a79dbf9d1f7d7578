//! Core domain types and traits for the jobrow work queue.
//!
//! This crate contains:
//! - Job identifiers and records
//! - Queue selection rules
//! - The executor trait that runs job bodies
//! - Instrumentation events

pub mod error;
pub mod executor;
pub mod id;
pub mod instrument;
pub mod job;
pub mod queue;

pub use error::{Error, Result};
pub use executor::{ExecutionContext, Executor, JobOutput};
pub use id::JobId;
pub use instrument::{Event, Instrumenter, NoopInstrumenter, TracingInstrumenter};
pub use job::{DEFAULT_PRIORITY, DEFAULT_QUEUE_NAME, Job, JobFailure, NewJob};
pub use queue::QueueSelector;
