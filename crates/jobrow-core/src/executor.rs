//! Executor trait and per-invocation execution context.
//!
//! The executor owns the job body: it interprets `serialized_params`, runs
//! the work and reports what happened. Besides its return value it can flag
//! two advisory outcomes on the [`ExecutionContext`]: that its own retry
//! policy will run the job again, or that it gave up and discarded it.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::{JobFailure, JobId};

/// Value produced by a job body.
///
/// Some executors report failures as returned values rather than raised
/// errors; those come back as [`JobOutput::Failure`] and are recorded the
/// same way as a raised failure.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    Value(serde_json::Value),
    Failure(JobFailure),
}

impl JobOutput {
    pub fn unit() -> Self {
        JobOutput::Value(serde_json::Value::Null)
    }
}

/// State for a single execution attempt.
///
/// A fresh context is built for every attempt so signals raised while
/// running one job never leak into the next job on the same worker.
#[derive(Debug)]
pub struct ExecutionContext {
    pub job_id: JobId,
    pub queue_name: Option<String>,
    pub process_id: u32,
    error_on_retry: Mutex<Option<JobFailure>>,
    error_on_discard: Mutex<Option<JobFailure>>,
}

impl ExecutionContext {
    pub fn new(job_id: JobId, queue_name: Option<String>) -> Self {
        Self {
            job_id,
            queue_name,
            process_id: std::process::id(),
            error_on_retry: Mutex::new(None),
            error_on_discard: Mutex::new(None),
        }
    }

    /// Record that the executor will retry this job because of `failure`.
    pub fn retry_with(&self, failure: JobFailure) {
        if let Ok(mut slot) = self.error_on_retry.lock() {
            *slot = Some(failure);
        }
    }

    /// Record that the executor discarded this job because of `failure`.
    pub fn discard_with(&self, failure: JobFailure) {
        if let Ok(mut slot) = self.error_on_discard.lock() {
            *slot = Some(failure);
        }
    }

    pub fn error_on_retry(&self) -> Option<JobFailure> {
        self.error_on_retry.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn error_on_discard(&self) -> Option<JobFailure> {
        self.error_on_discard.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Trait for job executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Run the job body described by `params`.
    ///
    /// `Err` is a raised failure. Implementations may also flag retry or
    /// discard on `ctx` regardless of what they return.
    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<JobOutput, JobFailure>;
}
