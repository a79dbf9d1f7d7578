//! Enqueueing and executing jobs.
//!
//! [`JobRunner::perform`] drives one execution attempt of one job:
//!
//! 1. refuse jobs that already finished
//! 2. stamp `performed_at`, persisting it right away when records are kept
//! 3. run the executor, normalizing raised failures, returned failures,
//!    panics and retry/discard signals into a single error summary
//! 4. either leave the job unfinished for another claim (a raised failure
//!    with reperform enabled) or finish it, deleting the row unless
//!    records are kept

use chrono::Utc;
use futures::FutureExt;
use jobrow_config::QueueConfig;
use jobrow_core::instrument::emit;
use jobrow_core::{
    Error, Event, ExecutionContext, Executor, Instrumenter, Job, JobFailure, JobId, JobOutput,
    NewJob, TracingInstrumenter,
};
use jobrow_db::{JobRepo, JobStore};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::panic_message;
use crate::SchedulerResult;

/// How finished and failing jobs are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerformOptions {
    /// Keep finished rows instead of deleting them.
    pub preserve_job_records: bool,
    /// Leave a job unfinished when its body raises.
    pub reperform_jobs_on_standard_error: bool,
}

impl Default for PerformOptions {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for PerformOptions {
    fn from(config: &QueueConfig) -> Self {
        Self {
            preserve_job_records: config.preserve_job_records,
            reperform_jobs_on_standard_error: config.reperform_jobs_on_standard_error,
        }
    }
}

/// A job that was claimed and run, with what its body produced.
#[derive(Debug, Clone)]
pub struct PerformedJob {
    /// The job as it stood after the attempt.
    pub job: Job,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobFailure>,
}

/// Enqueues jobs into a store and runs them through an executor.
pub struct JobRunner<R: JobStore> {
    pub(crate) repo: Arc<R>,
    executor: Arc<dyn Executor>,
    options: PerformOptions,
    pub(crate) instrumenter: Arc<dyn Instrumenter>,
}

impl<R: JobStore> JobRunner<R> {
    pub fn new(repo: Arc<R>, executor: Arc<dyn Executor>, options: PerformOptions) -> Self {
        Self {
            repo,
            executor,
            options,
            instrumenter: Arc::new(TracingInstrumenter),
        }
    }

    pub fn with_instrumenter(mut self, instrumenter: Arc<dyn Instrumenter>) -> Self {
        self.instrumenter = instrumenter;
        self
    }

    pub fn repo(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn options(&self) -> PerformOptions {
        self.options
    }

    /// Persist a new job.
    pub async fn enqueue(&self, new: NewJob) -> SchedulerResult<Job> {
        enqueue(self.repo.as_ref(), self.instrumenter.as_ref(), new).await
    }

    /// Persist a new job that this session already holds the lock for, so
    /// no worker can claim it until the returned lock is released.
    pub async fn enqueue_locked(&self, new: NewJob) -> SchedulerResult<(Job, R::Lock)> {
        let job = Job::from_new(new, Utc::now());
        let lock = self
            .repo
            .try_lock(job.id)
            .await?
            .ok_or(Error::LockUnavailable(job.id))?;

        if let Err(e) = self.repo.insert(&job).await {
            if let Err(unlock_err) = self.repo.unlock(lock).await {
                warn!(job_id = %job.id, error = %unlock_err, "Failed to release lock after enqueue error");
            }
            return Err(e.into());
        }

        instrument_enqueue(self.instrumenter.as_ref(), &job, true);
        info!(job_id = %job.id, queue = ?job.queue_name, "Enqueued locked job");
        Ok((job, lock))
    }

    /// Run one execution attempt of `job`, updating it in place and in storage.
    ///
    /// Failures of the job body never surface as `Err`; they are returned
    /// in the tuple and recorded on the job. `Err` means the job had already
    /// finished or storage failed.
    pub async fn perform(
        &self,
        job: &mut Job,
    ) -> SchedulerResult<(Option<serde_json::Value>, Option<JobFailure>)> {
        if job.is_finished() {
            return Err(Error::PreviouslyPerformed(job.id).into());
        }

        let ctx = ExecutionContext::new(job.id, job.queue_name.clone());

        job.performed_at = Some(Utc::now());
        if self.options.preserve_job_records {
            self.repo.save(job).await?;
        }

        let params = params_with_provider_id(&job.serialized_params, job.id);

        emit(
            self.instrumenter.as_ref(),
            Event::new("perform_job_start")
                .with("job_id", job.id)
                .with("executor", self.executor.name()),
        );
        let started = Instant::now();

        let outcome = AssertUnwindSafe(self.executor.execute(params, &ctx))
            .catch_unwind()
            .await;

        let (result, raised, returned) = match outcome {
            Ok(Ok(JobOutput::Value(value))) => (Some(value), None, None),
            Ok(Ok(JobOutput::Failure(failure))) => (None, None, Some(failure)),
            Ok(Err(failure)) => (None, Some(failure), None),
            Err(payload) => (
                None,
                Some(JobFailure::new("panic", panic_message(payload.as_ref()))),
                None,
            ),
        };

        let retry_or_discard = ctx.error_on_retry().or_else(|| ctx.error_on_discard());
        let reperform = raised.is_some() && self.options.reperform_jobs_on_standard_error;
        let error = raised.or(returned).or(retry_or_discard);

        job.error = error.as_ref().map(ToString::to_string);

        emit(
            self.instrumenter.as_ref(),
            Event::new("perform_job")
                .with("job_id", job.id)
                .with("executor", self.executor.name())
                .with("duration_ms", started.elapsed().as_millis())
                .with("error", job.error.as_deref().unwrap_or("")),
        );

        if reperform {
            self.repo.save(job).await?;
            warn!(job_id = %job.id, error = ?job.error, "Job failed, will be reperformed");
        } else {
            job.finished_at = Some(Utc::now());
            if self.options.preserve_job_records {
                self.repo.save(job).await?;
            } else {
                self.repo.destroy(job.id).await?;
            }
            match &job.error {
                Some(e) => warn!(job_id = %job.id, error = %e, "Job finished with error"),
                None => info!(job_id = %job.id, "Job finished"),
            }
        }

        Ok((result, error))
    }
}

/// Persist a new job in `repo` and report it to `instrumenter`.
///
/// Producers that have no runner, such as the command line, enqueue
/// through this so the `enqueue_job` event is emitted on every path.
pub async fn enqueue<R: JobRepo + ?Sized>(
    repo: &R,
    instrumenter: &dyn Instrumenter,
    new: NewJob,
) -> SchedulerResult<Job> {
    let job = Job::from_new(new, Utc::now());
    repo.insert(&job).await?;
    instrument_enqueue(instrumenter, &job, false);
    info!(job_id = %job.id, queue = ?job.queue_name, priority = job.priority, "Enqueued job");
    Ok(job)
}

fn instrument_enqueue(instrumenter: &dyn Instrumenter, job: &Job, locked: bool) {
    let mut event = Event::new("enqueue_job")
        .with("job_id", job.id)
        .with("priority", job.priority)
        .with("create_with_advisory_lock", locked);
    if let Some(queue) = &job.queue_name {
        event = event.with("queue_name", queue);
    }
    if let Some(at) = job.scheduled_at {
        event = event.with("scheduled_at", at.to_rfc3339());
    }
    emit(instrumenter, event);
}

/// Executor parameters with the job's id merged in as `provider_job_id`.
fn params_with_provider_id(params: &serde_json::Value, id: JobId) -> serde_json::Value {
    let mut params = params.clone();
    if let Some(map) = params.as_object_mut() {
        map.insert(
            "provider_job_id".to_string(),
            serde_json::Value::String(id.to_string()),
        );
    }
    params
}
