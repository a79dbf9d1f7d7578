//! Job records and failure summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// Jobs enqueued without a queue name are placed on this queue.
pub const DEFAULT_QUEUE_NAME: &str = "default";

/// Jobs enqueued without a priority are given this priority.
pub const DEFAULT_PRIORITY: i32 = 0;

/// A persisted request to perform a unit of deferred work.
///
/// `finished_at` is the authoritative "still work to do" flag: a job with
/// `finished_at` set is terminal and must never be executed again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Queue the job was placed on. Rows written by other producers may
    /// carry no queue at all.
    pub queue_name: Option<String>,
    /// Higher values are served first.
    pub priority: i32,
    /// Opaque payload owned by the executor.
    pub serialized_params: serde_json::Value,
    /// The job is not eligible for claiming before this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Set when execution begins.
    pub performed_at: Option<DateTime<Utc>>,
    /// Set when execution concludes without a retry.
    pub finished_at: Option<DateTime<Utc>>,
    /// Summary of the last failure, `"<kind>: <message>"`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh, unsaved job from an enqueue request.
    pub fn from_new(new: NewJob, now: DateTime<Utc>) -> Self {
        let queue_name = new
            .queue_name
            .filter(|q| !q.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string());

        Self {
            id: JobId::new(),
            queue_name: Some(queue_name),
            priority: new.priority.unwrap_or(DEFAULT_PRIORITY),
            serialized_params: new.serialized_params,
            scheduled_at: new.scheduled_at,
            performed_at: None,
            finished_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Whether the schedule allows claiming this job at `now`.
    pub fn is_scheduled_by(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Whether a claim cycle run at `now` may select this job, ignoring queue scope.
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_finished() && self.is_scheduled_by(now)
    }
}

/// Request to enqueue a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewJob {
    pub queue_name: Option<String>,
    pub priority: Option<i32>,
    pub serialized_params: serde_json::Value,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(serialized_params: serde_json::Value) -> Self {
        Self {
            serialized_params,
            ..Default::default()
        }
    }

    pub fn queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

/// A failure raised by, or reported through, the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Short name of the failure kind, e.g. `"IoError"` or `"panic"`.
    pub kind: String,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Build a failure from any error, using the error's type name as the kind.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        let type_name = std::any::type_name::<E>();
        let kind = type_name.rsplit("::").next().unwrap_or(type_name);
        Self::new(kind, error.to_string())
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for JobFailure {}
