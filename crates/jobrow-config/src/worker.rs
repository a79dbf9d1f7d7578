//! Worker configuration parsing.

use kdl::{KdlDocument, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{ConfigError, ConfigResult, QueueGroup};

/// Settings that drive job execution and scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue groups to schedule, see [`QueueGroup`].
    pub queue_string: String,
    /// Worker count for groups that do not name one.
    pub max_threads: usize,
    /// How often idle schedulers look for work. Zero disables polling.
    pub poll_interval: Duration,
    /// Upper bound on how long a waiting shutdown lets in-flight jobs run.
    pub shutdown_timeout: Duration,
    /// Keep finished rows instead of deleting them.
    pub preserve_job_records: bool,
    /// Leave a job unfinished, to be claimed again, when its body raises.
    pub reperform_jobs_on_standard_error: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_string: "*".to_string(),
            max_threads: 5,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
            preserve_job_records: false,
            reperform_jobs_on_standard_error: true,
        }
    }
}

impl QueueConfig {
    /// Read and parse a KDL configuration file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_kdl(&content)
    }

    /// Parse configuration from KDL text. Missing nodes keep their defaults.
    pub fn from_kdl(kdl: &str) -> ConfigResult<Self> {
        let doc: KdlDocument = kdl.parse()?;
        let mut config = Self::default();

        for node in doc.nodes() {
            match node.name().value() {
                "queues" => config.queue_string = string_arg(node)?,
                "max-threads" => config.max_threads = thread_count(node)?,
                "poll-interval" => config.poll_interval = seconds_arg(node)?,
                "shutdown-timeout" => config.shutdown_timeout = seconds_arg(node)?,
                "preserve-job-records" => config.preserve_job_records = bool_arg(node)?,
                "reperform-jobs-on-standard-error" => {
                    config.reperform_jobs_on_standard_error = bool_arg(node)?
                }
                _ => {} // Ignore unknown nodes
            }
        }

        Ok(config)
    }

    /// The scheduling groups described by `queue_string`.
    pub fn queue_groups(&self) -> ConfigResult<Vec<QueueGroup>> {
        QueueGroup::parse_all(&self.queue_string, self.max_threads)
    }
}

fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn invalid(node: &KdlNode, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: node.name().value().to_string(),
        message: message.to_string(),
    }
}

fn string_arg(node: &KdlNode) -> ConfigResult<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
        .ok_or_else(|| invalid(node, "expected a string"))
}

fn bool_arg(node: &KdlNode) -> ConfigResult<bool> {
    first_arg(node)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| invalid(node, "expected #true or #false"))
}

fn thread_count(node: &KdlNode) -> ConfigResult<usize> {
    let count = first_arg(node)
        .and_then(|v| v.as_integer())
        .ok_or_else(|| invalid(node, "expected an integer"))?;
    usize::try_from(count)
        .ok()
        .filter(|c| *c > 0)
        .ok_or_else(|| invalid(node, "must be at least 1"))
}

/// Seconds as an integer or float. Non-positive values become zero.
fn seconds_arg(node: &KdlNode) -> ConfigResult<Duration> {
    let value = first_arg(node).ok_or_else(|| invalid(node, "expected a number of seconds"))?;
    let secs = match (value.as_integer(), value.as_float()) {
        (Some(i), _) => i as f64,
        (None, Some(f)) => f,
        (None, None) => return Err(invalid(node, "expected a number of seconds")),
    };
    if secs.is_finite() && secs > 0.0 {
        Ok(Duration::from_secs_f64(secs))
    } else {
        Ok(Duration::ZERO)
    }
}
