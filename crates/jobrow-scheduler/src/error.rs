//! Scheduler error types.

use jobrow_config::ConfigError;
use jobrow_db::DbError;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Job(#[from] jobrow_core::Error),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl SchedulerError {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        SchedulerError::Panicked(panic_message(payload.as_ref()))
    }
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// Callback for errors raised by pool tasks or timer ticks rather than by jobs.
pub type ThreadErrorHandler = Arc<dyn Fn(&SchedulerError) + Send + Sync>;

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
