//! Storage errors.

use jobrow_core::JobId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    /// No row with this id, e.g. it was destroyed after finishing.
    #[error("job {0} does not exist")]
    NotFound(JobId),

    #[error("job {0} already exists")]
    Duplicate(JobId),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to apply migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;
