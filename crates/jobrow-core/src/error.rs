//! Error types for jobrow.

use thiserror::Error;

use crate::JobId;

#[derive(Debug, Error)]
pub enum Error {
    /// A finished job was handed to the executor again.
    #[error("cannot perform job {0}: it has already been performed")]
    PreviouslyPerformed(JobId),

    /// Another session holds the advisory lock for this job.
    #[error("advisory lock for job {0} is held elsewhere")]
    LockUnavailable(JobId),

    /// The lock was reported as granted but this session does not own it.
    #[error("advisory lock for job {0} was granted but is not owned by this session")]
    UnownedLockRace(JobId),

    #[error("invalid job id {input:?}: {reason}")]
    InvalidJobId { input: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
