use thiserror::Error;

use crate::job::{JobId, JobStatus};

/// Failure of a single call to the completion provider.
///
/// Every variant is retriable from the scheduler's point of view; the
/// recorder decides whether the job gets another attempt.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    #[error("completion call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("{provider} request failed ({status}): {reason}")]
    RequestFailed {
        provider: String,
        status: u16,
        reason: String,
    },

    #[error("{provider} quota exceeded: {reason}")]
    QuotaExceeded { provider: String, reason: String },

    #[error("{provider} returned an invalid response: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("execution lease expired after {0}s without an outcome")]
    LeaseExpired(i64),
}

impl From<reqwest::Error> for ExecutionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExecutionError::Timeout(std::time::Duration::ZERO)
        } else {
            ExecutionError::Transport(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no carbon intensity sample available: {0}")]
    UpstreamUnavailable(String),

    #[error("job {job_id} is {actual}, expected {expected}")]
    StateConflict {
        job_id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("job {job_id} is on attempt {actual}, expected attempt {expected}")]
    AttemptConflict {
        job_id: JobId,
        expected: u32,
        actual: u32,
    },

    #[error("illegal transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("execution failed: {0}")]
    ExecutionFailed(#[from] ExecutionError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl SchedulerError {
    /// True for collisions with a concurrent runner, which the loop absorbs.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SchedulerError::StateConflict { .. } | SchedulerError::AttemptConflict { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
