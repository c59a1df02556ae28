//! Errors surfaced by Scheduler operations to their callers.

use thiserror::Error;

/// Failure of a Scheduler-level operation (submit, retry, delete).
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The submitted URL is empty after trimming.
    #[error("url must not be empty")]
    EmptyUrl,

    /// A non-terminal job already exists for this URL.
    #[error("duplicate url: {0}")]
    Duplicate(String),

    /// The process is shutting down; no new submissions are accepted.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// No job exists with the given id.
    #[error("job not found: {0}")]
    NotFound(String),

    /// `retry` was called on a job that is not in `failed` status.
    #[error("job {0} is not in failed status")]
    NotFailed(String),
}
