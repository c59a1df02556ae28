//! Errors produced by a single downloader attempt.

use thiserror::Error;

/// Failure of one [`super::Runner::execute_attempt`] call.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// `downloadDir` could not be created.
    #[error("failed to create download dir: {0}")]
    CreateDownloadDir(#[source] std::io::Error),

    /// The subprocess could not be spawned or its pipes could not be set up.
    #[error("failed to spawn downloader: {0}")]
    Spawn(#[source] std::io::Error),

    /// The subprocess exited with a non-zero status.
    #[error("downloader exited with {0}")]
    NonZeroExit(String),

    /// The attempt was cancelled (job deleted or process shutting down).
    #[error("attempt cancelled")]
    Cancelled,
}
