//! Atomic on-disk persistence of scheduler state as a single JSON document.
//!
//! Writes go to `jobs.json.tmp` followed by a rename over `jobs.json`, so a
//! crash mid-write never leaves a half-written file behind for the next
//! startup to trip over.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::job::JobSnapshot;

const STATE_FILE_NAME: &str = "jobs.json";
const TMP_FILE_NAME: &str = "jobs.json.tmp";

/// Failure writing the state file. Load failures are never surfaced this way;
/// they are logged and treated as empty state instead (see [`Persistence::load`]).
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to create data dir: {0}")]
    CreateDir(#[source] std::io::Error),

    #[error("failed to write state file: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to rename state file into place: {0}")]
    Rename(#[source] std::io::Error),

    #[error("failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// The full durable state of the scheduler: the id counter and every job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub next_id: u64,
    pub jobs: Vec<JobSnapshot>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self { next_id: 1, jobs: Vec::new() }
    }
}

/// Reads and writes [`PersistedState`] under a configured data directory.
///
/// A `None` data directory makes every operation a no-op, which keeps the
/// Scheduler's call sites free of `if let Some(..)` branching and is useful
/// for tests that don't care about durability.
pub struct Persistence {
    data_dir: Option<PathBuf>,
}

impl Persistence {
    #[must_use]
    pub fn new(data_dir: Option<PathBuf>) -> Self {
        Self { data_dir }
    }

    fn state_path(dir: &Path) -> PathBuf {
        dir.join(STATE_FILE_NAME)
    }

    fn tmp_path(dir: &Path) -> PathBuf {
        dir.join(TMP_FILE_NAME)
    }

    /// Writes `state` to the state file via a write-then-rename.
    pub async fn save(&self, state: &PersistedState) -> Result<(), PersistenceError> {
        let Some(dir) = self.data_dir.as_ref() else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(PersistenceError::CreateDir)?;
        let body = serde_json::to_vec_pretty(state).map_err(PersistenceError::Serialize)?;
        let tmp_path = Self::tmp_path(dir);
        tokio::fs::write(&tmp_path, body)
            .await
            .map_err(PersistenceError::Write)?;
        tokio::fs::rename(&tmp_path, Self::state_path(dir))
            .await
            .map_err(PersistenceError::Rename)?;
        Ok(())
    }

    /// Loads the state file, falling back to an empty default on any error.
    ///
    /// A missing or corrupt state file is not a startup failure: the spec
    /// treats a never-persisted process and a process recovering from a
    /// truncated write identically, logging a warning in the latter case.
    pub async fn load(&self) -> PersistedState {
        let Some(dir) = self.data_dir.as_ref() else {
            return PersistedState::default();
        };
        let path = Self::state_path(dir);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<PersistedState>(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "state file is corrupt, starting empty");
                    PersistedState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PersistedState::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read state file, starting empty");
                PersistedState::default()
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::job::JobStatus;

    fn sample_state() -> PersistedState {
        PersistedState {
            next_id: 3,
            jobs: vec![JobSnapshot {
                id: "1".to_string(),
                url: "https://example.com/a".to_string(),
                status: JobStatus::Queued,
                created_at: 1000,
                done_at: None,
                error: String::new(),
                progress: 0.0,
                retry_count: 0,
                max_retries: 3,
                output: vec![],
            }],
        }
    }

    #[tokio::test]
    async fn test_save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(Some(dir.path().to_path_buf()));
        let state = sample_state();
        persistence.save(&state).await.unwrap();

        let loaded = persistence.load().await;
        assert_eq!(loaded.next_id, 3);
        assert_eq!(loaded.jobs.len(), 1);
        assert_eq!(loaded.jobs[0].id, "1");
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(Some(dir.path().to_path_buf()));
        let loaded = persistence.load().await;
        assert_eq!(loaded.next_id, 1);
        assert!(loaded.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_load_corrupt_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join(STATE_FILE_NAME), b"not json")
            .await
            .unwrap();
        let persistence = Persistence::new(Some(dir.path().to_path_buf()));
        let loaded = persistence.load().await;
        assert_eq!(loaded.next_id, 1);
        assert!(loaded.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_no_data_dir_is_a_no_op() {
        let persistence = Persistence::new(None);
        persistence.save(&sample_state()).await.unwrap();
        let loaded = persistence.load().await;
        assert_eq!(loaded.next_id, 1);
    }

    #[tokio::test]
    async fn test_save_does_not_leave_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(Some(dir.path().to_path_buf()));
        persistence.save(&sample_state()).await.unwrap();
        assert!(!dir.path().join(TMP_FILE_NAME).exists());
        assert!(dir.path().join(STATE_FILE_NAME).exists());
    }
}
