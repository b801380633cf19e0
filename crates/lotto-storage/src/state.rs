//! Durable anomaly counter persisted as a small JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyState {
    pub consecutive_no_new_draws: u32,
    /// Set once an alert went out for the current streak; cleared on reset.
    #[serde(default)]
    pub alert_sent: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {path:?} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing state file {path:?} timed out")]
    Timeout { path: PathBuf },
}

impl StateError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnomalyStateFile {
    path: PathBuf,
    write_timeout: Duration,
}

impl AnomalyStateFile {
    pub fn new(path: impl Into<PathBuf>, write_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            write_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted state; a missing file is a fresh counter.
    pub async fn load(&self) -> Result<AnomalyState, StateError> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StateError::Parse {
                path: self.path.clone(),
                source,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(AnomalyState::default()),
            Err(err) => Err(StateError::io(&self.path, err)),
        }
    }

    /// Replace the persisted state atomically (temp file + rename).
    pub async fn save(&self, state: &AnomalyState) -> Result<(), StateError> {
        tokio::time::timeout(self.write_timeout, self.save_inner(state))
            .await
            .map_err(|_| StateError::Timeout {
                path: self.path.clone(),
            })?
    }

    async fn save_inner(&self, state: &AnomalyState) -> Result<(), StateError> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| StateError::io(&parent, e))?;

        let bytes = serde_json::to_vec_pretty(state).map_err(|source| StateError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let temp_path = parent.join(format!(".anomaly-{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::io(&temp_path, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| StateError::io(&temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::io(&temp_path, e))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StateError::io(&self.path, err));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_file_is_fresh_state() {
        let dir = tempdir().unwrap();
        let file = AnomalyStateFile::new(dir.path().join("anomaly_state.json"), Duration::from_secs(1));
        assert_eq!(file.load().await.unwrap(), AnomalyState::default());
    }

    #[tokio::test]
    async fn saved_state_survives_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/anomaly_state.json");
        let file = AnomalyStateFile::new(&path, Duration::from_secs(1));
        let state = AnomalyState {
            consecutive_no_new_draws: 3,
            alert_sent: false,
            updated_at: Some(Utc::now()),
        };
        file.save(&state).await.unwrap();

        let reopened = AnomalyStateFile::new(&path, Duration::from_secs(1));
        assert_eq!(reopened.load().await.unwrap(), state);
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error_not_a_reset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("anomaly_state.json");
        std::fs::write(&path, b"{not json").unwrap();
        let file = AnomalyStateFile::new(&path, Duration::from_secs(1));
        assert!(matches!(file.load().await, Err(StateError::Parse { .. })));
    }

    #[tokio::test]
    async fn older_files_without_alert_flag_still_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("anomaly_state.json");
        std::fs::write(&path, br#"{"consecutive_no_new_draws": 2}"#).unwrap();
        let file = AnomalyStateFile::new(&path, Duration::from_secs(1));
        let state = file.load().await.unwrap();
        assert_eq!(state.consecutive_no_new_draws, 2);
        assert!(!state.alert_sent);
    }
}
