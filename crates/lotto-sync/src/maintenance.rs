use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::warn;

/// Global switch an operator flips to suspend ingestion without touching the scheduler.
#[async_trait]
pub trait MaintenanceGate: Send + Sync {
    /// `Some(reason)` when runs should be skipped.
    async fn paused(&self) -> Option<String>;
}

/// Paused while the file exists; its first line, if any, is the reason.
/// A path that exists but cannot be read still pauses.
#[derive(Debug, Clone)]
pub struct PauseFile {
    path: PathBuf,
}

impl PauseFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl MaintenanceGate for PauseFile {
    async fn paused(&self) -> Option<String> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "pause file unreadable; treating as paused");
                return Some(format!("pause file {} present but unreadable: {err}", self.path.display()));
            }
        };
        let text = String::from_utf8_lossy(&bytes);
        let reason = text.lines().next().map(str::trim).unwrap_or_default();
        Some(if reason.is_empty() {
            format!("pause file {} present", self.path.display())
        } else {
            reason.to_string()
        })
    }
}

/// Never paused.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOpen;

#[async_trait]
impl MaintenanceGate for AlwaysOpen {
    async fn paused(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn pause_file_controls_the_gate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("PAUSED");
        let gate = PauseFile::new(&path);
        assert_eq!(gate.paused().await, None);

        std::fs::write(&path, "source migration in progress\n").unwrap();
        assert_eq!(
            gate.paused().await.as_deref(),
            Some("source migration in progress")
        );

        std::fs::write(&path, "").unwrap();
        assert!(gate.paused().await.unwrap().contains("PAUSED"));
    }

    #[tokio::test]
    async fn undecodable_pause_file_still_pauses() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("PAUSED");
        std::fs::write(&path, [0xff, 0xfe, b'\n']).unwrap();
        assert!(PauseFile::new(&path).paused().await.is_some());
    }

    #[tokio::test]
    async fn directory_at_pause_path_pauses() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("PAUSED");
        std::fs::create_dir(&path).unwrap();
        let reason = PauseFile::new(&path).paused().await.unwrap();
        assert!(reason.contains("unreadable"));
    }
}
