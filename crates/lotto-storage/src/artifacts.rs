//! Raw provider responses kept on disk for replaying extraction failures.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

/// Metadata describing where a captured body came from.
#[derive(Debug, Clone)]
pub struct CaptureLabel {
    pub provider: String,
    pub profile_version: String,
    pub target: String,
    pub attempt: usize,
}

/// Result of one capture. `fresh` is false when the same body was already on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    pub digest: String,
    pub relative_path: PathBuf,
    pub fresh: bool,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn digest(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `{yyyymmdd}/{provider}/{target}_{profile}_a{attempt}_{digest16}.{ext}`
    pub fn capture_path(
        captured_at: DateTime<Utc>,
        label: &CaptureLabel,
        digest: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        let short = &digest[..digest.len().min(16)];
        PathBuf::from(captured_at.format("%Y%m%d").to_string())
            .join(path_segment(&label.provider))
            .join(format!(
                "{}_{}_a{}_{short}.{ext}",
                path_segment(&label.target),
                path_segment(&label.profile_version),
                label.attempt,
            ))
    }

    /// Write the body once; an existing file with the same path is left untouched.
    pub async fn capture(
        &self,
        captured_at: DateTime<Utc>,
        label: &CaptureLabel,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<Captured> {
        let digest = Self::digest(bytes);
        let relative_path = Self::capture_path(captured_at, label, &digest, extension);
        let target = self.root.join(&relative_path);
        let dir = target.parent().unwrap_or(self.root.as_path()).to_path_buf();

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating capture directory {}", dir.display()))?;

        if fs::try_exists(&target).await.unwrap_or(false) {
            return Ok(Captured {
                digest,
                relative_path,
                fresh: false,
            });
        }

        let staging = dir.join(format!(".capture-{}.tmp", Uuid::new_v4()));
        fs::write(&staging, bytes)
            .await
            .with_context(|| format!("writing {}", staging.display()))?;
        if let Err(err) = fs::rename(&staging, &target).await {
            let _ = fs::remove_file(&staging).await;
            return Err(err).with_context(|| format!("publishing capture {}", target.display()));
        }

        Ok(Captured {
            digest,
            relative_path,
            fresh: true,
        })
    }
}

fn path_segment(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '.' => c,
            _ => '_',
        })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn label(attempt: usize) -> CaptureLabel {
        CaptureLabel {
            provider: "caixa-api".into(),
            profile_version: "v2".into(),
            target: "latest".into(),
            attempt,
        }
    }

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-15T21:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn digest_is_sha256_hex() {
        assert_eq!(
            ArtifactStore::digest(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn same_body_is_captured_once() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let body = br#"{"numero":276}"#;

        let first = store.capture(at(), &label(0), "json", body).await.unwrap();
        let second = store.capture(at(), &label(0), "json", body).await.unwrap();

        assert!(first.fresh);
        assert!(!second.fresh);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(dir.path().join(&first.relative_path).is_file());
        assert!(first
            .relative_path
            .starts_with(PathBuf::from("20250115").join("caixa-api")));
    }

    #[tokio::test]
    async fn retries_land_in_separate_files() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let first = store.capture(at(), &label(1), "html", b"<html/>").await.unwrap();
        let second = store.capture(at(), &label(2), "html", b"<html/>").await.unwrap();
        assert_ne!(first.relative_path, second.relative_path);
        assert!(second.relative_path.to_string_lossy().contains("latest_v2_a2_"));
    }

    #[test]
    fn unsafe_characters_are_replaced() {
        assert_eq!(path_segment("draw/277?x"), "draw_277_x");
        assert_eq!(path_segment(""), "unnamed");
    }
}
