use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::warn;

/// Exclusive marker for one running sync, removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(path).unwrap_or_default();
                anyhow::bail!(
                    "another sync is running (lock {} held by {}); remove the file if that process is gone",
                    path.display(),
                    holder.trim()
                );
            }
            Err(err) => {
                return Err(err).with_context(|| format!("creating lock {}", path.display()));
            }
        };
        writeln!(file, "pid={} since={}", std::process::id(), Utc::now().to_rfc3339())
            .with_context(|| format!("writing lock {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release run lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/sync.lock");

        let first = RunLock::acquire(&path).unwrap();
        let err = RunLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("another sync is running"));

        drop(first);
        assert!(!path.exists());
        RunLock::acquire(&path).unwrap();
    }
}
