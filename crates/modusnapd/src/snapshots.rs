//! Freeze snapshots of the virtualenv
//!
//! A freeze snapshot is the `pip freeze` output written to
//! `modusnap_manager_env/snapshots/<tag>.txt`. Restoring one is just
//! re-installing from the file, which the transaction engine drives.

use crate::locator::BackendLocation;
use crate::subprocess::{self, PROBE_TIMEOUT};
use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct SnapshotService {
    dir: PathBuf,
}

impl SnapshotService {
    pub fn for_backend(location: &BackendLocation) -> Self {
        Self {
            dir: location.snapshots_dir(),
        }
    }

    pub fn snapshot_path(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("{tag}.txt"))
    }

    /// Capture `pip freeze` into `<tag>.txt`. Returns `None` when the freeze
    /// fails; callers proceed without a snapshot in that case.
    pub async fn freeze(&self, location: &BackendLocation, tag: &str) -> Option<PathBuf> {
        let record =
            subprocess::run_python(location, &["-m", "pip", "freeze"], PROBE_TIMEOUT).await;
        if !record.ok {
            warn!("pip freeze failed for snapshot '{tag}': {}", record.output);
            return None;
        }
        match self.write_snapshot(tag, &record.output) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!("failed to persist snapshot '{tag}': {err:#}");
                None
            }
        }
    }

    fn write_snapshot(&self, tag: &str, contents: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.snapshot_path(tag);
        let tmp = path.with_extension("txt.tmp");
        std::fs::write(&tmp, contents)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(path)
    }

    /// Package pins recorded in a snapshot file, unordered.
    pub fn read_pins(path: &PathBuf) -> Result<Vec<String>> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read snapshot {}", path.display()))?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_backend(freeze_output: &str) -> (tempfile::TempDir, BackendLocation) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        std::fs::write(dir.join("main.py"), "").unwrap();
        std::fs::write(dir.join("requirements.txt"), "").unwrap();
        let bin = dir.join("venv").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let python = bin.join("python");
        std::fs::write(&python, format!("#!/bin/sh\nprintf '{freeze_output}'\n")).unwrap();
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();
        let location = crate::locator::BackendLocator::new(Some(dir.display().to_string()))
            .resolve()
            .unwrap();
        (tmp, location)
    }

    #[tokio::test]
    async fn freeze_writes_tagged_file() {
        let (_tmp, location) = fake_backend("torch==2.4.0\\npillow==10.0.0\\n");
        let service = SnapshotService::for_backend(&location);
        let path = service.freeze(&location, "tx1-before").await.unwrap();
        assert!(path.ends_with("tx1-before.txt"));

        let pins = SnapshotService::read_pins(&path).unwrap();
        assert_eq!(pins, vec!["torch==2.4.0", "pillow==10.0.0"]);
    }

    #[tokio::test]
    async fn freeze_without_venv_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("main.py"), "").unwrap();
        std::fs::write(tmp.path().join("requirements.txt"), "").unwrap();
        let location = crate::locator::BackendLocator::new(Some(tmp.path().display().to_string()))
            .resolve()
            .unwrap();
        let service = SnapshotService::for_backend(&location);
        assert!(service.freeze(&location, "tx1-before").await.is_none());
    }
}
