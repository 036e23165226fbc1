//! Compatibility set maintenance
//!
//! Builds and persists the `(hardware profile, verified dependency state,
//! normalized constraints, catalog audit)` capture that guards installs.
//! One `current` file per backend plus a capped history directory.

use crate::auditor;
use crate::autoheal;
use crate::locator::BackendLocation;
use crate::reconciler;
use crate::subprocess::{self, INSTALL_TIMEOUT, PROBE_TIMEOUT};
use anyhow::{Context, Result};
use chrono::Utc;
use modusnap_common::{
    CatalogItem, CompatibilitySet, DependencyLock, EnvStep, PinnedPackage,
};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Rebuild when the current set is older than this.
pub const MAX_SET_AGE_MINUTES: i64 = 15;
/// History files kept under `compatibility_sets/`.
const MAX_HISTORY: usize = 50;

#[derive(Debug)]
pub struct CompatOutcome {
    pub set: CompatibilitySet,
    pub steps: Vec<EnvStep>,
    pub auto_healed: bool,
    pub removed_packages: Vec<String>,
}

pub fn load_current(location: &BackendLocation) -> Option<CompatibilitySet> {
    let raw = std::fs::read_to_string(location.compat_current_path()).ok()?;
    serde_json::from_str(&raw).ok()
}

/// A cached set is reusable only when fresh, verified, and captured on the
/// same hardware.
pub fn is_reusable(set: &CompatibilitySet, location: &BackendLocation) -> bool {
    set.pip_healthy
        && !set.is_stale(chrono::Duration::minutes(MAX_SET_AGE_MINUTES))
        && set.hardware_profile.token == location.hardware_profile().token
}

/// Rebuild the compatibility set: baseline installs, reconciliation, the
/// normalized-constraint install, verification with AutoHeal on failure, and
/// dependency-lock collection. The caller owns the backend write lock.
pub async fn build(
    location: &BackendLocation,
    selected_items: &[CatalogItem],
) -> Result<CompatOutcome> {
    let mut steps = Vec::new();
    let mut auto_healed = false;
    let mut removed_packages = Vec::new();

    steps.push(
        subprocess::run_step(
            location,
            "python -m pip install -r requirements.txt",
            &["-m", "pip", "install", "-r", "requirements.txt"],
            INSTALL_TIMEOUT,
        )
        .await,
    );
    steps.push(
        subprocess::run_step(
            location,
            "python -m pip install -r manager_requirements.txt",
            &["-m", "pip", "install", "-r", "manager_requirements.txt"],
            INSTALL_TIMEOUT,
        )
        .await,
    );

    let audit = reconciler::run(location)?;
    if audit.compatible_requirement_count > 0 {
        let compatible = location.compatible_requirements_path().display().to_string();
        steps.push(
            subprocess::run_step(
                location,
                &format!("python -m pip install -r {compatible}"),
                &["-m", "pip", "install", "-r", &compatible],
                INSTALL_TIMEOUT,
            )
            .await,
        );
    }

    let check = subprocess::run_step(
        location,
        "python -m pip check",
        &["-m", "pip", "check"],
        PROBE_TIMEOUT,
    )
    .await;
    let mut pip_healthy = check.ok;
    let mut pip_check_output = check.output.clone();
    steps.push(check);

    if !pip_healthy {
        info!("compatibility set: pip check failed, entering autoheal");
        auto_healed = true;
        let heal = autoheal::run_autoheal(location).await;
        pip_healthy = heal.healthy;
        pip_check_output = heal.pip_check_output.clone();
        removed_packages = heal.removed_packages.clone();
        steps.extend(heal.steps);
    }

    let profile = location.hardware_profile();
    let catalog_audit = if selected_items.is_empty() {
        None
    } else {
        Some(auditor::audit_catalog(location, selected_items, &profile)?)
    };

    let set = CompatibilitySet {
        lock_id: uuid::Uuid::new_v4().to_string(),
        created_at: Utc::now(),
        hardware_profile: profile,
        pip_healthy,
        pip_check_output,
        selected_pack_keys: selected_items.iter().map(CatalogItem::key).collect(),
        selected_pack_ids: selected_items
            .iter()
            .filter_map(|item| item.id.clone())
            .collect(),
        dependency_lock: collect_dependency_lock(location).await,
        dependency_audit: Some(audit),
        catalog_audit,
    };

    persist(location, &set)?;
    write_sync_marker(location);

    Ok(CompatOutcome {
        set,
        steps,
        auto_healed,
        removed_packages,
    })
}

async fn collect_dependency_lock(location: &BackendLocation) -> DependencyLock {
    let python = {
        let record = subprocess::run_python(
            location,
            &["-c", "import sys; print(sys.version.split()[0])"],
            PROBE_TIMEOUT,
        )
        .await;
        record.ok.then(|| record.output.trim().to_string())
    };

    let pkgs = {
        let record = subprocess::run_python(
            location,
            &["-m", "pip", "list", "--format=json"],
            PROBE_TIMEOUT,
        )
        .await;
        if record.ok {
            serde_json::from_str::<Vec<PinnedPackage>>(record.output.trim()).unwrap_or_default()
        } else {
            Vec::new()
        }
    };

    let manager_version = {
        let record = subprocess::run_python(
            location,
            &[
                "-c",
                "import importlib.metadata as m; print(m.version('comfyui-manager'))",
            ],
            PROBE_TIMEOUT,
        )
        .await;
        record.ok.then(|| record.output.trim().to_string())
    };

    DependencyLock {
        python,
        pkgs,
        manager_version,
        git_commit: git_head(&location.backend_dir).await,
    }
}

async fn git_head(backend_dir: &Path) -> Option<String> {
    let output = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::process::Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(backend_dir)
            .output(),
    )
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        return None;
    }
    let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!commit.is_empty()).then_some(commit)
}

fn persist(location: &BackendLocation, set: &CompatibilitySet) -> Result<()> {
    let json = serde_json::to_string_pretty(set).context("failed to serialize compat set")?;

    let current = location.compat_current_path();
    std::fs::create_dir_all(&location.user_dir)
        .with_context(|| format!("failed to create {}", location.user_dir.display()))?;
    let tmp = current.with_extension("json.tmp");
    std::fs::write(&tmp, &json).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, &current)
        .with_context(|| format!("failed to replace {}", current.display()))?;

    let history_dir = location.compat_history_dir();
    std::fs::create_dir_all(&history_dir)
        .with_context(|| format!("failed to create {}", history_dir.display()))?;
    let history_path = history_dir.join(format!("compat_set_{}.json", set.lock_id));
    std::fs::write(&history_path, &json)
        .with_context(|| format!("failed to write {}", history_path.display()))?;

    trim_history(&history_dir);
    Ok(())
}

fn trim_history(history_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(history_dir) else {
        return;
    };
    let mut files: Vec<(std::time::SystemTime, std::path::PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if !path.is_file() {
                return None;
            }
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, path))
        })
        .collect();
    if files.len() <= MAX_HISTORY {
        return;
    }
    files.sort_by_key(|(modified, _)| *modified);
    let excess = files.len() - MAX_HISTORY;
    for (_, path) in files.into_iter().take(excess) {
        if let Err(err) = std::fs::remove_file(&path) {
            warn!("failed to trim history file {}: {err}", path.display());
        }
    }
}

fn write_sync_marker(location: &BackendLocation) {
    let marker = location.dependency_sync_marker_path();
    if let Err(err) = std::fs::write(&marker, format!("{}\n", Utc::now().to_rfc3339())) {
        warn!("failed to write dependency sync marker: {err}");
    }
}

/// Load the history directory, newest first.
pub fn load_history(location: &BackendLocation) -> Vec<CompatibilitySet> {
    let Ok(entries) = std::fs::read_dir(location.compat_history_dir()) else {
        return Vec::new();
    };
    let mut sets: Vec<CompatibilitySet> = entries
        .flatten()
        .filter_map(|entry| {
            let raw = std::fs::read_to_string(entry.path()).ok()?;
            serde_json::from_str(&raw).ok()
        })
        .collect();
    sets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    sets
}
