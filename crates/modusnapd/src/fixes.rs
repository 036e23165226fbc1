//! Typed fix application
//!
//! Dispatches on a diagnostic issue id and applies the corresponding
//! idempotent repair, returning the step log and what was done about
//! restarting the engine. In-process manager reboot is preferred; a detached
//! start-script launch is the fallback when the engine is down.

use crate::compat_sets;
use crate::locator::BackendLocation;
use crate::server::AppState;
use crate::subprocess::{self, INSTALL_TIMEOUT, PROBE_TIMEOUT};
use chrono::Utc;
use modusnap_common::{ControlError, EnvStep, HardwareProfile, IssueId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartReport {
    pub attempted: bool,
    /// `manager_reboot`, `detached_start`, or `none`.
    pub method: String,
    pub ok: bool,
}

impl RestartReport {
    fn none() -> Self {
        Self {
            attempted: false,
            method: "none".to_string(),
            ok: false,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixOutcome {
    pub issue: IssueId,
    pub ok: bool,
    pub steps: Vec<EnvStep>,
    pub removed_packages: Vec<String>,
    pub restart: Option<RestartReport>,
    pub notes: Vec<String>,
}

/// Hardware-conditioned onnxruntime selection for the rembg repair.
pub fn rembg_install_args(profile: &HardwareProfile) -> Vec<&'static str> {
    if profile.has_nvidia && profile.os != "darwin" {
        vec!["-m", "pip", "install", "rembg==2.0.69", "onnxruntime-gpu"]
    } else {
        vec!["-m", "pip", "install", "rembg==2.0.69", "onnxruntime"]
    }
}

/// Apply the fix for one issue id.
pub async fn apply_fix(state: &Arc<AppState>, issue: IssueId) -> Result<FixOutcome, ControlError> {
    let location = state.locator.resolve()?;
    info!("applying fix for {}", issue.as_str());

    match issue {
        IssueId::SslCertIssue => fix_ssl_cert(state, &location).await,
        IssueId::PipCheckFailed
        | IssueId::PipLogIssue
        | IssueId::ManagerImportRuntimeFailed
        | IssueId::ManagerPkgMissing => fix_dependency_drift(state, &location, issue).await,
        IssueId::RembgOnnxMissing => fix_rembg(state, &location).await,
        IssueId::BackendDown => fix_backend_down(state, &location).await,
        IssueId::ManagerRoutesMissing | IssueId::VenvMissing => Err(ControlError::invalid_arg(
            format!("issue '{}' has no automated fix", issue.as_str()),
        )),
    }
}

async fn fix_ssl_cert(
    state: &Arc<AppState>,
    location: &BackendLocation,
) -> Result<FixOutcome, ControlError> {
    let _guard = state.venv_lock.lock().await;
    let mut steps = Vec::new();

    let install = subprocess::run_step(
        location,
        "python -m pip install --upgrade certifi",
        &["-m", "pip", "install", "--upgrade", "certifi"],
        INSTALL_TIMEOUT,
    )
    .await;
    let ok = install.ok;
    steps.push(install);

    let mut notes = Vec::new();
    let where_probe = subprocess::run_step(
        location,
        "python -c \"import certifi; print(certifi.where())\"",
        &["-c", "import certifi; print(certifi.where())"],
        PROBE_TIMEOUT,
    )
    .await;
    if where_probe.ok {
        notes.push(format!("certificate bundle: {}", where_probe.output.trim()));
    }
    steps.push(where_probe);

    let restart = restart_backend(state, location).await;
    Ok(FixOutcome {
        issue: IssueId::SslCertIssue,
        ok,
        steps,
        removed_packages: Vec::new(),
        restart: Some(restart),
        notes,
    })
}

/// Compat install + AutoHeal + Prune; restarts only when the engine was
/// already down.
async fn fix_dependency_drift(
    state: &Arc<AppState>,
    location: &BackendLocation,
    issue: IssueId,
) -> Result<FixOutcome, ControlError> {
    let engine_was_up = state.engine.is_reachable().await;

    let _guard = state.venv_lock.lock().await;
    let outcome = compat_sets::build(location, &[])
        .await
        .map_err(ControlError::from)?;

    let mut notes = Vec::new();
    if outcome.auto_healed {
        notes.push(format!(
            "autoheal ran; {} conflicting package(s) removed",
            outcome.removed_packages.len()
        ));
    }

    let restart = if engine_was_up {
        None
    } else {
        Some(restart_backend(state, location).await)
    };

    Ok(FixOutcome {
        issue,
        ok: outcome.set.pip_healthy,
        steps: outcome.steps,
        removed_packages: outcome.removed_packages,
        restart,
        notes,
    })
}

async fn fix_rembg(
    state: &Arc<AppState>,
    location: &BackendLocation,
) -> Result<FixOutcome, ControlError> {
    let _guard = state.venv_lock.lock().await;
    let profile = location.hardware_profile();
    let args = rembg_install_args(&profile);
    let mut steps = Vec::new();

    let display = format!("python {}", args.join(" "));
    let install = subprocess::run_step(location, &display, &args, INSTALL_TIMEOUT).await;
    steps.push(install);

    let verify = subprocess::run_step(
        location,
        "python -c \"import rembg, onnxruntime\"",
        &["-c", "import rembg, onnxruntime"],
        PROBE_TIMEOUT,
    )
    .await;
    let verified = verify.ok;
    steps.push(verify);

    let restart = if verified {
        Some(restart_backend(state, location).await)
    } else {
        Some(RestartReport::none())
    };

    Ok(FixOutcome {
        issue: IssueId::RembgOnnxMissing,
        ok: verified,
        steps,
        removed_packages: Vec::new(),
        restart,
        notes: Vec::new(),
    })
}

async fn fix_backend_down(
    state: &Arc<AppState>,
    location: &BackendLocation,
) -> Result<FixOutcome, ControlError> {
    if state.engine.is_reachable().await {
        return Ok(FixOutcome {
            issue: IssueId::BackendDown,
            ok: true,
            steps: Vec::new(),
            removed_packages: Vec::new(),
            restart: Some(RestartReport::none()),
            notes: vec!["engine is already up".to_string()],
        });
    }

    let restart = detached_start(location);
    Ok(FixOutcome {
        issue: IssueId::BackendDown,
        ok: restart.ok,
        steps: Vec::new(),
        removed_packages: Vec::new(),
        restart: Some(restart),
        notes: Vec::new(),
    })
}

/// Manager reboot first; detached start when the engine is down or the
/// reboot call fails.
pub async fn restart_backend(state: &Arc<AppState>, location: &BackendLocation) -> RestartReport {
    if state.engine.is_reachable().await {
        match state.engine.reboot().await {
            Ok(_) => {
                log_restart(location, "manager_reboot");
                return RestartReport {
                    attempted: true,
                    method: "manager_reboot".to_string(),
                    ok: true,
                };
            }
            Err(err) => warn!("manager reboot failed, falling back: {err}"),
        }
    }
    detached_start(location)
}

fn detached_start(location: &BackendLocation) -> RestartReport {
    let ok = match subprocess::spawn_detached_start(location) {
        Ok(()) => true,
        Err(err) => {
            warn!("detached start failed: {err:#}");
            false
        }
    };
    log_restart(location, "detached_start");
    RestartReport {
        attempted: true,
        method: "detached_start".to_string(),
        ok,
    }
}

fn log_restart(location: &BackendLocation, method: &str) {
    let line = format!("{} restart requested via {method}\n", Utc::now().to_rfc3339());
    if let Some(parent) = location.restart_log.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(err) = append_line(&location.restart_log, &line) {
        warn!("failed to append restart log: {err}");
    }
}

fn append_line(path: &std::path::Path, line: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())
}
