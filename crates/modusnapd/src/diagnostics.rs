//! Root-cause diagnostics
//!
//! Probes the engine, its manager routes, the virtualenv and the engine log,
//! and turns the findings into typed issues with machine-applicable fixes.
//! Sub-results are cached per slot with a TTL so fast-mode calls stay cheap;
//! deep mode runs the subprocess checks with a shorter TTL.

use crate::engine_client::EngineClient;
use crate::locator::BackendLocation;
use crate::subprocess::{self, PROBE_TIMEOUT, TORCH_PROBE_TIMEOUT};
use chrono::Utc;
use modusnap_common::{DiagnosticIssue, HardwareProfile, IssueId, Severity};
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// TTL for sub-results reused by fast mode.
const FAST_TTL: Duration = Duration::from_secs(25);
/// TTL for deep-mode subprocess results.
const DEEP_TTL: Duration = Duration::from_secs(6);
/// How much of the engine log tail is scanned.
const LOG_TAIL_LIMIT: u64 = 256 * 1024;
/// Marker that starts the most recent engine run in the log.
const LOG_START_MARKER: &str = "Starting server";

/// Canonical nodes whose presence indicates a sane node catalog.
const CANONICAL_NODES: &[&str] = &["KSampler", "CheckpointLoaderSimple"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TorchProbe {
    pub cuda: bool,
    pub mps: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LogFindings {
    pub ssl_cert_error: bool,
    pub pip_errors: bool,
    pub rembg_onnx_missing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct ObjectInfoProbe {
    node_count: usize,
    canonical_nodes_ok: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct DeepProbes {
    manager_package_present: bool,
    manager_import_ok: bool,
    pip_healthy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
    pub generated_at: chrono::DateTime<Utc>,
    pub deep: bool,
    pub backend_up: bool,
    pub manager_endpoint: Option<String>,
    pub node_count: usize,
    pub canonical_nodes_ok: bool,
    pub venv_exists: bool,
    pub manager_package_present: Option<bool>,
    pub manager_import_ok: Option<bool>,
    pub pip_healthy: Option<bool>,
    pub pip_check_output: Option<String>,
    pub hardware_profile: HardwareProfile,
    pub dependency_sync_at: Option<String>,
    pub torch: Option<TorchProbe>,
    pub log_findings: LogFindings,
    pub issues: Vec<DiagnosticIssue>,
}

struct Slot<T> {
    value: T,
    at: Instant,
}

impl<T: Clone> Slot<T> {
    fn fresh(&self, ttl: Duration) -> Option<T> {
        (self.at.elapsed() < ttl).then(|| self.value.clone())
    }
}

#[derive(Default)]
struct DiagCache {
    backend_up: Option<Slot<bool>>,
    manager_endpoint: Option<Slot<Option<String>>>,
    object_info: Option<Slot<ObjectInfoProbe>>,
    log_findings: Option<Slot<LogFindings>>,
    deep_probes: Option<Slot<(DeepProbes, String)>>,
    torch: Option<Slot<Option<TorchProbe>>>,
}

#[derive(Default)]
pub struct DiagnosticsEngine {
    cache: Mutex<DiagCache>,
}

impl DiagnosticsEngine {
    pub async fn run(
        &self,
        engine: &EngineClient,
        location: &BackendLocation,
        deep: bool,
    ) -> DiagnosticsReport {
        let mut cache = self.cache.lock().await;

        let backend_up = match cache.backend_up.as_ref().and_then(|s| s.fresh(FAST_TTL)) {
            Some(value) => value,
            None => {
                let value = engine.is_reachable().await;
                cache.backend_up = Some(Slot { value, at: Instant::now() });
                value
            }
        };

        let manager_endpoint = match cache
            .manager_endpoint
            .as_ref()
            .and_then(|s| s.fresh(FAST_TTL))
        {
            Some(value) => value,
            None => {
                let value = if backend_up {
                    engine.probe_manager_endpoint().await.map(|(path, _)| path)
                } else {
                    None
                };
                cache.manager_endpoint = Some(Slot { value: value.clone(), at: Instant::now() });
                value
            }
        };

        let object_info = match cache.object_info.as_ref().and_then(|s| s.fresh(FAST_TTL)) {
            Some(value) => value,
            None => {
                let value = if backend_up {
                    probe_object_info(engine, deep).await
                } else {
                    ObjectInfoProbe::default()
                };
                cache.object_info = Some(Slot { value, at: Instant::now() });
                value
            }
        };

        let log_findings = match cache.log_findings.as_ref().and_then(|s| s.fresh(FAST_TTL)) {
            Some(value) => value,
            None => {
                let value = scan_log_tail(location);
                cache.log_findings = Some(Slot { value, at: Instant::now() });
                value
            }
        };

        let venv_exists = location.venv_exists();

        let (deep_probes, pip_check_output) = if deep && venv_exists {
            match cache.deep_probes.as_ref().and_then(|s| s.fresh(DEEP_TTL)) {
                Some(value) => (Some(value.0), Some(value.1)),
                None => {
                    let value = run_deep_probes(location).await;
                    cache.deep_probes = Some(Slot { value: value.clone(), at: Instant::now() });
                    (Some(value.0), Some(value.1))
                }
            }
        } else {
            (None, None)
        };

        let torch = if deep && venv_exists {
            match cache.torch.as_ref().and_then(|s| s.fresh(DEEP_TTL)) {
                Some(value) => value,
                None => {
                    let value = probe_torch(location).await;
                    cache.torch = Some(Slot { value, at: Instant::now() });
                    value
                }
            }
        } else {
            None
        };
        drop(cache);

        let pip_healthy = deep_probes.map(|p| p.pip_healthy);
        let manager_package_present = deep_probes.map(|p| p.manager_package_present);
        let manager_import_ok = deep_probes.map(|p| p.manager_import_ok);

        let hardware_profile = location.hardware_profile();
        let dependency_sync_at = std::fs::read_to_string(location.dependency_sync_marker_path())
            .ok()
            .map(|raw| raw.trim().to_string());

        let issues = derive_issues(
            backend_up,
            &manager_endpoint,
            venv_exists,
            manager_package_present,
            manager_import_ok,
            pip_healthy,
            &log_findings,
        );

        DiagnosticsReport {
            generated_at: Utc::now(),
            deep,
            backend_up,
            manager_endpoint,
            node_count: object_info.node_count,
            canonical_nodes_ok: object_info.canonical_nodes_ok,
            venv_exists,
            manager_package_present,
            manager_import_ok,
            pip_healthy,
            pip_check_output,
            hardware_profile,
            dependency_sync_at,
            torch,
            log_findings,
            issues,
        }
    }
}

async fn probe_object_info(engine: &EngineClient, deep: bool) -> ObjectInfoProbe {
    match engine.object_info(deep).await {
        Ok(serde_json::Value::Object(map)) => {
            let canonical_nodes_ok = CANONICAL_NODES.iter().all(|node| {
                map.get(*node)
                    .map(|def| def.get("input").is_some())
                    .unwrap_or(false)
            });
            ObjectInfoProbe {
                node_count: map.len(),
                canonical_nodes_ok,
            }
        }
        Ok(_) | Err(_) => ObjectInfoProbe::default(),
    }
}

async fn run_deep_probes(location: &BackendLocation) -> (DeepProbes, String) {
    let find_spec = subprocess::run_python(
        location,
        &[
            "-c",
            "import importlib.util, json; \
             print(json.dumps(importlib.util.find_spec('comfyui_manager') is not None))",
        ],
        PROBE_TIMEOUT,
    )
    .await;
    let manager_package_present =
        find_spec.ok && find_spec.output.trim().ends_with("true");

    let import_probe = subprocess::run_python(
        location,
        &["-c", "import comfyui_manager"],
        PROBE_TIMEOUT,
    )
    .await;

    let pip_check =
        subprocess::run_python(location, &["-m", "pip", "check"], PROBE_TIMEOUT).await;

    (
        DeepProbes {
            manager_package_present,
            manager_import_ok: import_probe.ok,
            pip_healthy: pip_check.ok,
        },
        pip_check.output,
    )
}

async fn probe_torch(location: &BackendLocation) -> Option<TorchProbe> {
    let record = subprocess::run_python(
        location,
        &[
            "-c",
            "import json, torch; \
             mps = getattr(torch.backends, 'mps', None); \
             print(json.dumps({'cuda': torch.cuda.is_available(), \
             'mps': bool(mps and mps.is_available())}))",
        ],
        TORCH_PROBE_TIMEOUT,
    )
    .await;
    if !record.ok {
        debug!("torch probe failed: {}", record.output);
        return None;
    }
    let line = record.output.lines().rev().find(|l| !l.trim().is_empty())?;
    serde_json::from_str(line.trim()).ok()
}

/// Scan the log tail from the most recent server start for known failure
/// markers.
fn scan_log_tail(location: &BackendLocation) -> LogFindings {
    let tail = match read_log_tail(location) {
        Some(tail) => tail,
        None => return LogFindings::default(),
    };
    let run = match tail.rfind(LOG_START_MARKER) {
        Some(idx) => &tail[idx..],
        None => tail.as_str(),
    };
    let lower = run.to_ascii_lowercase();

    let pip_errors = lower.lines().any(|line| {
        line.contains("pip")
            && ["error", "failed", "conflict", "exception"]
                .iter()
                .any(|marker| line.contains(marker))
    });

    LogFindings {
        ssl_cert_error: run.contains("CERTIFICATE_VERIFY_FAILED"),
        pip_errors,
        rembg_onnx_missing: lower.contains("no onnxruntime backend found")
            || (lower.contains("install rembg") && lower.contains("onnxruntime")),
    }
}

fn read_log_tail(location: &BackendLocation) -> Option<String> {
    let mut file = std::fs::File::open(&location.comfy_log).ok()?;
    let len = file.metadata().ok()?.len();
    if len > LOG_TAIL_LIMIT {
        file.seek(SeekFrom::Start(len - LOG_TAIL_LIMIT)).ok()?;
    }
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).ok()?;
    Some(String::from_utf8_lossy(&buf).into_owned())
}

fn issue(id: IssueId, severity: Severity, title: &str, cause: &str, evidence: String, fix: &str) -> DiagnosticIssue {
    DiagnosticIssue {
        id,
        severity,
        title: title.to_string(),
        cause: cause.to_string(),
        evidence,
        fix: fix.to_string(),
    }
}

fn derive_issues(
    backend_up: bool,
    manager_endpoint: &Option<String>,
    venv_exists: bool,
    manager_package_present: Option<bool>,
    manager_import_ok: Option<bool>,
    pip_healthy: Option<bool>,
    log_findings: &LogFindings,
) -> Vec<DiagnosticIssue> {
    let mut issues = Vec::new();

    if !backend_up {
        issues.push(issue(
            IssueId::BackendDown,
            Severity::Error,
            "Engine is not reachable",
            "GET /system_stats did not answer with a success status",
            "system_stats probe failed".to_string(),
            "start the engine (the fix engine launches the start script detached)",
        ));
    }
    if backend_up && manager_endpoint.is_none() {
        issues.push(issue(
            IssueId::ManagerRoutesMissing,
            Severity::Error,
            "Manager routes are not mounted",
            "the engine is up but no manager endpoint answers",
            "all manager route probes failed".to_string(),
            "reinstall the manager package and restart the engine",
        ));
    }
    if !venv_exists {
        issues.push(issue(
            IssueId::VenvMissing,
            Severity::Error,
            "Virtualenv interpreter is missing",
            "venv/bin/python does not exist under the backend directory",
            "venv python not found".to_string(),
            "recreate the virtualenv, then run an environment repair",
        ));
    }
    if venv_exists && manager_package_present == Some(false) && manager_endpoint.is_none() {
        issues.push(issue(
            IssueId::ManagerPkgMissing,
            Severity::Error,
            "Manager package is not installed",
            "the virtualenv has no comfyui_manager distribution",
            "importlib could not locate the package".to_string(),
            "run the compatibility install pipeline to restore the manager",
        ));
    }
    if manager_package_present == Some(true)
        && manager_import_ok == Some(false)
        && manager_endpoint.is_none()
    {
        issues.push(issue(
            IssueId::ManagerImportRuntimeFailed,
            Severity::Warning,
            "Manager package fails to import",
            "the distribution is present but importing it raises",
            "import probe exited non-zero".to_string(),
            "run the compatibility install pipeline to repair manager dependencies",
        ));
    }
    if pip_healthy == Some(false) {
        issues.push(issue(
            IssueId::PipCheckFailed,
            Severity::Warning,
            "pip reports broken requirements",
            "pip check found conflicting or missing distributions",
            "pip check exited non-zero".to_string(),
            "run the dependency reconciliation and auto-heal pipeline",
        ));
    }
    if log_findings.ssl_cert_error {
        issues.push(issue(
            IssueId::SslCertIssue,
            Severity::Warning,
            "TLS certificate verification failures in the engine log",
            "the engine could not verify upstream certificates",
            "CERTIFICATE_VERIFY_FAILED found in the log tail".to_string(),
            "upgrade the certificate bundle package and restart the engine",
        ));
    }
    if log_findings.pip_errors && pip_healthy == Some(false) {
        issues.push(issue(
            IssueId::PipLogIssue,
            Severity::Warning,
            "pip failures recorded in the engine log",
            "the log tail shows pip errors and pip check confirms breakage",
            "pip error markers found in the log tail".to_string(),
            "run the dependency reconciliation and auto-heal pipeline",
        ));
    }
    if log_findings.rembg_onnx_missing {
        issues.push(issue(
            IssueId::RembgOnnxMissing,
            Severity::Error,
            "rembg has no onnxruntime backend",
            "background removal nodes need an onnxruntime install matching the hardware",
            "onnxruntime backend markers found in the log tail".to_string(),
            "install rembg with the hardware-appropriate onnxruntime package",
        ));
    }

    issues
}
