//! Subprocess runner for the backend virtualenv
//!
//! Every package-manager and probe invocation funnels through here: one
//! canonical `(exit status, combined output)` record, one truncation policy,
//! one timeout mechanism. A process that cannot start yields a synthetic
//! failure record instead of an error so transaction steps stay uniform.

use crate::locator::BackendLocation;
use chrono::Utc;
use modusnap_common::{truncate_output, EnvStep};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Wall-clock budget for installs.
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Wall-clock budget for cheap probes (`pip check`, `pip list`, imports).
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(12);
/// Torch CUDA/MPS probe budget.
pub const TORCH_PROBE_TIMEOUT: Duration = Duration::from_millis(3500);

/// Canonical result of one subprocess invocation.
#[derive(Debug, Clone)]
pub struct ExecRecord {
    pub exit_status: Option<i32>,
    pub ok: bool,
    /// Combined stdout+stderr, truncated to the step limit.
    pub output: String,
}

impl ExecRecord {
    fn synthetic_failure(output: impl Into<String>) -> Self {
        Self {
            exit_status: None,
            ok: false,
            output: output.into(),
        }
    }
}

/// Run the venv interpreter with the given arguments, cwd at the backend.
///
/// A missing interpreter or spawn failure produces a synthetic failed record;
/// a timeout kills the child and records what was captured so far.
pub async fn run_python(location: &BackendLocation, args: &[&str], timeout: Duration) -> ExecRecord {
    if !location.venv_exists() {
        return ExecRecord::synthetic_failure(format!(
            "virtualenv interpreter not found: {}",
            location.venv_python.display()
        ));
    }
    run_program(
        &location.venv_python,
        args,
        &location.backend_dir,
        timeout,
    )
    .await
}

async fn run_program(
    program: &Path,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> ExecRecord {
    debug!("exec: {} {}", program.display(), args.join(" "));

    let mut child = match Command::new(program)
        .args(args)
        .current_dir(cwd)
        .env("PIP_DISABLE_PIP_VERSION_CHECK", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            return ExecRecord::synthetic_failure(format!(
                "failed to start {}: {err}",
                program.display()
            ));
        }
    };

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let reader = async {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let drain_out = async {
            if let Some(stream) = stdout.as_mut() {
                let _ = stream.read_to_end(&mut out).await;
            }
        };
        let drain_err = async {
            if let Some(stream) = stderr.as_mut() {
                let _ = stream.read_to_end(&mut err).await;
            }
        };
        tokio::join!(drain_out, drain_err);
        (out, err)
    };

    let combined = async {
        let ((out, err), status) = tokio::join!(reader, child.wait());
        (out, err, status)
    };
    let waited = tokio::time::timeout(timeout, combined).await;

    match waited {
        Ok((out, err, status)) => {
            let mut text = String::from_utf8_lossy(&out).into_owned();
            if !err.is_empty() {
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&String::from_utf8_lossy(&err));
            }
            let (code, ok) = match status {
                Ok(status) => (status.code(), status.success()),
                Err(err) => {
                    warn!("failed to collect subprocess status: {err}");
                    (None, false)
                }
            };
            ExecRecord {
                exit_status: code,
                ok,
                output: truncate_output(&text),
            }
        }
        Err(_) => {
            warn!(
                "subprocess timed out after {:?}: {} {}",
                timeout,
                program.display(),
                args.join(" ")
            );
            let _ = child.kill().await;
            ExecRecord::synthetic_failure(format!(
                "timed out after {}s",
                timeout.as_secs()
            ))
        }
    }
}

/// Run a command and wrap it into a transaction step record.
pub async fn run_step(
    location: &BackendLocation,
    display_command: &str,
    args: &[&str],
    timeout: Duration,
) -> EnvStep {
    let started_at = Utc::now();
    let record = run_python(location, args, timeout).await;
    EnvStep {
        id: uuid::Uuid::new_v4().to_string(),
        command: display_command.to_string(),
        started_at,
        finished_at: Utc::now(),
        exit_status: record.exit_status,
        ok: record.ok,
        output: record.output,
    }
}

/// Synthetic step for commands that never started (missing venv and the like).
pub fn synthetic_step(display_command: &str, reason: &str) -> EnvStep {
    let now = Utc::now();
    EnvStep {
        id: uuid::Uuid::new_v4().to_string(),
        command: display_command.to_string(),
        started_at: now,
        finished_at: now,
        exit_status: None,
        ok: false,
        output: reason.to_string(),
    }
}

/// Start the workspace start script detached; stdio is dropped and the child
/// is never waited on.
pub fn spawn_detached_start(location: &BackendLocation) -> anyhow::Result<()> {
    let script = location.start_script_path();
    let line = format!(
        "nohup {:?} >> {:?} 2>&1 &",
        script, location.restart_log
    );
    std::process::Command::new("bash")
        .arg("-lc")
        .arg(&line)
        .current_dir(&location.backend_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|_| ())
        .map_err(|err| anyhow::anyhow!("failed to spawn start script: {err}"))
}
