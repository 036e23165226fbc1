//! Backend location discovery
//!
//! Resolves the engine checkout: explicit override first, then a fixed list
//! of candidate paths. A directory only counts when both marker files are
//! present. Every other component fails fast with the same structured error
//! when no valid location exists.

use modusnap_common::{ControlError, ErrorKind, HardwareProfile};
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Marker files a backend directory must contain.
const MARKER_FILES: &[&str] = &["main.py", "requirements.txt"];

/// Candidate locations checked in order when no override is set.
const CANDIDATE_DIRS: &[&str] = &[
    "./ComfyUI",
    "../ComfyUI",
    "~/ComfyUI",
    "~/comfy/ComfyUI",
    "/opt/ComfyUI",
    "/workspace/ComfyUI",
];

/// Resolved filesystem layout of one backend.
#[derive(Debug, Clone)]
pub struct BackendLocation {
    pub backend_dir: PathBuf,
    pub venv_python: PathBuf,
    pub user_dir: PathBuf,
    pub custom_nodes_dir: PathBuf,
    pub comfy_log: PathBuf,
    pub restart_log: PathBuf,
}

impl BackendLocation {
    fn from_dir(dir: PathBuf) -> Self {
        let user_dir = dir.join("user");
        Self {
            venv_python: dir.join("venv").join("bin").join("python"),
            custom_nodes_dir: dir.join("custom_nodes"),
            comfy_log: user_dir.join("comfyui.log"),
            restart_log: user_dir.join("modusnap_backend_restart.log"),
            user_dir,
            backend_dir: dir,
        }
    }

    pub fn venv_exists(&self) -> bool {
        self.venv_python.is_file()
    }

    /// Directory for control-plane transaction state.
    pub fn env_state_dir(&self) -> PathBuf {
        self.user_dir.join("modusnap_manager_env")
    }

    pub fn transactions_path(&self) -> PathBuf {
        self.env_state_dir().join("transactions.json")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.env_state_dir().join("snapshots")
    }

    pub fn compat_current_path(&self) -> PathBuf {
        self.user_dir.join("modusnap_compatible_hardware_set.json")
    }

    pub fn compat_history_dir(&self) -> PathBuf {
        self.user_dir.join("compatibility_sets")
    }

    pub fn compatible_requirements_path(&self) -> PathBuf {
        self.user_dir.join("modusnap_compatible_requirements.txt")
    }

    pub fn incompatible_requirements_path(&self) -> PathBuf {
        self.user_dir.join("modusnap_incompatible_requirements.txt")
    }

    pub fn dependency_report_path(&self) -> PathBuf {
        self.user_dir
            .join("modusnap_dependency_compatibility_report.json")
    }

    pub fn installable_packs_path(&self) -> PathBuf {
        self.user_dir.join("modusnap_catalog_installable_packs.json")
    }

    pub fn incompatible_packs_path(&self) -> PathBuf {
        self.user_dir.join("modusnap_catalog_incompatible_packs.json")
    }

    pub fn api_keys_path(&self) -> PathBuf {
        self.user_dir.join("modusnap_api_keys.json")
    }

    pub fn hardware_profile_path(&self) -> PathBuf {
        self.user_dir.join("hardware_profile.txt")
    }

    pub fn dependency_sync_marker_path(&self) -> PathBuf {
        self.user_dir.join("modusnap_dependency_sync")
    }

    pub fn start_script_path(&self) -> PathBuf {
        self.backend_dir.join("start.sh")
    }

    pub fn hardware_profile(&self) -> HardwareProfile {
        HardwareProfile::read_from(&self.hardware_profile_path())
    }
}

/// Resolves and validates the backend directory.
#[derive(Debug, Clone)]
pub struct BackendLocator {
    override_dir: Option<String>,
}

impl BackendLocator {
    pub fn new(override_dir: Option<String>) -> Self {
        Self { override_dir }
    }

    /// Resolve the backend location, or fail with `BACKEND_DIR_NOT_FOUND`
    /// carrying every checked path and a remediation hint.
    pub fn resolve(&self) -> Result<BackendLocation, ControlError> {
        let mut checked = Vec::new();

        if let Some(override_dir) = &self.override_dir {
            let dir = expand_home(override_dir);
            if is_valid_backend_dir(&dir) {
                return Ok(BackendLocation::from_dir(dir));
            }
            checked.push(dir.display().to_string());
        } else {
            for candidate in CANDIDATE_DIRS {
                let dir = expand_home(candidate);
                if is_valid_backend_dir(&dir) {
                    return Ok(BackendLocation::from_dir(dir));
                }
                checked.push(dir.display().to_string());
            }
        }

        Err(ControlError::new(
            ErrorKind::BackendDirNotFound,
            "no valid engine directory found",
        )
        .with_details(json!({
            "checkedPaths": checked,
            "markerFiles": MARKER_FILES,
            "remediation": "set MODUSNAP_BACKEND_DIR to the engine checkout \
                 (the directory containing main.py and requirements.txt)",
        })))
    }

    /// TCP-level listen check with an explicit timeout.
    pub async fn is_port_listening(host: &str, port: u16, timeout: Duration) -> bool {
        let addr: SocketAddr = match format!("{host}:{port}").parse() {
            Ok(addr) => addr,
            Err(_) => return false,
        };
        matches!(
            tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

fn is_valid_backend_dir(dir: &Path) -> bool {
    dir.is_dir() && MARKER_FILES.iter().all(|marker| dir.join(marker).is_file())
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(raw)
}
