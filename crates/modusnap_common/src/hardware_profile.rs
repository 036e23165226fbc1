//! Hardware profile token parsing
//!
//! The engine bootstrap writes a single-line marker such as
//! `linux-x86_64-nvidia:true-rocm:false`. The control plane only reads it;
//! when the marker is absent the profile is `unknown` and every flag is off.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Parsed view of the hardware marker token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HardwareProfile {
    /// The raw token as written by the bootstrap.
    pub token: String,
    pub os: String,
    pub arch: String,
    pub has_nvidia: bool,
    pub has_rocm: bool,
    pub is_darwin_arm64: bool,
}

impl HardwareProfile {
    pub fn unknown() -> Self {
        Self {
            token: "unknown".to_string(),
            os: "unknown".to_string(),
            arch: "unknown".to_string(),
            has_nvidia: false,
            has_rocm: false,
            is_darwin_arm64: false,
        }
    }

    /// Parse a marker token of the form `<os>-<arch>[-flag:value]...`.
    ///
    /// Unparseable tokens degrade to segment-by-segment defaults rather than
    /// failing; a hardware marker must never block an operation.
    pub fn parse(token: &str) -> Self {
        let token = token.trim();
        if token.is_empty() || token == "unknown" {
            return Self::unknown();
        }

        let mut os = "unknown".to_string();
        let mut arch = "unknown".to_string();
        let mut has_nvidia = false;
        let mut has_rocm = false;

        for (idx, segment) in token.split('-').enumerate() {
            match (idx, segment.split_once(':')) {
                (0, None) => os = segment.to_string(),
                (1, None) => arch = segment.to_string(),
                (_, Some((flag, value))) => {
                    let enabled = value.eq_ignore_ascii_case("true");
                    match flag {
                        "nvidia" => has_nvidia = enabled,
                        "rocm" => has_rocm = enabled,
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        let is_darwin_arm64 = os == "darwin" && arch == "arm64";
        Self {
            token: token.to_string(),
            os,
            arch,
            has_nvidia,
            has_rocm,
            is_darwin_arm64,
        }
    }

    /// Read the marker file; missing or unreadable markers yield `unknown`.
    pub fn read_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(_) => Self::unknown(),
        }
    }
}
