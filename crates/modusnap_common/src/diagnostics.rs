//! Typed diagnostic issues
//!
//! Issue ids form a closed set so the fix engine can dispatch on them; the
//! `fix` string on each issue is the human rendering of the same id.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IssueId {
    BackendDown,
    ManagerRoutesMissing,
    VenvMissing,
    ManagerPkgMissing,
    ManagerImportRuntimeFailed,
    PipCheckFailed,
    SslCertIssue,
    PipLogIssue,
    RembgOnnxMissing,
}

impl IssueId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BackendDown => "backend_down",
            Self::ManagerRoutesMissing => "manager_routes_missing",
            Self::VenvMissing => "venv_missing",
            Self::ManagerPkgMissing => "manager_pkg_missing",
            Self::ManagerImportRuntimeFailed => "manager_import_runtime_failed",
            Self::PipCheckFailed => "pip_check_failed",
            Self::SslCertIssue => "ssl_cert_issue",
            Self::PipLogIssue => "pip_log_issue",
            Self::RembgOnnxMissing => "rembg_onnx_missing",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "backend_down" => Some(Self::BackendDown),
            "manager_routes_missing" => Some(Self::ManagerRoutesMissing),
            "venv_missing" => Some(Self::VenvMissing),
            "manager_pkg_missing" => Some(Self::ManagerPkgMissing),
            "manager_import_runtime_failed" => Some(Self::ManagerImportRuntimeFailed),
            "pip_check_failed" => Some(Self::PipCheckFailed),
            "ssl_cert_issue" => Some(Self::SslCertIssue),
            "pip_log_issue" => Some(Self::PipLogIssue),
            "rembg_onnx_missing" => Some(Self::RembgOnnxMissing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticIssue {
    pub id: IssueId,
    pub severity: Severity,
    pub title: String,
    pub cause: String,
    pub evidence: String,
    /// Human fix description; the id, not this string, drives the fix engine.
    pub fix: String,
}
