//! Error taxonomy shared by the daemon and its clients
//!
//! Transport-agnostic: the route layer maps `ErrorKind` to HTTP status codes,
//! everything below it passes `ControlError` around unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of failure kinds surfaced over the RPC boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    BackendDirNotFound,
    BackendUnreachable,
    VenvMissing,
    Conflict,
    NotFound,
    InvalidArg,
    PolicyViolation,
    QueueTimeout,
    UpstreamError,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BackendDirNotFound => "BACKEND_DIR_NOT_FOUND",
            Self::BackendUnreachable => "BACKEND_UNREACHABLE",
            Self::VenvMissing => "VENV_MISSING",
            Self::Conflict => "CONFLICT",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidArg => "INVALID_ARG",
            Self::PolicyViolation => "POLICY_VIOLATION",
            Self::QueueTimeout => "QUEUE_TIMEOUT",
            Self::UpstreamError => "UPSTREAM_ERROR",
            Self::Internal => "INTERNAL",
        }
    }
}

/// Structured operation failure carried across the RPC boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlError {
    pub kind: ErrorKind,
    pub message: String,
    /// Kind-specific payload, e.g. checked paths for `BACKEND_DIR_NOT_FOUND`
    /// or the upstream status for `UPSTREAM_ERROR`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ControlError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_arg(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArg, message)
    }

    pub fn upstream(status: u16, body_snippet: &str) -> Self {
        Self::new(
            ErrorKind::UpstreamError,
            format!("engine returned HTTP {status}"),
        )
        .with_details(serde_json::json!({
            "status": status,
            "body": body_snippet,
        }))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ControlError {}

impl From<anyhow::Error> for ControlError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}
