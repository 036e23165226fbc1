//! Environment transaction records
//!
//! An `EnvTx` is the durable unit of virtualenv mutation: planned commands,
//! the steps that actually ran, freeze snapshots on both sides, and the final
//! `pip check` verdict. Steps are append-only and immutable once recorded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Upper bound on recorded subprocess output per step.
pub const STEP_OUTPUT_LIMIT: usize = 12 * 1024;

/// Characters allowed in a requested package specifier.
const SPECIFIER_CHARSET: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_.-<>=!~[],:@+/ ";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Repair,
    Install,
    Rollback,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Planned,
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

/// One executed (or synthetically failed) command inside a transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvStep {
    pub id: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub exit_status: Option<i32>,
    pub ok: bool,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvTx {
    pub id: String,
    pub kind: TxKind,
    pub status: TxStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub requested_packages: Vec<String>,
    /// Human-readable plan, informational only.
    pub plan_commands: Vec<String>,
    pub steps: Vec<EnvStep>,
    pub snapshot_before: Option<PathBuf>,
    pub snapshot_after: Option<PathBuf>,
    pub pip_healthy: Option<bool>,
    pub pip_check_output: Option<String>,
    /// Id of the transaction this one undoes, when `kind` is `rollback`.
    pub rollback_of: Option<String>,
    pub error: Option<String>,
}

impl EnvTx {
    pub fn new(kind: TxKind, requested_packages: Vec<String>, plan_commands: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            status: TxStatus::Planned,
            created_at: now,
            updated_at: now,
            requested_packages,
            plan_commands,
            steps: Vec::new(),
            snapshot_before: None,
            snapshot_after: None,
            pip_healthy: None,
            pip_check_output: None,
            rollback_of: None,
            error: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn summary(&self) -> EnvTxSummary {
        EnvTxSummary {
            id: self.id.clone(),
            kind: self.kind,
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            step_count: self.steps.len(),
            pip_healthy: self.pip_healthy,
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvTxSummary {
    pub id: String,
    pub kind: TxKind,
    pub status: TxStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub step_count: usize,
    pub pip_healthy: Option<bool>,
    pub error: Option<String>,
}

/// Sanitize requested package specifiers: drop anything containing characters
/// outside the allowed set, dedup, preserve first-seen order.
pub fn sanitize_packages(requested: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for raw in requested {
        let spec = raw.trim();
        if spec.is_empty() {
            continue;
        }
        if !spec.chars().all(|c| SPECIFIER_CHARSET.contains(c)) {
            continue;
        }
        if seen.insert(spec.to_string()) {
            out.push(spec.to_string());
        }
    }
    out
}

/// Truncate combined subprocess output to the recorded limit, keeping the
/// tail (the end of pip output carries the verdict).
pub fn truncate_output(output: &str) -> String {
    if output.len() <= STEP_OUTPUT_LIMIT {
        return output.to_string();
    }
    let cut = output.len() - STEP_OUTPUT_LIMIT;
    // Stay on a char boundary.
    let mut start = cut;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!("[output truncated]\n{}", &output[start..])
}
