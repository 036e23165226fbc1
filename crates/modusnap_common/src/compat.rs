//! Compatibility artifacts: audit reports, dependency locks, compatibility sets
//!
//! A compatibility set freezes `(hardware profile, verified dependency state,
//! normalized constraint set, audited pack classification)` and guards install
//! correctness; one `current` per backend plus a capped history.

use crate::hardware_profile::HardwareProfile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Installable,
    Warning,
    Blocked,
}

/// Per-item verdict from the compatibility auditor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackDecision {
    pub key: String,
    pub title: String,
    pub decision: Decision,
    pub reasons: Vec<String>,
}

/// Aggregate preflight output over a batch of catalog items.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightReport {
    pub total: usize,
    pub installable: usize,
    pub warning: usize,
    pub blocked: usize,
    pub blocked_keys: Vec<String>,
    pub global_warnings: Vec<String>,
    /// When `compact`, only non-installable decisions are listed.
    pub compact: bool,
    pub per_item: Vec<PackDecision>,
}

/// One package whose collected specifiers admit no version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequirementConflict {
    pub package: String,
    pub specs: Vec<String>,
    pub markers: Vec<String>,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyAuditReport {
    pub files_scanned: usize,
    pub packages_scanned: usize,
    pub conflicts: Vec<RequirementConflict>,
    pub compatible_requirement_count: usize,
    pub compatible_requirements_path: String,
    pub incompatible_requirements_path: String,
    pub report_path: String,
    /// Lines that failed to parse, `<file>: <line>`, capped like conflicts.
    #[serde(default)]
    pub unparsed_lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PinnedPackage {
    pub name: String,
    pub version: String,
}

/// Point-in-time capture of the virtualenv contents.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DependencyLock {
    pub python: Option<String>,
    pub pkgs: Vec<PinnedPackage>,
    pub manager_version: Option<String>,
    pub git_commit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogAudit {
    pub total: usize,
    pub installable: usize,
    pub warning: usize,
    pub blocked: usize,
    pub blocked_keys: Vec<String>,
    pub decisions: Vec<PackDecision>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilitySet {
    pub lock_id: String,
    pub created_at: DateTime<Utc>,
    pub hardware_profile: HardwareProfile,
    pub pip_healthy: bool,
    pub pip_check_output: String,
    pub selected_pack_keys: Vec<String>,
    pub selected_pack_ids: Vec<String>,
    pub dependency_lock: DependencyLock,
    pub dependency_audit: Option<DependencyAuditReport>,
    pub catalog_audit: Option<CatalogAudit>,
}

impl CompatibilitySet {
    /// Age-based staleness; callers also rebuild on profile change and on
    /// `pip_healthy == false`.
    pub fn is_stale(&self, max_age: chrono::Duration) -> bool {
        Utc::now() - self.created_at > max_age
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_precedence_orders_blocked_highest() {
        assert!(Decision::Blocked > Decision::Warning);
        assert!(Decision::Warning > Decision::Installable);
    }

    #[test]
    fn fresh_set_is_not_stale() {
        let set = CompatibilitySet {
            lock_id: "lock".into(),
            created_at: Utc::now(),
            hardware_profile: HardwareProfile::unknown(),
            pip_healthy: true,
            pip_check_output: String::new(),
            selected_pack_keys: vec![],
            selected_pack_ids: vec![],
            dependency_lock: DependencyLock::default(),
            dependency_audit: None,
            catalog_audit: None,
        };
        assert!(!set.is_stale(chrono::Duration::minutes(15)));
        assert!(set.is_stale(chrono::Duration::seconds(-1)));
    }
}
