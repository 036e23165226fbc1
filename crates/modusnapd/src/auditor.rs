//! Hardware-aware compatibility auditing
//!
//! Classifies catalog items against the current hardware profile by pattern
//! matching over the item's textual fields. `blocked` beats `warning` beats
//! `installable`; reasons accumulate for display. Audit results are persisted
//! for the audit trail and returned in aggregate.

use crate::locator::BackendLocation;
use anyhow::{Context, Result};
use modusnap_common::{
    CatalogAudit, CatalogItem, Decision, HardwareProfile, PackDecision, PreflightReport,
};
use tracing::debug;

/// Batches above this size compress per-item output to non-installable only.
const COMPACT_THRESHOLD: usize = 600;
/// Batches above this size get a chunking hint in the global warnings.
const LARGE_BATCH_HINT: usize = 200;

enum HardwareCondition {
    NoNvidia,
    NoRocm,
    DarwinArm64,
}

struct AuditRule {
    patterns: &'static [&'static str],
    condition: HardwareCondition,
    decision: Decision,
    reason: &'static str,
}

/// Precedence order: hard blocks first, then warnings.
const AUDIT_RULES: &[AuditRule] = &[
    AuditRule {
        patterns: &[
            "cuda-only",
            "requires cuda",
            "nvidia-only",
            "tensorrt required",
            "triton required",
        ],
        condition: HardwareCondition::NoNvidia,
        decision: Decision::Blocked,
        reason: "requires NVIDIA CUDA hardware",
    },
    AuditRule {
        patterns: &["rocm-only", "requires rocm", "hip required"],
        condition: HardwareCondition::NoRocm,
        decision: Decision::Blocked,
        reason: "requires AMD ROCm hardware",
    },
    AuditRule {
        patterns: &["cuda", "nvidia", "tensorrt", "cu12", "cu11"],
        condition: HardwareCondition::NoNvidia,
        decision: Decision::Warning,
        reason: "mentions CUDA tooling but no NVIDIA GPU is present",
    },
    AuditRule {
        patterns: &["rocm", "hip"],
        condition: HardwareCondition::NoRocm,
        decision: Decision::Warning,
        reason: "mentions ROCm tooling but no AMD GPU is present",
    },
    AuditRule {
        patterns: &["xformers", "triton", "flash-attn", "bitsandbytes"],
        condition: HardwareCondition::DarwinArm64,
        decision: Decision::Warning,
        reason: "accelerator package with limited Apple Silicon support",
    },
];

fn condition_applies(condition: &HardwareCondition, profile: &HardwareProfile) -> bool {
    match condition {
        HardwareCondition::NoNvidia => !profile.has_nvidia,
        HardwareCondition::NoRocm => !profile.has_rocm,
        HardwareCondition::DarwinArm64 => profile.is_darwin_arm64,
    }
}

fn item_blob(item: &CatalogItem) -> String {
    let mut blob = String::new();
    for field in [
        item.id.as_deref(),
        item.title.as_deref(),
        item.author.as_deref(),
        item.description.as_deref(),
        item.repository.as_deref(),
        item.reference.as_deref(),
    ]
    .into_iter()
    .flatten()
    {
        blob.push_str(field);
        blob.push(' ');
    }
    for file in &item.files {
        blob.push_str(file);
        blob.push(' ');
    }
    blob.to_ascii_lowercase()
}

/// Classify one item against the profile.
pub fn audit_item(item: &CatalogItem, profile: &HardwareProfile) -> PackDecision {
    let blob = item_blob(item);
    let mut decision = Decision::Installable;
    let mut reasons = Vec::new();

    for rule in AUDIT_RULES {
        if !condition_applies(&rule.condition, profile) {
            continue;
        }
        if let Some(matched) = rule.patterns.iter().find(|p| blob.contains(**p)) {
            reasons.push(format!("'{matched}': {}", rule.reason));
            if rule.decision > decision {
                decision = rule.decision;
            }
        }
    }

    PackDecision {
        key: item.key(),
        title: item.display_title(),
        decision,
        reasons,
    }
}

/// Classify a batch and persist the audit trail files.
pub fn audit_catalog(
    location: &BackendLocation,
    items: &[CatalogItem],
    profile: &HardwareProfile,
) -> Result<CatalogAudit> {
    let decisions: Vec<PackDecision> =
        items.iter().map(|item| audit_item(item, profile)).collect();

    let blocked_keys: Vec<String> = decisions
        .iter()
        .filter(|d| d.decision == Decision::Blocked)
        .map(|d| d.key.clone())
        .collect();
    let audit = CatalogAudit {
        total: decisions.len(),
        installable: decisions
            .iter()
            .filter(|d| d.decision == Decision::Installable)
            .count(),
        warning: decisions
            .iter()
            .filter(|d| d.decision == Decision::Warning)
            .count(),
        blocked: blocked_keys.len(),
        blocked_keys,
        decisions,
    };

    persist_audit_trail(location, &audit)?;
    Ok(audit)
}

fn persist_audit_trail(location: &BackendLocation, audit: &CatalogAudit) -> Result<()> {
    let installable: Vec<&PackDecision> = audit
        .decisions
        .iter()
        .filter(|d| d.decision != Decision::Blocked)
        .collect();
    let incompatible: Vec<&PackDecision> = audit
        .decisions
        .iter()
        .filter(|d| d.decision == Decision::Blocked)
        .collect();

    write_json(location, &location.installable_packs_path(), &installable)?;
    write_json(location, &location.incompatible_packs_path(), &incompatible)?;
    Ok(())
}

fn write_json<T: serde::Serialize>(
    location: &BackendLocation,
    path: &std::path::Path,
    value: &T,
) -> Result<()> {
    std::fs::create_dir_all(&location.user_dir)
        .with_context(|| format!("failed to create {}", location.user_dir.display()))?;
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(value).context("failed to serialize audit")?;
    std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Preflight surface over a batch: aggregate summary, global hints, and the
/// per-item list (compacted for very large batches).
pub fn preflight(
    location: &BackendLocation,
    items: &[CatalogItem],
    profile: &HardwareProfile,
    pip_healthy: Option<bool>,
) -> Result<PreflightReport> {
    let audit = audit_catalog(location, items, profile)?;
    debug!(
        "preflight: {} items, {} blocked, {} warnings",
        audit.total, audit.blocked, audit.warning
    );

    let mut global_warnings = Vec::new();
    if pip_healthy == Some(false) {
        global_warnings.push(
            "the environment already has pip dependency conflicts; installs may compound them"
                .to_string(),
        );
    }
    if audit.total > LARGE_BATCH_HINT {
        global_warnings.push(format!(
            "large batch of {} items; installation will be chunked",
            audit.total
        ));
    }

    let compact = audit.total > COMPACT_THRESHOLD;
    let per_item = if compact {
        audit
            .decisions
            .iter()
            .filter(|d| d.decision != Decision::Installable)
            .cloned()
            .collect()
    } else {
        audit.decisions.clone()
    };

    Ok(PreflightReport {
        total: audit.total,
        installable: audit.installable,
        warning: audit.warning,
        blocked: audit.blocked,
        blocked_keys: audit.blocked_keys.clone(),
        global_warnings,
        compact,
        per_item,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(title: &str, description: &str) -> CatalogItem {
        CatalogItem {
            ui_key: Some(format!("key-{title}")),
            title: Some(title.to_string()),
            description: Some(description.to_string()),
            ..Default::default()
        }
    }

    fn no_gpu_profile() -> HardwareProfile {
        HardwareProfile::parse("linux-x86_64-nvidia:false-rocm:false")
    }

    fn location() -> (tempfile::TempDir, BackendLocation) {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("main.py"), "").unwrap();
        std::fs::write(tmp.path().join("requirements.txt"), "").unwrap();
        let location = crate::locator::BackendLocator::new(Some(
            tmp.path().display().to_string(),
        ))
        .resolve()
        .unwrap();
        (tmp, location)
    }

    #[test]
    fn cuda_only_blocks_without_nvidia() {
        let decision = audit_item(&item("Flash pack", "requires cuda"), &no_gpu_profile());
        assert_eq!(decision.decision, Decision::Blocked);
        assert!(!decision.reasons.is_empty());
    }

    #[test]
    fn plain_cuda_mention_warns_without_nvidia() {
        let decision = audit_item(&item("Sampler", "uses cuda kernels"), &no_gpu_profile());
        assert_eq!(decision.decision, Decision::Warning);
    }

    #[test]
    fn cuda_text_is_installable_with_nvidia() {
        let profile = HardwareProfile::parse("linux-x86_64-nvidia:true-rocm:false");
        let decision = audit_item(&item("Sampler", "cuda-only tensorrt required"), &profile);
        assert_eq!(decision.decision, Decision::Installable);
        assert!(decision.reasons.is_empty());
    }

    #[test]
    fn blocked_wins_over_warning() {
        // Matches both the hard block ("cuda-only") and the soft rule ("cuda").
        let decision = audit_item(&item("Pack", "cuda-only kernels"), &no_gpu_profile());
        assert_eq!(decision.decision, Decision::Blocked);
        assert!(decision.reasons.len() >= 2);
    }

    #[test]
    fn darwin_arm64_warns_on_accelerator_packages() {
        let profile = HardwareProfile::parse("darwin-arm64-nvidia:false-rocm:false");
        let decision = audit_item(&item("Attention", "uses xformers"), &profile);
        assert_eq!(decision.decision, Decision::Warning);
    }

    #[test]
    fn e4_preflight_summary() {
        let (_tmp, location) = location();
        let profile = HardwareProfile::parse("darwin-arm64-nvidia:false-rocm:false");
        let items = vec![
            item("CUDA-only Flash Attention", "requires cuda"),
            item("Standard pack", "pure python"),
        ];
        let report = preflight(&location, &items, &profile, Some(true)).unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.installable, 1);
        assert_eq!(report.warning, 0);
        assert_eq!(report.blocked, 1);
        assert_eq!(report.blocked_keys, vec!["key-CUDA-only Flash Attention"]);
        assert!(!report.compact);

        // Audit trail files land next to the other user-dir artifacts.
        assert!(location.installable_packs_path().is_file());
        assert!(location.incompatible_packs_path().is_file());
    }

    #[test]
    fn oversized_batch_compacts_per_item() {
        let (_tmp, location) = location();
        let items: Vec<CatalogItem> = (0..601)
            .map(|i| item(&format!("pack-{i}"), "pure python"))
            .collect();
        let report = preflight(&location, &items, &no_gpu_profile(), Some(true)).unwrap();
        assert!(report.compact);
        assert!(report.per_item.is_empty());
        assert!(report
            .global_warnings
            .iter()
            .any(|w| w.contains("chunked")));
    }

    #[test]
    fn pip_conflicts_surface_as_global_warning() {
        let (_tmp, location) = location();
        let report =
            preflight(&location, &[item("a", "b")], &no_gpu_profile(), Some(false)).unwrap();
        assert!(report
            .global_warnings
            .iter()
            .any(|w| w.contains("pip dependency conflicts")));
    }
}
