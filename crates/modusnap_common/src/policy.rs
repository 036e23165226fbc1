//! License-tier policy gate
//!
//! Each tier admits a fixed set of pack license policies; anything the tier
//! does not name is denied, and policies outside the known vocabulary are
//! always denied.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Self::Free),
            "pro" => Some(Self::Pro),
            "enterprise" => Some(Self::Enterprise),
            _ => None,
        }
    }

    fn allowed_policies(self) -> &'static [&'static str] {
        match self {
            Self::Free => &["open"],
            Self::Pro => &["open", "non-commercial"],
            Self::Enterprise => &["open", "non-commercial", "commercial"],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub allowed: bool,
    pub violations: Vec<String>,
}

/// Evaluate requested pack policies against a tier. Violations keep request
/// order and are deduplicated.
pub fn evaluate_policy(tier: Tier, policies: &[String]) -> PolicyDecision {
    let allowed_set = tier.allowed_policies();
    let mut violations: Vec<String> = Vec::new();
    for policy in policies {
        let normalized = policy.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            continue;
        }
        if !allowed_set.contains(&normalized.as_str()) && !violations.contains(&normalized) {
            violations.push(normalized);
        }
    }
    PolicyDecision {
        allowed: violations.is_empty(),
        violations,
    }
}
