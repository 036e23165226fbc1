//! Catalog item model
//!
//! Catalog entries arrive as free-form maps from the engine and from UI
//! callers; alternative key spellings are normalized at deserialization and
//! unrecognized fields ride along untouched so batch submissions round-trip.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum InstallType {
    #[serde(rename = "cnr")]
    Cnr,
    #[serde(rename = "git-clone", alias = "git_clone")]
    GitClone,
    #[default]
    #[serde(other, rename = "unknown")]
    Unknown,
}

impl InstallType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cnr => "cnr",
            Self::GitClone => "git-clone",
            Self::Unknown => "unknown",
        }
    }
}

/// A catalog pack as submitted for preflight or install.
///
/// `ui_key` is caller-owned and preserved verbatim through every report.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    #[serde(default, alias = "__uiKey", alias = "ui_key")]
    pub ui_key: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "install_type")]
    pub install_type: InstallType,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default, alias = "selected_version", alias = "version")]
    pub selected_version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    /// Lifecycle state as reported by the engine (`enabled`, `updatable`, ...).
    #[serde(default)]
    pub state: Option<String>,
    /// Download size in bytes when the catalog knows it.
    #[serde(default, alias = "download_size")]
    pub size: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CatalogItem {
    /// Stable key for reports: the caller's `uiKey`, falling back to `id`,
    /// then `title`.
    pub fn key(&self) -> String {
        self.ui_key
            .clone()
            .or_else(|| self.id.clone())
            .or_else(|| self.title.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn display_title(&self) -> String {
        self.title
            .clone()
            .or_else(|| self.id.clone())
            .unwrap_or_else(|| "untitled pack".to_string())
    }

    /// Engine lifecycle states that mean the pack is already on disk.
    pub fn is_installed_state(&self) -> bool {
        matches!(
            self.state.as_deref(),
            Some(
                "enabled"
                    | "disabled"
                    | "updatable"
                    | "try-update"
                    | "uninstall"
                    | "import-fail"
                    | "invalid-installation"
            )
        )
    }

    /// Best-effort git URL recovery for cnr items missing a registry id.
    pub fn recover_git_url(&self) -> Option<String> {
        let candidates = self
            .repository
            .iter()
            .chain(self.reference.iter())
            .chain(self.files.iter());
        for candidate in candidates {
            let trimmed = candidate.trim().trim_end_matches('/');
            if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
                continue;
            }
            if trimmed.ends_with(".git")
                || trimmed.contains("github.com/")
                || trimmed.contains("gitlab.com/")
                || trimmed.contains("codeberg.org/")
            {
                return Some(trimmed.to_string());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_alternative_keys() {
        let item: CatalogItem = serde_json::from_str(
            r#"{"__uiKey":"k1","install_type":"git-clone","version":"1.2.0","title":"Pack"}"#,
        )
        .unwrap();
        assert_eq!(item.ui_key.as_deref(), Some("k1"));
        assert_eq!(item.install_type, InstallType::GitClone);
        assert_eq!(item.selected_version.as_deref(), Some("1.2.0"));
    }

    #[test]
    fn unknown_install_type_falls_through() {
        let item: CatalogItem =
            serde_json::from_str(r#"{"id":"x","installType":"copy"}"#).unwrap();
        assert_eq!(item.install_type, InstallType::Unknown);
    }

    #[test]
    fn extra_fields_round_trip() {
        let raw = r#"{"id":"x","customField":{"a":1}}"#;
        let item: CatalogItem = serde_json::from_str(raw).unwrap();
        let back = serde_json::to_value(&item).unwrap();
        assert_eq!(back["customField"]["a"], 1);
    }

    #[test]
    fn recovers_git_url_from_reference() {
        let item = CatalogItem {
            reference: Some("https://github.com/someone/some-pack".to_string()),
            ..Default::default()
        };
        assert_eq!(
            item.recover_git_url().as_deref(),
            Some("https://github.com/someone/some-pack")
        );
    }

    #[test]
    fn installed_states_detected() {
        let mut item = CatalogItem::default();
        for state in ["enabled", "disabled", "updatable", "try-update", "import-fail"] {
            item.state = Some(state.to_string());
            assert!(item.is_installed_state(), "{state} should count as installed");
        }
        item.state = None;
        assert!(!item.is_installed_state());
        item.state = Some("not-installed".to_string());
        assert!(!item.is_installed_state());
    }
}
