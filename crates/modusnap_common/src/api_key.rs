//! API key records and keystore
//!
//! Keys authenticate callers of the control-plane RPC surface. The store is a
//! single JSON file under the backend user directory, capped at 100 keys;
//! writes are replace-by-rename.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const KEY_PREFIX: &str = "msnp_";
pub const MAX_KEYS: usize = 100;
const KEY_BYTES: usize = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: String,
    pub label: String,
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

/// Listing view that never exposes the secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeySummary {
    pub id: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct KeyFile {
    keys: Vec<ApiKey>,
}

/// Generate a fresh key: `msnp_` + 24 bytes from the OS RNG, hex-encoded.
pub fn generate_key(label: &str) -> ApiKey {
    let mut bytes = [0u8; KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    ApiKey {
        id: uuid::Uuid::new_v4().to_string(),
        label: label.trim().to_string(),
        key: format!("{KEY_PREFIX}{hex}"),
        created_at: Utc::now(),
        revoked: false,
    }
}

/// File-backed key store.
#[derive(Debug, Clone)]
pub struct KeyStore {
    path: PathBuf,
}

impl KeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Vec<ApiKey> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        serde_json::from_str::<KeyFile>(&raw)
            .map(|file| file.keys)
            .unwrap_or_default()
    }

    fn save(&self, keys: &[ApiKey]) -> Result<()> {
        let keep = if keys.len() > MAX_KEYS {
            &keys[keys.len() - MAX_KEYS..]
        } else {
            keys
        };
        let file = KeyFile { keys: keep.to_vec() };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&file).context("failed to serialize key store")?;
        std::fs::write(&tmp, json)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    pub fn create(&self, label: &str) -> Result<ApiKey> {
        let mut keys = self.load();
        let key = generate_key(label);
        keys.push(key.clone());
        self.save(&keys)?;
        Ok(key)
    }

    pub fn list(&self) -> Vec<ApiKeySummary> {
        self.load()
            .into_iter()
            .map(|k| ApiKeySummary {
                id: k.id,
                label: k.label,
                created_at: k.created_at,
                revoked: k.revoked,
            })
            .collect()
    }

    pub fn revoke(&self, id: &str) -> Result<bool> {
        let mut keys = self.load();
        let mut found = false;
        for key in keys.iter_mut() {
            if key.id == id {
                key.revoked = true;
                found = true;
            }
        }
        if found {
            self.save(&keys)?;
        }
        Ok(found)
    }

    /// True when no usable key exists; the surface stays open for first-run
    /// bootstrap in that case.
    pub fn is_empty(&self) -> bool {
        self.load().iter().all(|k| k.revoked)
    }

    pub fn verify(&self, presented: &str) -> bool {
        let presented = presented.trim();
        if presented.is_empty() {
            return false;
        }
        self.load()
            .iter()
            .any(|k| !k.revoked && k.key == presented)
    }
}
