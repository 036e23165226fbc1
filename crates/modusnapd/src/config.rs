//! Daemon configuration
//!
//! Environment variables only, read once at startup. Settings persistence is
//! deliberately out of scope; this is just enough to find the engine and
//! bind the RPC surface.

use modusnap_common::Tier;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Explicit backend directory override; when unset, discovery runs.
    pub backend_dir_override: Option<String>,
    /// Engine base URL.
    pub engine_url: String,
    /// Listen address for the RPC surface.
    pub listen: String,
    /// License tier the policy gate evaluates against.
    pub tier: Tier,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let backend_dir_override = std::env::var("MODUSNAP_BACKEND_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let engine_url = std::env::var("MODUSNAP_ENGINE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "http://localhost:8188".to_string());
        let listen = std::env::var("MODUSNAP_LISTEN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "127.0.0.1:3001".to_string());
        let tier = std::env::var("MODUSNAP_TIER")
            .ok()
            .and_then(|raw| Tier::parse(&raw))
            .unwrap_or(Tier::Free);

        Self {
            backend_dir_override,
            engine_url: engine_url.trim_end_matches('/').to_string(),
            listen,
            tier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        // from_env reads the process environment; defaults apply when the
        // modusnap variables are unset, which is the case under cargo test.
        let config = DaemonConfig::from_env();
        assert!(config.engine_url.starts_with("http"));
        assert!(!config.listen.is_empty());
    }
}
