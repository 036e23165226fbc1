//! Typed client for the engine HTTP API
//!
//! One shared `reqwest::Client`; per-endpoint timeouts passed at the call
//! site; JSON decode with raw-text fallback; non-2xx maps uniformly to
//! `UPSTREAM_ERROR` with the upstream status and a body snippet.

use modusnap_common::ControlError;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Probe budget for individual manager endpoints.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(2500);
/// `object_info` budget in fast mode.
pub const OBJECT_INFO_FAST_TIMEOUT: Duration = Duration::from_secs(4);
/// `object_info` budget in deep mode.
pub const OBJECT_INFO_DEEP_TIMEOUT: Duration = Duration::from_secs(12);
/// Engine reachability budget.
pub const REACHABILITY_TIMEOUT: Duration = Duration::from_millis(4500);
/// Queue submissions and reboot get a little more room than probes.
pub const MUTATION_TIMEOUT: Duration = Duration::from_secs(15);

const BODY_SNIPPET_LIMIT: usize = 512;

/// Manager route prefixes probed in order; the first reachable one is the
/// session's manager endpoint.
pub const MANAGER_PROBE_PATHS: &[&str] = &[
    "/v2/manager/version",
    "/api/v2/manager/version",
    "/manager/version",
    "/api/manager/version",
];

#[derive(Debug, Clone, Deserialize, Default)]
pub struct QueueStatus {
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub done_count: u64,
    #[serde(default)]
    pub in_progress_count: u64,
    #[serde(default)]
    pub pending_count: u64,
    #[serde(default)]
    pub is_processing: bool,
}

impl QueueStatus {
    pub fn is_drained(&self) -> bool {
        !self.is_processing && self.pending_count == 0
    }
}

#[derive(Debug, Clone)]
pub struct EngineClient {
    http: reqwest::Client,
    base: String,
}

impl EngineClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// GET returning parsed JSON, with raw-text fallback on parse failure.
    async fn get_json(&self, path: &str, timeout: Duration) -> Result<Value, ControlError> {
        let url = self.url(path);
        debug!("engine GET {url}");
        let response = self
            .http
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| upstream_transport_error(&url, &err))?;
        decode_response(response).await
    }

    async fn post_json(
        &self,
        path: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, ControlError> {
        let url = self.url(path);
        debug!("engine POST {url}");
        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|err| upstream_transport_error(&url, &err))?;
        decode_response(response).await
    }

    /// Readiness: true only on a 2xx from `/system_stats`.
    pub async fn is_reachable(&self) -> bool {
        let url = self.url("/system_stats");
        match self
            .http
            .get(&url)
            .timeout(REACHABILITY_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn object_info(&self, deep: bool) -> Result<Value, ControlError> {
        let timeout = if deep {
            OBJECT_INFO_DEEP_TIMEOUT
        } else {
            OBJECT_INFO_FAST_TIMEOUT
        };
        self.get_json("/object_info", timeout).await
    }

    /// Probe the manager route prefixes in order; returns the first path that
    /// answered 2xx, along with its version payload.
    pub async fn probe_manager_endpoint(&self) -> Option<(String, Value)> {
        for path in MANAGER_PROBE_PATHS {
            if let Ok(value) = self.get_json(path, PROBE_TIMEOUT).await {
                return Some((path.to_string(), value));
            }
        }
        None
    }

    pub async fn queue_status(&self) -> Result<QueueStatus, ControlError> {
        let value = self
            .get_json("/v2/manager/queue/status", PROBE_TIMEOUT)
            .await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    pub async fn queue_start(&self) -> Result<Value, ControlError> {
        self.get_json("/v2/manager/queue/start", MUTATION_TIMEOUT)
            .await
    }

    pub async fn queue_batch(&self, payload: &Value) -> Result<Value, ControlError> {
        self.post_json("/v2/manager/queue/batch", payload, MUTATION_TIMEOUT)
            .await
    }

    /// In-process restart; the engine answers before going down.
    pub async fn reboot(&self) -> Result<Value, ControlError> {
        self.get_json("/v2/manager/reboot", MUTATION_TIMEOUT).await
    }

    /// Engine-level snapshot, best effort.
    pub async fn snapshot_save(&self) -> Result<Value, ControlError> {
        self.get_json("/v2/snapshot/save", MUTATION_TIMEOUT).await
    }

    pub async fn catalog(&self, mode: &str, skip_update: bool) -> Result<Value, ControlError> {
        self.get_json(
            &format!(
                "/v2/customnode/getlist?mode={mode}&skip_update={}",
                if skip_update { "true" } else { "false" }
            ),
            OBJECT_INFO_DEEP_TIMEOUT,
        )
        .await
    }
}

async fn decode_response(response: reqwest::Response) -> Result<Value, ControlError> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        let snippet: String = body.chars().take(BODY_SNIPPET_LIMIT).collect();
        return Err(ControlError::upstream(status.as_u16(), &snippet));
    }
    if body.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
}

fn upstream_transport_error(url: &str, err: &reqwest::Error) -> ControlError {
    ControlError::new(
        modusnap_common::ErrorKind::BackendUnreachable,
        format!("engine request failed: {url}: {err}"),
    )
}
