//! RPC surface of the control plane
//!
//! One route group per concern, merged in `server.rs`. Handlers resolve the
//! backend per request and fail fast with the structured taxonomy error when
//! no valid backend exists. Authentication is a static engine-issued API key
//! in the `Authorization: Bearer` header; the surface stays open while the
//! keystore is empty so a first key can be created.

use crate::catalog;
use crate::compat_sets;
use crate::fixes;
use crate::locator::BackendLocation;
use crate::orchestrator::{self, StartRequest};
use crate::server::AppState;
use crate::tx_engine::{PlanMode, TxEngine};
use axum::{
    extract::{Query, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use modusnap_common::{
    CatalogItem, ControlError, ErrorKind, IssueId, KeyStore, SessionMode, SessionScope,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

type AppStateArc = Arc<AppState>;
type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// Error mapping
// ============================================================================

pub struct ApiError(pub ControlError);

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(ControlError::from(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::BackendDirNotFound | ErrorKind::VenvMissing => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::BackendUnreachable | ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidArg => StatusCode::BAD_REQUEST,
            ErrorKind::PolicyViolation => StatusCode::FORBIDDEN,
            ErrorKind::QueueTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("request failed: {}", self.0);
        }
        (status, Json(json!({ "ok": false, "error": self.0 }))).into_response()
    }
}

// ============================================================================
// Authentication
// ============================================================================

pub async fn require_api_key(
    State(state): State<AppStateArc>,
    request: Request,
    next: Next,
) -> Response {
    // Without a backend there is no keystore; the surface stays open so the
    // locator error can reach the caller.
    let store = match state.locator.resolve() {
        Ok(location) => KeyStore::new(location.api_keys_path()),
        Err(_) => return next.run(request).await,
    };
    if store.is_empty() {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or("");
    if store.verify(presented) {
        return next.run(request).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "ok": false, "error": { "kind": "INVALID_ARG", "message": "missing or revoked API key" } })),
    )
        .into_response()
}

// ============================================================================
// Backend routes
// ============================================================================

pub fn backend_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/api/backend/status", get(backend_status))
        .route("/api/backend/logs", get(backend_logs))
}

async fn backend_status(State(state): State<AppStateArc>) -> ApiResult<Value> {
    let location = state.locator.resolve()?;
    let up = state.engine.is_reachable().await;
    Ok(Json(json!({
        "up": up,
        "dir": location.backend_dir.display().to_string(),
    })))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    lines: Option<usize>,
}

async fn backend_logs(
    State(state): State<AppStateArc>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Value> {
    let location = state.locator.resolve()?;
    let lines = query.lines.unwrap_or(100).clamp(20, 500);
    let backend_up = state.engine.is_reachable().await;
    Ok(Json(json!({
        "backendUp": backend_up,
        "comfyLogPath": location.comfy_log.display().to_string(),
        "restartLogPath": location.restart_log.display().to_string(),
        "comfyLogTail": read_tail_lines(&location.comfy_log, lines),
        "restartLogTail": read_tail_lines(&location.restart_log, lines),
    })))
}

fn read_tail_lines(path: &std::path::Path, lines: usize) -> String {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let all: Vec<&str> = contents.lines().collect();
            let start = all.len().saturating_sub(lines);
            all[start..].join("\n")
        }
        Err(_) => String::new(),
    }
}

// ============================================================================
// Environment transaction routes
// ============================================================================

pub fn env_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/api/env/status", get(env_status))
        .route("/api/env/plan", post(env_plan))
        .route("/api/env/apply", post(env_apply))
        .route("/api/env/rollback", post(env_rollback))
        .route("/api/env/list", get(env_list))
        .route("/api/env/get", post(env_get))
}

async fn env_status(State(state): State<AppStateArc>) -> ApiResult<Value> {
    let location = state.locator.resolve()?;
    let store = state.tx_store(&location).await;
    let latest = store.latest();
    // Last verification wins: the newest transaction, else the compat set.
    let (pip_healthy, pip_check_output) = match &latest {
        Some(tx) if tx.pip_healthy.is_some() => {
            (tx.pip_healthy, tx.pip_check_output.clone())
        }
        _ => compat_sets::load_current(&location)
            .map(|set| (Some(set.pip_healthy), Some(set.pip_check_output)))
            .unwrap_or((None, None)),
    };
    Ok(Json(json!({
        "ok": true,
        "backendDir": location.backend_dir.display().to_string(),
        "venvExists": location.venv_exists(),
        "pipHealthy": pip_healthy,
        "pipCheckOutput": pip_check_output,
        "transactions": store.count(),
        "latestTransaction": latest.map(|tx| tx.summary()),
    })))
}

#[derive(Debug, Deserialize)]
struct PlanRequest {
    mode: String,
    #[serde(default)]
    packages: Vec<String>,
    #[serde(default)]
    policies: Vec<String>,
}

async fn env_plan(
    State(state): State<AppStateArc>,
    Json(request): Json<PlanRequest>,
) -> ApiResult<Value> {
    let location = state.locator.resolve()?;
    let mode = PlanMode::parse(&request.mode)
        .ok_or_else(|| ControlError::invalid_arg(format!("unknown mode '{}'", request.mode)))?;
    let store = state.tx_store(&location).await;
    let engine = TxEngine::new(location, store);
    let tx = engine
        .create_plan(mode, &request.packages, &request.policies, state.config.tier)
        .await?;
    Ok(Json(json!({ "ok": true, "transaction": tx })))
}

#[derive(Debug, Deserialize)]
struct IdRequest {
    id: String,
}

impl IdRequest {
    fn validated(self) -> Result<String, ControlError> {
        let id = self.id.trim().to_string();
        if id.is_empty() {
            return Err(ControlError::invalid_arg("empty id"));
        }
        Ok(id)
    }
}

async fn env_apply(
    State(state): State<AppStateArc>,
    Json(request): Json<IdRequest>,
) -> ApiResult<Value> {
    let id = request.validated()?;
    let location = state.locator.resolve()?;
    let store = state.tx_store(&location).await;
    let engine = TxEngine::new(location, store);
    let _guard = state.venv_lock.lock().await;
    let tx = engine.apply(&id).await?;
    Ok(Json(json!({ "ok": tx.status == modusnap_common::TxStatus::Succeeded, "transaction": tx })))
}

async fn env_rollback(
    State(state): State<AppStateArc>,
    Json(request): Json<IdRequest>,
) -> ApiResult<Value> {
    let id = request.validated()?;
    let location = state.locator.resolve()?;
    let store = state.tx_store(&location).await;
    let engine = TxEngine::new(location, store);
    let _guard = state.venv_lock.lock().await;
    let tx = engine.rollback(&id).await?;
    Ok(Json(json!({ "ok": tx.status == modusnap_common::TxStatus::RolledBack, "transaction": tx })))
}

async fn env_list(State(state): State<AppStateArc>) -> ApiResult<Value> {
    let location = state.locator.resolve()?;
    let store = state.tx_store(&location).await;
    Ok(Json(json!(store.list())))
}

async fn env_get(
    State(state): State<AppStateArc>,
    Json(request): Json<IdRequest>,
) -> ApiResult<Value> {
    let id = request.validated()?;
    let location = state.locator.resolve()?;
    let store = state.tx_store(&location).await;
    let tx = store
        .get(&id)
        .ok_or_else(|| ControlError::not_found(format!("unknown transaction '{id}'")))?;
    Ok(Json(json!(tx)))
}

// ============================================================================
// Diagnostics routes
// ============================================================================

pub fn diagnostics_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/api/diagnostics/status", get(diagnostics_status))
        .route("/api/diagnostics/fix", post(diagnostics_fix))
}

#[derive(Debug, Deserialize)]
struct DiagnosticsQuery {
    #[serde(default)]
    deep: Option<u8>,
}

async fn diagnostics_status(
    State(state): State<AppStateArc>,
    Query(query): Query<DiagnosticsQuery>,
) -> ApiResult<Value> {
    let location = state.locator.resolve()?;
    let deep = query.deep == Some(1);
    let report = state
        .diagnostics
        .run(&state.engine, &location, deep)
        .await;
    Ok(Json(json!(report)))
}

#[derive(Debug, Deserialize)]
struct FixRequest {
    #[serde(rename = "issueId")]
    issue_id: String,
}

async fn diagnostics_fix(
    State(state): State<AppStateArc>,
    Json(request): Json<FixRequest>,
) -> ApiResult<Value> {
    let issue = IssueId::parse(&request.issue_id).ok_or_else(|| {
        ControlError::invalid_arg(format!("unknown issue id '{}'", request.issue_id))
    })?;
    let outcome = fixes::apply_fix(&state, issue).await?;
    Ok(Json(json!(outcome)))
}

// ============================================================================
// Manager routes
// ============================================================================

pub fn manager_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/api/manager/status", get(manager_status))
        .route("/api/manager/catalog", get(manager_catalog))
        .route("/api/manager/batch", post(manager_batch))
        .route(
            "/api/manager/catalog/compatibility",
            get(compatibility_get).post(compatibility_post),
        )
        .route("/api/manager/preflight", post(manager_preflight))
        .route("/api/manager/size-estimate", post(manager_size_estimate))
        .route("/api/manager/install", post(manager_install))
        .route("/api/manager/sessions", get(manager_sessions))
        .route("/api/manager/session", post(manager_session))
        .route("/api/manager/session/cancel", post(manager_session_cancel))
}

async fn manager_status(State(state): State<AppStateArc>) -> ApiResult<Value> {
    let location = state.locator.resolve()?;
    let backend_up = state.engine.is_reachable().await;
    let manager_routes_reachable = if backend_up {
        state.engine.probe_manager_endpoint().await.is_some()
    } else {
        false
    };
    let node_count = if backend_up {
        match state.engine.object_info(false).await {
            Ok(Value::Object(map)) => map.len(),
            _ => 0,
        }
    } else {
        0
    };
    Ok(Json(json!({
        "backendUp": backend_up,
        "managerRoutesReachable": manager_routes_reachable,
        "hardwareProfile": location.hardware_profile().token,
        "nodeCount": node_count,
    })))
}

#[derive(Debug, Deserialize)]
struct CatalogQuery {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    skip_update: Option<String>,
}

async fn manager_catalog(
    State(state): State<AppStateArc>,
    Query(query): Query<CatalogQuery>,
) -> ApiResult<Value> {
    state.locator.resolve()?;
    let mode = query.mode.as_deref().unwrap_or("cache");
    let skip_update = query.skip_update.as_deref() != Some("false");
    let payload = state.engine.catalog(mode, skip_update).await?;
    Ok(Json(payload))
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    mode: String,
    #[serde(default)]
    items: Vec<CatalogItem>,
    #[serde(default)]
    item: Option<CatalogItem>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default, rename = "sourceMode")]
    source_mode: Option<String>,
}

async fn manager_batch(
    State(state): State<AppStateArc>,
    Json(request): Json<BatchRequest>,
) -> ApiResult<Value> {
    state.locator.resolve()?;
    if request.mode.trim().is_empty() {
        return Err(ControlError::invalid_arg("missing mode").into());
    }

    let mut items = request.items;
    if let Some(item) = request.item {
        items.push(item);
    }
    if items.is_empty() {
        return Err(ControlError::invalid_arg("no items provided").into());
    }

    let action = orchestrator::map_action(&request.mode).to_string();
    let (submittable, dropped) = orchestrator::classify_items(items);
    let skipped: Vec<Value> = dropped
        .iter()
        .map(|(item, reason)| json!({ "key": item.key(), "reason": reason }))
        .collect();
    if submittable.is_empty() {
        return Ok(Json(json!({
            "ok": false,
            "skipped": skipped,
            "queueStartStatus": Value::Null,
        })));
    }

    let batch_id = uuid::Uuid::new_v4().to_string();
    let payload = orchestrator::batch_payload(&batch_id, &action, &submittable);
    info!(
        "submitting batch {batch_id}: {} item(s) as '{action}' (channel: {:?}, source: {:?})",
        submittable.len(),
        request.channel,
        request.source_mode
    );
    let mut response = state.engine.queue_batch(&payload).await?;

    let queue_start_status = match state.engine.queue_start().await {
        Ok(value) => value,
        Err(err) => {
            warn!("queue start failed after batch {batch_id}: {err}");
            Value::String(format!("queue start failed: {err}"))
        }
    };

    if let Value::Object(map) = &mut response {
        map.insert("queueStartStatus".to_string(), queue_start_status);
        map.insert("skipped".to_string(), Value::Array(skipped));
        map.entry("batch_id".to_string())
            .or_insert(Value::String(batch_id));
        Ok(Json(Value::Object(std::mem::take(map))))
    } else {
        Ok(Json(json!({
            "engineResponse": response,
            "batch_id": batch_id,
            "queueStartStatus": queue_start_status,
            "skipped": skipped,
        })))
    }
}

async fn compatibility_get(State(state): State<AppStateArc>) -> ApiResult<Value> {
    let location = state.locator.resolve()?;
    Ok(Json(json!({
        "current": compat_sets::load_current(&location),
        "history": compat_sets::load_history(&location),
    })))
}

#[derive(Debug, Deserialize)]
struct ItemsRequest {
    #[serde(default)]
    items: Vec<CatalogItem>,
}

async fn compatibility_post(
    State(state): State<AppStateArc>,
    Json(request): Json<ItemsRequest>,
) -> ApiResult<Value> {
    let location = state.locator.resolve()?;
    let _guard = state.venv_lock.lock().await;
    let outcome = compat_sets::build(&location, &request.items).await?;
    Ok(Json(json!({
        "compatibilitySet": outcome.set,
        "steps": outcome.steps,
        "autoHealed": outcome.auto_healed,
        "removedPackages": outcome.removed_packages,
    })))
}

async fn manager_preflight(
    State(state): State<AppStateArc>,
    Json(request): Json<ItemsRequest>,
) -> ApiResult<Value> {
    let location = state.locator.resolve()?;
    let profile = location.hardware_profile();
    let pip_healthy = compat_sets::load_current(&location).map(|set| set.pip_healthy);
    let report = crate::auditor::preflight(&location, &request.items, &profile, pip_healthy)?;
    Ok(Json(json!(report)))
}

async fn manager_size_estimate(
    State(state): State<AppStateArc>,
    Json(request): Json<ItemsRequest>,
) -> ApiResult<Value> {
    state.locator.resolve()?;
    Ok(Json(json!(catalog::size_estimate(&request.items))))
}

#[derive(Debug, Deserialize)]
struct InstallRequest {
    mode: String,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    items: Vec<CatalogItem>,
}

async fn manager_install(
    State(state): State<AppStateArc>,
    Json(request): Json<InstallRequest>,
) -> ApiResult<Value> {
    let mode = match request.mode.as_str() {
        "install" => SessionMode::Install,
        "uninstall" => SessionMode::Uninstall,
        other => {
            return Err(ControlError::invalid_arg(format!("unknown mode '{other}'")).into());
        }
    };
    let scope = match request.scope.as_deref() {
        None | Some("selected") => SessionScope::Selected,
        Some("allVisible") => SessionScope::AllVisible,
        Some(other) => {
            return Err(ControlError::invalid_arg(format!("unknown scope '{other}'")).into());
        }
    };
    let session = orchestrator::start_session(
        state.clone(),
        StartRequest {
            mode,
            scope,
            items: request.items,
        },
    )
    .await?;
    Ok(Json(json!({ "ok": true, "session": session })))
}

async fn manager_sessions(State(state): State<AppStateArc>) -> ApiResult<Value> {
    Ok(Json(json!(state.sessions.list().await)))
}

async fn manager_session(
    State(state): State<AppStateArc>,
    Json(request): Json<IdRequest>,
) -> ApiResult<Value> {
    let id = request.validated()?;
    let handle = state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| ControlError::not_found(format!("unknown session '{id}'")))?;
    Ok(Json(json!(handle.snapshot().await)))
}

async fn manager_session_cancel(
    State(state): State<AppStateArc>,
    Json(request): Json<IdRequest>,
) -> ApiResult<Value> {
    let id = request.validated()?;
    let handle = state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| ControlError::not_found(format!("unknown session '{id}'")))?;
    handle.request_cancel();
    Ok(Json(json!({ "ok": true })))
}

// ============================================================================
// API key routes
// ============================================================================

pub fn key_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/api/keys/create", post(keys_create))
        .route("/api/keys/list", get(keys_list))
        .route("/api/keys/revoke", post(keys_revoke))
}

#[derive(Debug, Deserialize)]
struct KeyCreateRequest {
    #[serde(default)]
    label: String,
}

fn key_store(location: &BackendLocation) -> KeyStore {
    KeyStore::new(location.api_keys_path())
}

async fn keys_create(
    State(state): State<AppStateArc>,
    Json(request): Json<KeyCreateRequest>,
) -> ApiResult<Value> {
    let location = state.locator.resolve()?;
    if request.label.trim().is_empty() {
        return Err(ControlError::invalid_arg("missing label").into());
    }
    let key = key_store(&location).create(request.label.trim())?;
    Ok(Json(json!({ "ok": true, "key": key })))
}

async fn keys_list(State(state): State<AppStateArc>) -> ApiResult<Value> {
    let location = state.locator.resolve()?;
    Ok(Json(json!(key_store(&location).list())))
}

async fn keys_revoke(
    State(state): State<AppStateArc>,
    Json(request): Json<IdRequest>,
) -> ApiResult<Value> {
    let id = request.validated()?;
    let location = state.locator.resolve()?;
    let revoked = key_store(&location).revoke(&id)?;
    if !revoked {
        return Err(ControlError::not_found(format!("unknown key '{id}'")).into());
    }
    Ok(Json(json!({ "ok": true })))
}
