//! HTTP server wiring for modusnapd
//!
//! `AppState` is shared across handlers: the locator, the engine client, the
//! diagnostics cache, the session registry, and the single-writer mutex that
//! serializes virtualenv mutations per backend. Status and diagnostics
//! routes never take that lock.

use crate::config::DaemonConfig;
use crate::diagnostics::DiagnosticsEngine;
use crate::engine_client::EngineClient;
use crate::locator::{BackendLocation, BackendLocator};
use crate::orchestrator::SessionRegistry;
use crate::routes;
use crate::tx_store::TxStore;
use anyhow::Result;
use axum::Router;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct AppState {
    pub config: DaemonConfig,
    pub locator: BackendLocator,
    pub engine: EngineClient,
    pub diagnostics: DiagnosticsEngine,
    pub sessions: SessionRegistry,
    /// Write-exclusive guard for the virtualenv; one writer per backend.
    pub venv_lock: Mutex<()>,
    /// One transaction store per backend directory, so the single-writer
    /// discipline survives concurrent requests.
    tx_stores: Mutex<HashMap<PathBuf, Arc<TxStore>>>,
}

impl AppState {
    pub fn new(config: DaemonConfig) -> Self {
        let locator = BackendLocator::new(config.backend_dir_override.clone());
        let engine = EngineClient::new(&config.engine_url);
        Self {
            config,
            locator,
            engine,
            diagnostics: DiagnosticsEngine::default(),
            sessions: SessionRegistry::default(),
            venv_lock: Mutex::new(()),
            tx_stores: Mutex::new(HashMap::new()),
        }
    }

    pub async fn tx_store(&self, location: &BackendLocation) -> Arc<TxStore> {
        let mut stores = self.tx_stores.lock().await;
        stores
            .entry(location.backend_dir.clone())
            .or_insert_with(|| Arc::new(TxStore::new(location.transactions_path())))
            .clone()
    }
}

/// Assemble the full RPC router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::backend_routes())
        .merge(routes::env_routes())
        .merge(routes::diagnostics_routes())
        .merge(routes::manager_routes())
        .merge(routes::key_routes())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            routes::require_api_key,
        ))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Run the RPC surface until shutdown.
pub async fn run(state: AppState) -> Result<()> {
    let listen = state.config.listen.clone();
    let state = Arc::new(state);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!("control plane listening on http://{listen}");
    axum::serve(listener, app).await?;
    Ok(())
}
