//! Install session tests against a mock engine
//!
//! A small axum server stands in for the engine: it records every queue
//! batch and queue-start call so the chunking and skip semantics can be
//! asserted end to end, with a scripted virtualenv backing the
//! compatibility-set build.

use axum::{extract::State, routing::get, routing::post, Json, Router};
use modusnap_common::{CatalogItem, InstallType, ItemStatus, SessionMode, SessionScope};
use modusnapd::config::DaemonConfig;
use modusnapd::orchestrator::{self, StartRequest};
use modusnapd::server::AppState;
use serde_json::{json, Value};
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MockEngine {
    batches: Mutex<Vec<Value>>,
    queue_starts: AtomicUsize,
    reboots: AtomicUsize,
}

async fn mock_batch(
    State(engine): State<Arc<MockEngine>>,
    Json(payload): Json<Value>,
) -> Json<Value> {
    engine.batches.lock().unwrap().push(payload);
    Json(json!({ "ok": true }))
}

async fn mock_queue_start(State(engine): State<Arc<MockEngine>>) -> Json<Value> {
    engine.queue_starts.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "status": "started" }))
}

async fn mock_reboot(State(engine): State<Arc<MockEngine>>) -> Json<Value> {
    engine.reboots.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "ok": true }))
}

async fn spawn_mock_engine() -> (Arc<MockEngine>, String) {
    let engine = Arc::new(MockEngine::default());
    let app = Router::new()
        .route("/system_stats", get(|| async { Json(json!({ "system": {} })) }))
        .route("/object_info", get(|| async { Json(json!({})) }))
        .route("/v2/manager/version", get(|| async { Json(json!("3.0")) }))
        .route("/v2/manager/queue/status", get(|| async {
            Json(json!({
                "total_count": 0, "done_count": 0, "in_progress_count": 0,
                "pending_count": 0, "is_processing": false,
            }))
        }))
        .route("/v2/manager/queue/batch", post(mock_batch))
        .route("/v2/manager/queue/start", get(mock_queue_start))
        .route("/v2/manager/reboot", get(mock_reboot))
        .route("/v2/snapshot/save", get(|| async { Json(json!({ "ok": true })) }))
        .with_state(engine.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (engine, format!("http://{addr}"))
}

fn scripted_backend(hardware_token: &str) -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    std::fs::write(dir.join("main.py"), "").unwrap();
    std::fs::write(dir.join("requirements.txt"), "torch\n").unwrap();
    std::fs::write(dir.join("manager_requirements.txt"), "").unwrap();
    let user = dir.join("user");
    std::fs::create_dir_all(&user).unwrap();
    std::fs::write(user.join("hardware_profile.txt"), hardware_token).unwrap();
    let bin = dir.join("venv").join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let python = bin.join("python");
    std::fs::write(&python, "#!/bin/sh\necho ok\n").unwrap();
    std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();
    tmp
}

fn app_state(backend_dir: &std::path::Path, engine_url: String) -> Arc<AppState> {
    Arc::new(AppState::new(DaemonConfig {
        backend_dir_override: Some(backend_dir.display().to_string()),
        engine_url,
        listen: "127.0.0.1:0".to_string(),
        tier: modusnap_common::Tier::Free,
    }))
}

fn cnr_item(index: usize) -> CatalogItem {
    CatalogItem {
        ui_key: Some(format!("key-{index}")),
        id: Some(format!("pack-{index}")),
        title: Some(format!("Pack {index}")),
        install_type: InstallType::Cnr,
        ..Default::default()
    }
}

async fn wait_for_completion(state: &Arc<AppState>, session_id: &str) -> modusnap_common::InstallSession {
    for _ in 0..300 {
        let handle = state.sessions.get(session_id).await.unwrap();
        let snapshot = handle.snapshot().await;
        if !snapshot.running {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("session {session_id} did not finish in time");
}

#[tokio::test]
async fn session_chunks_250_items_into_13_batches() {
    let (mock, url) = spawn_mock_engine().await;
    let tmp = scripted_backend("linux-x86_64-nvidia:true-rocm:false");
    let state = app_state(tmp.path(), url);

    let items: Vec<CatalogItem> = (0..250).map(cnr_item).collect();
    let session = orchestrator::start_session(
        state.clone(),
        StartRequest {
            mode: SessionMode::Install,
            scope: SessionScope::AllVisible,
            items,
        },
    )
    .await
    .unwrap();

    let done = wait_for_completion(&state, &session.id).await;
    assert_eq!(done.outcome.as_deref(), Some("succeeded"));
    assert_eq!(done.total_chunks, 13);

    let batches = mock.batches.lock().unwrap();
    assert_eq!(batches.len(), 13);
    assert_eq!(mock.queue_starts.load(Ordering::SeqCst), 13);
    assert_eq!(mock.reboots.load(Ordering::SeqCst), 1);

    // Chunk size rule: 250 items over 13 batches of at most 20.
    for batch in batches.iter() {
        let items = batch["install"].as_array().unwrap();
        assert!(items.len() <= 20);
    }
    let submitted: usize = batches
        .iter()
        .map(|b| b["install"].as_array().unwrap().len())
        .sum();
    assert_eq!(submitted, 250);

    // Every item settled as done.
    assert!(done.items.iter().all(|item| item.status == ItemStatus::Done));
}

#[tokio::test]
async fn blocked_items_never_reach_the_queue() {
    let (mock, url) = spawn_mock_engine().await;
    // No NVIDIA hardware: cuda-only packs must be blocked in preflight.
    let tmp = scripted_backend("darwin-arm64-nvidia:false-rocm:false");
    let state = app_state(tmp.path(), url);

    let mut blocked = cnr_item(0);
    blocked.description = Some("requires cuda".to_string());
    let plain = cnr_item(1);

    let session = orchestrator::start_session(
        state.clone(),
        StartRequest {
            mode: SessionMode::Install,
            scope: SessionScope::Selected,
            items: vec![blocked, plain],
        },
    )
    .await
    .unwrap();
    let done = wait_for_completion(&state, &session.id).await;
    assert_eq!(done.outcome.as_deref(), Some("succeeded"));

    let blocked_item = done.items.iter().find(|i| i.key == "key-0").unwrap();
    assert_eq!(blocked_item.status, ItemStatus::Skipped);
    assert_eq!(
        blocked_item.details.as_deref(),
        Some("removed by compatibility preflight")
    );

    let batches = mock.batches.lock().unwrap();
    let serialized = serde_json::to_string(&*batches).unwrap();
    assert!(!serialized.contains("key-0"));
    assert!(serialized.contains("key-1"));
}

#[tokio::test]
async fn already_installed_items_are_skipped_up_front() {
    let (mock, url) = spawn_mock_engine().await;
    let tmp = scripted_backend("linux-x86_64-nvidia:true-rocm:false");
    let state = app_state(tmp.path(), url);

    let mut installed = cnr_item(0);
    installed.state = Some("enabled".to_string());
    let fresh = cnr_item(1);

    let session = orchestrator::start_session(
        state.clone(),
        StartRequest {
            mode: SessionMode::Install,
            scope: SessionScope::Selected,
            items: vec![installed, fresh],
        },
    )
    .await
    .unwrap();
    let done = wait_for_completion(&state, &session.id).await;

    let skipped = done.items.iter().find(|i| i.key == "key-0").unwrap();
    assert_eq!(skipped.status, ItemStatus::Skipped);
    assert!(skipped.details.as_deref().unwrap().contains("already installed"));

    let batches = mock.batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0]["install"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn all_items_blocked_fails_the_session() {
    let (mock, url) = spawn_mock_engine().await;
    let tmp = scripted_backend("linux-x86_64-nvidia:false-rocm:false");
    let state = app_state(tmp.path(), url);

    let mut item = cnr_item(0);
    item.description = Some("nvidia-only tensorrt required".to_string());

    let session = orchestrator::start_session(
        state.clone(),
        StartRequest {
            mode: SessionMode::Install,
            scope: SessionScope::Selected,
            items: vec![item],
        },
    )
    .await
    .unwrap();
    let done = wait_for_completion(&state, &session.id).await;
    assert_eq!(done.outcome.as_deref(), Some("failed"));
    assert!(mock.batches.lock().unwrap().is_empty());
}
