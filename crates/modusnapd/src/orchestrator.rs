//! Install orchestration
//!
//! Long-running sessions that compose preflight, compatibility-set
//! maintenance, chunked queue submission, the drain wait, the reboot-ready
//! cycle, and the post-install heal. Cancellation is cooperative and checked
//! at chunk boundaries; chunks already handed to the engine run to
//! completion there.

use crate::auditor;
use crate::autoheal;
use crate::compat_sets;
use crate::locator::BackendLocation;
use crate::server::AppState;
use modusnap_common::{
    chunk_size_for, CatalogItem, ControlError, Decision, InstallSession, InstallType, ItemStatus,
    SessionItem, SessionMode, SessionScope,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Completed sessions kept for inspection.
const MAX_SESSIONS: usize = 32;
/// Floor for the queue drain deadline.
const DRAIN_FLOOR: Duration = Duration::from_secs(5 * 60);
/// Per-chunk allowance added to the drain deadline.
const DRAIN_PER_CHUNK: Duration = Duration::from_secs(45);
/// Reboot-to-ready deadline.
const READY_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Clone)]
pub struct SessionHandle {
    pub id: String,
    session: Arc<RwLock<InstallSession>>,
    cancel: Arc<AtomicBool>,
}

impl SessionHandle {
    pub async fn snapshot(&self) -> InstallSession {
        self.session.read().await.clone()
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// In-memory registry of running and recent sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<VecDeque<SessionHandle>>,
}

impl SessionRegistry {
    pub async fn register(&self, handle: SessionHandle) {
        let mut sessions = self.sessions.lock().await;
        sessions.push_back(handle);
        while sessions.len() > MAX_SESSIONS {
            sessions.pop_front();
        }
    }

    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .await
            .iter()
            .find(|handle| handle.id == id)
            .cloned()
    }

    pub async fn list(&self) -> Vec<InstallSession> {
        let handles: Vec<SessionHandle> =
            self.sessions.lock().await.iter().cloned().collect();
        let mut sessions = Vec::with_capacity(handles.len());
        for handle in handles.iter().rev() {
            sessions.push(handle.snapshot().await);
        }
        sessions
    }
}

/// Engine queue verbs: UI modes collapse onto the queue's action set.
pub fn map_action(mode: &str) -> &str {
    match mode {
        "enable" | "switch" | "try-install" => "install",
        "try-update" => "update",
        other => other,
    }
}

/// Normalize a chunk for submission: recover registry items without an id
/// into git clones where possible, drop items that cannot be addressed.
/// Returns the submittable items and the dropped ones with reasons.
pub fn classify_items(items: Vec<CatalogItem>) -> (Vec<CatalogItem>, Vec<(CatalogItem, String)>) {
    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    for mut item in items {
        match item.install_type {
            InstallType::Cnr => {
                if item.id.is_some() {
                    kept.push(item);
                } else if let Some(url) = item.recover_git_url() {
                    item.install_type = InstallType::GitClone;
                    item.repository = Some(url);
                    kept.push(item);
                } else {
                    dropped.push((
                        item,
                        "registry item without an id or a recoverable git url".to_string(),
                    ));
                }
            }
            InstallType::GitClone => {
                if item.repository.is_some() {
                    kept.push(item);
                } else if let Some(url) = item.recover_git_url() {
                    item.repository = Some(url);
                    kept.push(item);
                } else {
                    dropped.push((item, "git-clone item without a repository url".to_string()));
                }
            }
            InstallType::Unknown => kept.push(item),
        }
    }
    (kept, dropped)
}

/// Build the engine batch payload `{batch_id, <action>: items}`.
pub fn batch_payload(batch_id: &str, action: &str, items: &[CatalogItem]) -> Value {
    json!({
        "batch_id": batch_id,
        action: items,
    })
}

pub struct StartRequest {
    pub mode: SessionMode,
    pub scope: SessionScope,
    pub items: Vec<CatalogItem>,
}

/// Plan and launch a session; returns an immediate snapshot while the work
/// continues on a background task.
pub async fn start_session(
    state: Arc<AppState>,
    request: StartRequest,
) -> Result<InstallSession, ControlError> {
    let location = state.locator.resolve()?;
    if request.items.is_empty() {
        return Err(ControlError::invalid_arg("no items provided"));
    }

    let mut session = InstallSession::new(request.mode, request.scope);
    let mut candidates = Vec::new();
    for item in request.items {
        // Installed packs are skipped up front in install mode.
        if request.mode == SessionMode::Install && item.is_installed_state() {
            session.items.push(SessionItem {
                key: item.key(),
                title: item.display_title(),
                selected: true,
                status: ItemStatus::Skipped,
                details: Some(format!(
                    "already installed (state: {})",
                    item.state.as_deref().unwrap_or("unknown")
                )),
            });
            continue;
        }
        session.items.push(SessionItem {
            key: item.key(),
            title: item.display_title(),
            selected: true,
            status: ItemStatus::Pending,
            details: None,
        });
        candidates.push(item);
    }
    session.total = session.items.len();
    session.refresh_counts();
    session.log(format!(
        "session planned: {} candidates, {} skipped as installed",
        candidates.len(),
        session.total - candidates.len()
    ));

    let handle = SessionHandle {
        id: session.id.clone(),
        session: Arc::new(RwLock::new(session)),
        cancel: Arc::new(AtomicBool::new(false)),
    };
    state.sessions.register(handle.clone()).await;

    let snapshot = handle.snapshot().await;
    let task_state = state.clone();
    let task_handle = handle.clone();
    tokio::spawn(async move {
        run_session(task_state, task_handle, location, candidates).await;
    });
    Ok(snapshot)
}

async fn run_session(
    state: Arc<AppState>,
    handle: SessionHandle,
    location: BackendLocation,
    candidates: Vec<CatalogItem>,
) {
    let session = &handle.session;

    // Compatibility preflight removes blocked packs before anything touches
    // disk or the queue.
    let profile = location.hardware_profile();
    let audit = match auditor::audit_catalog(&location, &candidates, &profile) {
        Ok(audit) => audit,
        Err(err) => {
            warn!("preflight failed: {err:#}");
            finish(session, "failed", &format!("preflight failed: {err:#}")).await;
            return;
        }
    };

    let mut remaining = Vec::new();
    {
        let mut session = session.write().await;
        for (item, decision) in candidates.into_iter().zip(audit.decisions.iter()) {
            if decision.decision == Decision::Blocked {
                set_item(&mut session, &item.key(), ItemStatus::Skipped,
                    Some("removed by compatibility preflight".to_string()));
            } else {
                remaining.push(item);
            }
        }
        session.refresh_counts();
        session.log(format!(
            "preflight: {} blocked, {} to submit",
            audit.blocked,
            remaining.len()
        ));
    }

    if remaining.is_empty() {
        finish(session, "failed", "nothing left to install after preflight").await;
        return;
    }

    // Compatibility set: reuse the current one when fresh and verified.
    let reusable = compat_sets::load_current(&location)
        .map(|set| compat_sets::is_reusable(&set, &location))
        .unwrap_or(false);
    if !reusable {
        session.write().await.log("rebuilding compatibility set");
        let _guard = state.venv_lock.lock().await;
        match compat_sets::build(&location, &remaining).await {
            Ok(outcome) => {
                let mut session = session.write().await;
                session.log(format!(
                    "compatibility set {} (pip healthy: {}, auto-healed: {})",
                    outcome.set.lock_id, outcome.set.pip_healthy, outcome.auto_healed
                ));
                if !outcome.removed_packages.is_empty() {
                    session.log(format!(
                        "autoheal removed {} conflicting package(s): {}",
                        outcome.removed_packages.len(),
                        outcome.removed_packages.join(", ")
                    ));
                }
            }
            Err(err) => {
                finish(session, "failed", &format!("compatibility set build failed: {err:#}"))
                    .await;
                return;
            }
        }
    } else {
        session.write().await.log("reusing current compatibility set");
    }

    // Engine-level snapshot, best effort.
    match state.engine.snapshot_save().await {
        Ok(_) => session.write().await.log("engine snapshot saved"),
        Err(err) => session
            .write()
            .await
            .log(format!("engine snapshot skipped: {err}")),
    }

    // Chunked submission.
    let action = map_action(handle.snapshot().await.mode.as_str()).to_string();
    let chunk_size = chunk_size_for(remaining.len());
    let chunks: Vec<Vec<CatalogItem>> = remaining
        .chunks(chunk_size)
        .map(|chunk| chunk.to_vec())
        .collect();
    {
        let mut session = session.write().await;
        session.total_chunks = chunks.len();
        session.log(format!(
            "submitting {} item(s) in {} chunk(s) of up to {}",
            remaining.len(),
            chunks.len(),
            chunk_size
        ));
    }

    let session_id = handle.id.clone();
    for (index, chunk) in chunks.into_iter().enumerate() {
        if handle.cancel_requested() {
            let mut session = session.write().await;
            session.canceled = true;
            session.log("canceled: no further chunks will be submitted");
            finish_locked(&mut session, "canceled");
            return;
        }
        session.write().await.current_chunk = index + 1;

        let (submittable, skipped) = classify_items(chunk);
        {
            let mut session = session.write().await;
            for (item, reason) in &skipped {
                set_item(&mut session, &item.key(), ItemStatus::Skipped, Some(reason.clone()));
            }
        }
        if submittable.is_empty() {
            continue;
        }

        let batch_id = format!("{session_id}-{}", index + 1);
        let payload = batch_payload(&batch_id, &action, &submittable);
        match state.engine.queue_batch(&payload).await {
            Ok(_) => {
                if let Err(err) = state.engine.queue_start().await {
                    warn!("queue start after batch {batch_id} failed: {err}");
                }
                let mut session = session.write().await;
                for item in &submittable {
                    set_item(&mut session, &item.key(), ItemStatus::Queued, None);
                }
                session.refresh_counts();
            }
            Err(err) => {
                let mut session = session.write().await;
                session.log(format!("chunk {} submission failed: {err}", index + 1));
                for item in &submittable {
                    set_item(&mut session, &item.key(), ItemStatus::Failed,
                        Some(format!("batch submission failed: {err}")));
                }
                session.refresh_counts();
            }
        }
    }

    // Drain wait.
    let total_chunks = session.read().await.total_chunks as u32;
    let deadline = DRAIN_FLOOR.max(DRAIN_PER_CHUNK * total_chunks.max(1));
    session
        .write()
        .await
        .log(format!("waiting for queue drain (up to {}s)", deadline.as_secs()));
    if !wait_for_drain(&state, deadline).await {
        finish(
            session,
            "failed",
            &format!("queue drain exceeded {}s", deadline.as_secs()),
        )
        .await;
        return;
    }

    // Reboot and wait for readiness.
    session.write().await.log("rebooting engine");
    if let Err(err) = state.engine.reboot().await {
        session
            .write()
            .await
            .log(format!("reboot request failed: {err}"));
    }
    if !wait_for_ready(&state).await {
        finish(
            session,
            "failed",
            &format!("engine not ready within {}s of reboot", READY_TIMEOUT.as_secs()),
        )
        .await;
        return;
    }
    session.write().await.log("engine ready");

    // Post-install heal reconciles late-surfacing dependency drift.
    {
        let _guard = state.venv_lock.lock().await;
        let heal = autoheal::run_autoheal(&location).await;
        let mut session = session.write().await;
        session.log(format!(
            "post-install heal: healthy={}, {} package(s) removed",
            heal.healthy,
            heal.removed_packages.len()
        ));
    }

    {
        let mut session = session.write().await;
        for item in session.items.iter_mut() {
            if item.status == ItemStatus::Queued {
                item.status = ItemStatus::Done;
            }
        }
        session.refresh_counts();
        finish_locked(&mut session, "succeeded");
    }
    info!("install session {} completed", session_id);
}

async fn wait_for_drain(state: &AppState, deadline: Duration) -> bool {
    let started = tokio::time::Instant::now();
    loop {
        match state.engine.queue_status().await {
            Ok(status) if status.is_drained() => return true,
            Ok(_) => {}
            Err(err) => warn!("queue status poll failed: {err}"),
        }
        if started.elapsed() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn wait_for_ready(state: &AppState) -> bool {
    let started = tokio::time::Instant::now();
    loop {
        if state.engine.is_reachable().await
            && state.engine.probe_manager_endpoint().await.is_some()
        {
            return true;
        }
        if started.elapsed() >= READY_TIMEOUT {
            return false;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn set_item(
    session: &mut InstallSession,
    key: &str,
    status: ItemStatus,
    details: Option<String>,
) {
    if let Some(item) = session.items.iter_mut().find(|item| item.key == key) {
        item.status = status;
        if details.is_some() {
            item.details = details;
        }
    }
}

async fn finish(session: &Arc<RwLock<InstallSession>>, outcome: &str, message: &str) {
    let mut session = session.write().await;
    session.log(message);
    finish_locked(&mut session, outcome);
}

fn finish_locked(session: &mut InstallSession, outcome: &str) {
    session.running = false;
    session.outcome = Some(outcome.to_string());
    session.refresh_counts();
}
