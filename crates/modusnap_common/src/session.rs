//! Install session records
//!
//! A session is the long-running composition of preflight, compatibility-set
//! maintenance, chunked queue submission, drain wait, reboot cycle and
//! post-install heal. Sessions are observable while running and kept in a
//! capped in-memory registry afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Install,
    Uninstall,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Uninstall => "uninstall",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionScope {
    Selected,
    AllVisible,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Queued,
    Done,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionItem {
    pub key: String,
    pub title: String,
    pub selected: bool,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallSession {
    pub id: String,
    pub mode: SessionMode,
    pub scope: SessionScope,
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub completed: usize,
    pub remaining: usize,
    pub current_chunk: usize,
    pub total_chunks: usize,
    pub items: Vec<SessionItem>,
    pub logs: Vec<String>,
    pub running: bool,
    pub canceled: bool,
    /// Terminal verdict once `running` drops: `succeeded`, `failed`, or
    /// `canceled`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

impl InstallSession {
    pub fn new(mode: SessionMode, scope: SessionScope) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mode,
            scope,
            started_at: Utc::now(),
            total: 0,
            completed: 0,
            remaining: 0,
            current_chunk: 0,
            total_chunks: 0,
            items: Vec::new(),
            logs: Vec::new(),
            running: true,
            canceled: false,
            outcome: None,
        }
    }

    pub fn log(&mut self, line: impl Into<String>) {
        let stamp = Utc::now().format("%H:%M:%S");
        self.logs.push(format!("[{stamp}] {}", line.into()));
    }

    /// Recompute `completed`/`remaining` from item states.
    pub fn refresh_counts(&mut self) {
        let settled = self
            .items
            .iter()
            .filter(|item| {
                matches!(
                    item.status,
                    ItemStatus::Done | ItemStatus::Failed | ItemStatus::Skipped
                )
            })
            .count();
        self.completed = settled;
        self.remaining = self.total.saturating_sub(settled);
    }
}

/// Chunk size rule: large batches shrink the chunk so queue submissions stay
/// responsive.
pub fn chunk_size_for(total: usize) -> usize {
    if total > 200 {
        20
    } else {
        40
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_thresholds() {
        assert_eq!(chunk_size_for(0), 40);
        assert_eq!(chunk_size_for(200), 40);
        assert_eq!(chunk_size_for(201), 20);
        assert_eq!(chunk_size_for(250), 20);
    }

    #[test]
    fn e5_chunk_count_for_250_items() {
        let total = 250usize;
        let size = chunk_size_for(total);
        assert_eq!(size, 20);
        assert_eq!(total.div_ceil(size), 13);
    }

    #[test]
    fn refresh_counts_tracks_settled_items() {
        let mut session = InstallSession::new(SessionMode::Install, SessionScope::Selected);
        session.total = 3;
        session.items = vec![
            SessionItem {
                key: "a".into(),
                title: "a".into(),
                selected: true,
                status: ItemStatus::Done,
                details: None,
            },
            SessionItem {
                key: "b".into(),
                title: "b".into(),
                selected: true,
                status: ItemStatus::Queued,
                details: None,
            },
            SessionItem {
                key: "c".into(),
                title: "c".into(),
                selected: true,
                status: ItemStatus::Skipped,
                details: Some("removed by compatibility preflight".into()),
            },
        ];
        session.refresh_counts();
        assert_eq!(session.completed, 2);
        assert_eq!(session.remaining, 1);
    }
}
