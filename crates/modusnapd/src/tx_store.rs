//! Persistent transaction log
//!
//! Single JSON file `{transactions: [...]}` under the backend user directory,
//! capped at the 200 most recent entries. Writes are replace-by-rename;
//! losing the newest write on a crash is tolerated, so reads treat a
//! truncated or unparsable file as empty.

use anyhow::{Context, Result};
use modusnap_common::{EnvTx, EnvTxSummary};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Retention bound on stored transactions.
pub const MAX_TRANSACTIONS: usize = 200;

#[derive(Debug, Serialize, Deserialize, Default)]
struct TxFile {
    transactions: Vec<EnvTx>,
}

/// Single-writer store; the internal mutex serializes mutations while reads
/// go straight to disk.
#[derive(Debug)]
pub struct TxStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TxStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Vec<EnvTx> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        serde_json::from_str::<TxFile>(&raw)
            .map(|file| file.transactions)
            .unwrap_or_default()
    }

    fn save(&self, mut transactions: Vec<EnvTx>) -> Result<()> {
        if transactions.len() > MAX_TRANSACTIONS {
            let drop = transactions.len() - MAX_TRANSACTIONS;
            transactions.drain(..drop);
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&TxFile { transactions })
            .context("failed to serialize transaction log")?;
        std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// Append a new transaction.
    pub async fn create(&self, tx: EnvTx) -> Result<EnvTx> {
        let _guard = self.write_lock.lock().await;
        let mut transactions = self.load();
        transactions.push(tx.clone());
        self.save(transactions)?;
        Ok(tx)
    }

    /// Persist the current state of an existing transaction.
    pub async fn update(&self, tx: &EnvTx) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut transactions = self.load();
        match transactions.iter_mut().find(|t| t.id == tx.id) {
            Some(slot) => *slot = tx.clone(),
            None => transactions.push(tx.clone()),
        }
        self.save(transactions)
    }

    pub fn get(&self, id: &str) -> Option<EnvTx> {
        self.load().into_iter().find(|tx| tx.id == id)
    }

    pub fn list(&self) -> Vec<EnvTxSummary> {
        self.load().iter().map(EnvTx::summary).collect()
    }

    pub fn latest(&self) -> Option<EnvTx> {
        self.load().into_iter().next_back()
    }

    pub fn count(&self) -> usize {
        self.load().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modusnap_common::{TxKind, TxStatus};

    fn store() -> (tempfile::TempDir, TxStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = TxStore::new(tmp.path().join("transactions.json"));
        (tmp, store)
    }

    #[tokio::test]
    async fn create_get_update_roundtrip() {
        let (_tmp, store) = store();
        let tx = EnvTx::new(TxKind::Repair, vec![], vec!["python -m pip check".into()]);
        let id = tx.id.clone();
        store.create(tx).await.unwrap();

        let mut loaded = store.get(&id).unwrap();
        assert_eq!(loaded.status, TxStatus::Planned);

        loaded.status = TxStatus::Running;
        store.update(&loaded).await.unwrap();
        assert_eq!(store.get(&id).unwrap().status, TxStatus::Running);
        assert_eq!(store.latest().unwrap().id, id);
    }

    #[tokio::test]
    async fn retention_keeps_most_recent_200_in_order() {
        let (_tmp, store) = store();
        let mut ids = Vec::new();
        for _ in 0..230 {
            let tx = EnvTx::new(TxKind::Install, vec![], vec![]);
            ids.push(tx.id.clone());
            store.create(tx).await.unwrap();
        }
        assert_eq!(store.count(), MAX_TRANSACTIONS);
        let summaries = store.list();
        // Oldest 30 evicted, creation order preserved.
        assert_eq!(summaries.first().unwrap().id, ids[30]);
        assert_eq!(summaries.last().unwrap().id, ids[229]);
    }

    #[tokio::test]
    async fn small_store_keeps_everything() {
        let (_tmp, store) = store();
        for _ in 0..5 {
            store
                .create(EnvTx::new(TxKind::Install, vec![], vec![]))
                .await
                .unwrap();
        }
        assert_eq!(store.count(), 5);
    }

    #[tokio::test]
    async fn corrupt_file_reads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("transactions.json");
        std::fs::write(&path, "{\"transactions\": [{\"truncated").unwrap();
        let store = TxStore::new(&path);
        assert_eq!(store.count(), 0);
        assert!(store.latest().is_none());

        // The store recovers on the next write.
        store
            .create(EnvTx::new(TxKind::Repair, vec![], vec![]))
            .await
            .unwrap();
        assert_eq!(store.count(), 1);
    }
}
