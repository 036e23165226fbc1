//! Transactional environment mutation
//!
//! Plan, apply, verify, roll back. Steps execute strictly in order and are
//! persisted after every mutation so a crash leaves the transaction in its
//! last durable state. A failing package-manager step never aborts the
//! transaction mid-stream; the closing `pip check` decides the verdict.

use crate::locator::BackendLocation;
use crate::snapshots::SnapshotService;
use crate::subprocess::{self, INSTALL_TIMEOUT, PROBE_TIMEOUT};
use crate::tx_store::TxStore;
use modusnap_common::{
    evaluate_policy, sanitize_packages, ControlError, EnvTx, ErrorKind, Tier, TxKind, TxStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    Repair,
    Install,
}

impl PlanMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "repair" => Some(Self::Repair),
            "install" => Some(Self::Install),
            _ => None,
        }
    }
}

struct PlannedStep {
    display: String,
    args: Vec<String>,
    timeout: Duration,
    is_check: bool,
}

pub struct TxEngine {
    location: BackendLocation,
    store: Arc<TxStore>,
    snapshots: SnapshotService,
}

impl TxEngine {
    pub fn new(location: BackendLocation, store: Arc<TxStore>) -> Self {
        let snapshots = SnapshotService::for_backend(&location);
        Self {
            location,
            store,
            snapshots,
        }
    }

    /// Create a planned transaction. Package specifiers are sanitized; the
    /// policy gate runs before anything is persisted.
    pub async fn create_plan(
        &self,
        mode: PlanMode,
        packages: &[String],
        policies: &[String],
        tier: Tier,
    ) -> Result<EnvTx, ControlError> {
        let decision = evaluate_policy(tier, policies);
        if !decision.allowed {
            return Err(ControlError::new(
                ErrorKind::PolicyViolation,
                "requested packs are not permitted for the current tier",
            )
            .with_details(json!({ "violations": decision.violations })));
        }

        let requested = sanitize_packages(packages);
        let kind = match mode {
            PlanMode::Repair => TxKind::Repair,
            PlanMode::Install => TxKind::Install,
        };

        let mut plan_commands = vec![
            "python -m pip install -r requirements.txt".to_string(),
            "python -m pip install -r manager_requirements.txt".to_string(),
        ];
        if mode == PlanMode::Install && !requested.is_empty() {
            plan_commands.push(format!("python -m pip install {}", requested.join(" ")));
        }
        plan_commands.push("python -m pip check".to_string());

        let tx = EnvTx::new(kind, requested, plan_commands);
        info!("planned {:?} transaction {}", kind, tx.id);
        self.store.create(tx).await.map_err(ControlError::from)
    }

    /// Execute a planned (or previously failed) transaction.
    pub async fn apply(&self, id: &str) -> Result<EnvTx, ControlError> {
        let mut tx = self
            .store
            .get(id)
            .ok_or_else(|| ControlError::not_found(format!("unknown transaction '{id}'")))?;

        if !matches!(tx.status, TxStatus::Planned | TxStatus::Failed) {
            return Err(ControlError::conflict(format!(
                "transaction '{id}' is {:?} and cannot be applied",
                tx.status
            )));
        }

        tx.status = TxStatus::Running;
        tx.error = None;
        tx.touch();
        self.store.update(&tx).await?;

        tx.snapshot_before = self
            .snapshots
            .freeze(&self.location, &format!("{}-before", tx.id))
            .await;
        tx.touch();
        self.store.update(&tx).await?;

        let steps = self.steps_for(&tx);
        self.run_steps(&mut tx, steps).await?;

        tx.snapshot_after = self
            .snapshots
            .freeze(&self.location, &format!("{}-after", tx.id))
            .await;
        tx.status = if tx.pip_healthy == Some(true) {
            TxStatus::Succeeded
        } else {
            TxStatus::Failed
        };
        if tx.status == TxStatus::Failed && tx.error.is_none() {
            tx.error = Some("environment verification failed".to_string());
        }
        tx.touch();
        self.store.update(&tx).await?;
        info!("transaction {} finished as {:?}", tx.id, tx.status);
        Ok(tx)
    }

    /// Create and run a rollback transaction that reinstalls the freeze
    /// captured before the given transaction ran.
    pub async fn rollback(&self, id: &str) -> Result<EnvTx, ControlError> {
        let target = self
            .store
            .get(id)
            .ok_or_else(|| ControlError::not_found(format!("unknown transaction '{id}'")))?;

        let snapshot = match &target.snapshot_before {
            Some(path) if path.is_file() => path.clone(),
            _ => {
                return Err(ControlError::conflict(format!(
                    "transaction '{id}' has no usable before-snapshot to roll back to"
                )));
            }
        };

        let snapshot_display = snapshot.display().to_string();
        let mut tx = EnvTx::new(
            TxKind::Rollback,
            Vec::new(),
            vec![
                format!("python -m pip install -r {snapshot_display}"),
                "python -m pip check".to_string(),
            ],
        );
        tx.rollback_of = Some(target.id.clone());
        tx.snapshot_before = Some(snapshot.clone());
        let mut tx = self.store.create(tx).await.map_err(ControlError::from)?;

        tx.status = TxStatus::Running;
        tx.touch();
        self.store.update(&tx).await?;

        let steps = vec![
            PlannedStep {
                display: format!("python -m pip install -r {snapshot_display}"),
                args: str_args(&["-m", "pip", "install", "-r", &snapshot_display]),
                timeout: INSTALL_TIMEOUT,
                is_check: false,
            },
            check_step(),
        ];
        self.run_steps(&mut tx, steps).await?;

        tx.snapshot_after = self
            .snapshots
            .freeze(&self.location, &format!("{}-after", tx.id))
            .await;
        tx.status = if tx.pip_healthy == Some(true) {
            TxStatus::RolledBack
        } else {
            TxStatus::Failed
        };
        if tx.status == TxStatus::Failed && tx.error.is_none() {
            tx.error = Some("rollback verification failed".to_string());
        }
        tx.touch();
        self.store.update(&tx).await?;
        info!(
            "rollback {} of {} finished as {:?}",
            tx.id, target.id, tx.status
        );
        Ok(tx)
    }

    fn steps_for(&self, tx: &EnvTx) -> Vec<PlannedStep> {
        let mut steps = vec![
            PlannedStep {
                display: "python -m pip install -r requirements.txt".to_string(),
                args: str_args(&["-m", "pip", "install", "-r", "requirements.txt"]),
                timeout: INSTALL_TIMEOUT,
                is_check: false,
            },
            PlannedStep {
                display: "python -m pip install -r manager_requirements.txt".to_string(),
                args: str_args(&["-m", "pip", "install", "-r", "manager_requirements.txt"]),
                timeout: INSTALL_TIMEOUT,
                is_check: false,
            },
        ];
        if tx.kind == TxKind::Install && !tx.requested_packages.is_empty() {
            let mut args = str_args(&["-m", "pip", "install"]);
            args.extend(tx.requested_packages.iter().cloned());
            steps.push(PlannedStep {
                display: format!(
                    "python -m pip install {}",
                    tx.requested_packages.join(" ")
                ),
                args,
                timeout: INSTALL_TIMEOUT,
                is_check: false,
            });
        }
        steps.push(check_step());
        steps
    }

    /// Run every planned step in order, persisting after each one. When the
    /// virtualenv is missing, remaining steps are recorded as skipped-failed
    /// rather than executed.
    async fn run_steps(
        &self,
        tx: &mut EnvTx,
        steps: Vec<PlannedStep>,
    ) -> Result<(), ControlError> {
        for step in steps {
            if !self.location.venv_exists() {
                let reason = format!(
                    "skipped: virtualenv interpreter not found at {}",
                    self.location.venv_python.display()
                );
                warn!("step '{}' {}", step.display, reason);
                tx.steps
                    .push(subprocess::synthetic_step(&step.display, &reason));
                if step.is_check {
                    tx.pip_healthy = Some(false);
                    tx.pip_check_output = Some(reason);
                    tx.error = Some("virtualenv is missing".to_string());
                }
                tx.touch();
                self.store.update(tx).await?;
                continue;
            }

            let args: Vec<&str> = step.args.iter().map(String::as_str).collect();
            let record =
                subprocess::run_step(&self.location, &step.display, &args, step.timeout).await;
            if step.is_check {
                tx.pip_healthy = Some(record.ok);
                tx.pip_check_output = Some(record.output.clone());
                if !record.ok {
                    tx.error = Some("pip check reported broken requirements".to_string());
                }
            }
            tx.steps.push(record);
            tx.touch();
            self.store.update(tx).await?;
        }
        Ok(())
    }
}

fn check_step() -> PlannedStep {
    PlannedStep {
        display: "python -m pip check".to_string(),
        args: str_args(&["-m", "pip", "check"]),
        timeout: PROBE_TIMEOUT,
        is_check: true,
    }
}

fn str_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Fake venv whose python logs its arguments and always succeeds.
    fn fake_backend() -> (tempfile::TempDir, BackendLocation) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        std::fs::write(dir.join("main.py"), "").unwrap();
        std::fs::write(dir.join("requirements.txt"), "torch\n").unwrap();
        std::fs::write(dir.join("manager_requirements.txt"), "").unwrap();
        let bin = dir.join("venv").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let python = bin.join("python");
        std::fs::write(
            &python,
            "#!/bin/sh\nif [ \"$3\" = freeze ]; then echo 'torch==2.4.0'; fi\necho \"ran: $@\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();
        let location = crate::locator::BackendLocator::new(Some(dir.display().to_string()))
            .resolve()
            .unwrap();
        (tmp, location)
    }

    fn engine(location: &BackendLocation) -> TxEngine {
        let store = Arc::new(TxStore::new(location.transactions_path()));
        TxEngine::new(location.clone(), store)
    }

    #[tokio::test]
    async fn e1_plan_then_apply_succeeds() {
        let (_tmp, location) = fake_backend();
        let engine = engine(&location);

        let tx = engine
            .create_plan(PlanMode::Repair, &[], &[], Tier::Free)
            .await
            .unwrap();
        assert_eq!(tx.status, TxStatus::Planned);

        let tx = engine.apply(&tx.id).await.unwrap();
        assert_eq!(tx.status, TxStatus::Succeeded);
        assert_eq!(tx.pip_healthy, Some(true));
        assert!(tx.snapshot_before.is_some());
        assert!(tx.snapshot_after.is_some());
        assert!(tx.steps.len() >= 3);
        assert_eq!(tx.steps.last().unwrap().command, "python -m pip check");
    }

    #[tokio::test]
    async fn e2_plan_sanitizes_packages() {
        let (_tmp, location) = fake_backend();
        let engine = engine(&location);
        let tx = engine
            .create_plan(
                PlanMode::Install,
                &[
                    "torch==2.4".to_string(),
                    "rm -rf /; true".to_string(),
                    "pillow".to_string(),
                ],
                &[],
                Tier::Free,
            )
            .await
            .unwrap();
        assert_eq!(tx.requested_packages, vec!["torch==2.4", "pillow"]);
        assert!(tx
            .plan_commands
            .contains(&"python -m pip install torch==2.4 pillow".to_string()));
    }

    #[tokio::test]
    async fn apply_on_running_tx_is_a_conflict() {
        let (_tmp, location) = fake_backend();
        let engine = engine(&location);
        let mut tx = engine
            .create_plan(PlanMode::Repair, &[], &[], Tier::Free)
            .await
            .unwrap();
        tx.status = TxStatus::Running;
        engine.store.update(&tx).await.unwrap();

        let err = engine.apply(&tx.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        // The stored transaction is unchanged.
        assert_eq!(engine.store.get(&tx.id).unwrap().status, TxStatus::Running);
    }

    #[tokio::test]
    async fn apply_unknown_tx_is_not_found() {
        let (_tmp, location) = fake_backend();
        let engine = engine(&location);
        let err = engine.apply("no-such-id").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn policy_violation_blocks_planning() {
        let (_tmp, location) = fake_backend();
        let engine = engine(&location);
        let err = engine
            .create_plan(
                PlanMode::Install,
                &["pillow".to_string()],
                &["open".to_string(), "unknown".to_string()],
                Tier::Free,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PolicyViolation);
        let details = err.details.unwrap();
        assert_eq!(details["violations"][0], "unknown");
    }

    #[tokio::test]
    async fn e6_rollback_creates_linked_transaction() {
        let (_tmp, location) = fake_backend();
        let engine = engine(&location);
        let tx = engine
            .create_plan(PlanMode::Repair, &[], &[], Tier::Free)
            .await
            .unwrap();
        let tx = engine.apply(&tx.id).await.unwrap();
        let snapshot = tx.snapshot_before.clone().unwrap();

        let rb = engine.rollback(&tx.id).await.unwrap();
        assert_eq!(rb.kind, TxKind::Rollback);
        assert_eq!(rb.rollback_of.as_deref(), Some(tx.id.as_str()));
        assert_eq!(
            rb.plan_commands,
            vec![
                format!("python -m pip install -r {}", snapshot.display()),
                "python -m pip check".to_string(),
            ]
        );
        assert_eq!(rb.status, TxStatus::RolledBack);
    }

    #[tokio::test]
    async fn rollback_without_snapshot_is_a_conflict() {
        let (_tmp, location) = fake_backend();
        let engine = engine(&location);
        let tx = engine
            .create_plan(PlanMode::Repair, &[], &[], Tier::Free)
            .await
            .unwrap();
        let err = engine.rollback(&tx.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn missing_venv_records_synthetic_failed_steps() {
        let (_tmp, location) = fake_backend();
        std::fs::remove_file(&location.venv_python).unwrap();
        let engine = engine(&location);

        let tx = engine
            .create_plan(PlanMode::Repair, &[], &[], Tier::Free)
            .await
            .unwrap();
        let tx = engine.apply(&tx.id).await.unwrap();
        assert_eq!(tx.status, TxStatus::Failed);
        assert_eq!(tx.pip_healthy, Some(false));
        assert!(tx.steps.iter().all(|s| !s.ok));
        assert!(tx.steps.len() >= 3);
        assert!(tx.snapshot_before.is_none());
        assert_eq!(tx.error.as_deref(), Some("virtualenv is missing"));
    }

    #[tokio::test]
    async fn failed_transaction_can_be_reapplied() {
        let (_tmp, location) = fake_backend();
        let engine = engine(&location);
        let tx = engine
            .create_plan(PlanMode::Repair, &[], &[], Tier::Free)
            .await
            .unwrap();

        // First run fails because the venv is gone.
        std::fs::remove_file(&location.venv_python).unwrap();
        let tx = engine.apply(&tx.id).await.unwrap();
        assert_eq!(tx.status, TxStatus::Failed);

        // Restore the venv; a failed transaction may be applied again.
        let bin = location.backend_dir.join("venv").join("bin");
        let python = bin.join("python");
        std::fs::write(&python, "#!/bin/sh\necho ok\n").unwrap();
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();
        let tx = engine.apply(&tx.id).await.unwrap();
        assert_eq!(tx.status, TxStatus::Succeeded);
    }
}
