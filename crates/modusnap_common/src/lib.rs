//! Shared data model for the modusnap control plane
//!
//! Everything in this crate is transport-free: records that the daemon
//! persists or serves, plus the pure logic (specifier sanitization, policy
//! gate, hardware token parsing) that both the daemon and its tests exercise.

pub mod api_key;
pub mod catalog;
pub mod compat;
pub mod diagnostics;
pub mod env_tx;
pub mod error;
pub mod hardware_profile;
pub mod policy;
pub mod session;

pub use api_key::{generate_key, ApiKey, ApiKeySummary, KeyStore};
pub use catalog::{CatalogItem, InstallType};
pub use compat::{
    CatalogAudit, CompatibilitySet, Decision, DependencyAuditReport, DependencyLock,
    PackDecision, PinnedPackage, PreflightReport, RequirementConflict,
};
pub use diagnostics::{DiagnosticIssue, IssueId, Severity};
pub use env_tx::{
    sanitize_packages, truncate_output, EnvStep, EnvTx, EnvTxSummary, TxKind, TxStatus,
    STEP_OUTPUT_LIMIT,
};
pub use error::{ControlError, ErrorKind};
pub use hardware_profile::HardwareProfile;
pub use policy::{evaluate_policy, PolicyDecision, Tier};
pub use session::{
    chunk_size_for, InstallSession, ItemStatus, SessionItem, SessionMode, SessionScope,
};
