//! Auto-heal orchestration and remediation engine.
//!
//! Turns node health alerts into bounded, audited remediation actions:
//!
//! ```text
//! alert ─▶ alerts::normalize ─▶ ActionSelector ─▶ DispatchCoordinator ─▶ RemoteTransport ─▶ NodeExecutor
//!                                                        │                                     │
//!                                                        └──────────── AuditSink ◀─────────────┘
//! ```
//!
//! The coordinator owns the retry loop and the in-flight table; the node
//! executor owns the execution lock, which is the authority on mutual
//! exclusion. Terminal outcomes are published through the `notify` crate.

pub mod alerts;
pub mod audit;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod prometheus;
pub mod selector;
pub mod server;
pub mod types;

pub use alerts::{normalize, normalize_body, AlertSource, HealthAlert};
pub use audit::{AuditRecord, AuditSink, AuditStatus, JsonlAuditSink, MemoryAuditSink};
pub use config::AutohealConfig;
pub use dispatch::{DispatchCoordinator, FinalStatus, RemediationOutcome};
pub use error::HealError;
pub use executor::{NodeExecutor, HEALING_IN_PROGRESS};
pub use selector::ActionSelector;
pub use types::{
    ActionKind, AttemptResult, AttemptStatus, ExecuteRequest, RemediationAction, RemediationAttempt,
};
