//! Node-side remediation executor.
//!
//! Runs on the target node, one invocation per dispatched attempt:
//!
//! 1. Take the node's [`LockFile`] for the attempt id, off the async
//!    runtime. A live lock held by someone else short-circuits to
//!    `Skipped("healing in progress")`; a stale one is reclaimed with a
//!    warning and an audit record.
//! 2. Look up the handler for the action in the [`ActionRegistry`] and run it.
//! 3. Release the lock, on every exit path.
//!
//! Handlers never propagate errors: whatever happens is folded into the
//! returned [`AttemptResult`].

pub mod actions;
pub mod lock;
pub mod registry;
pub mod runner;
pub mod steps;

pub use lock::{Acquisition, ExecutionLock, LockFile, LockGuard};
pub use registry::{ActionContext, ActionRegistry, HandlerOutcome, RemediationHandler};
pub use runner::{CommandOutput, CommandRunner, Scripted, ScriptedRunner, SystemRunner};
pub use steps::StepRecorder;

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::audit::{AuditRecord, AuditSink, AuditStatus};
use crate::types::{AttemptResult, AttemptStatus, ExecuteRequest};

/// Skip reason when another attempt holds the node lock.
pub const HEALING_IN_PROGRESS: &str = "healing in progress";

/// Tunables for node-side actions.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Budget for each sub-step
    pub step_timeout: Duration,
    /// Directory whose old logs are compressed and pruned
    pub log_dir: PathBuf,
    /// Age in days after which logs are compressed
    pub log_max_age_days: u32,
    /// Directories cleaned of temporary files
    pub temp_dirs: Vec<PathBuf>,
    /// Rows kept from process listings
    pub diagnostics_lines: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(60),
            log_dir: PathBuf::from("/var/log"),
            log_max_age_days: 7,
            temp_dirs: vec![PathBuf::from("/tmp")],
            diagnostics_lines: 20,
        }
    }
}

/// Executes attempts on the local node.
pub struct NodeExecutor {
    node_id: String,
    lock: LockFile,
    registry: ActionRegistry,
    runner: Arc<dyn CommandRunner>,
    settings: ExecutorSettings,
    audit: Arc<dyn AuditSink>,
}

impl NodeExecutor {
    /// Create an executor with the standard action registry.
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        lock: LockFile,
        runner: Arc<dyn CommandRunner>,
        settings: ExecutorSettings,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            lock,
            registry: ActionRegistry::standard(),
            runner,
            settings,
            audit,
        }
    }

    /// Replace the action registry.
    #[must_use]
    pub fn with_registry(mut self, registry: ActionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Id of the node this executor runs on.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The node lock.
    #[must_use]
    pub fn lock(&self) -> &LockFile {
        &self.lock
    }

    /// Run one attempt. Never fails; every outcome is an [`AttemptResult`].
    pub async fn execute(&self, request: &ExecuteRequest) -> AttemptResult {
        let started_at = Utc::now();
        let holder = request.attempt_id.to_string();
        let action = &request.action;

        let acquisition = match self.lock.acquire(&holder, started_at).await {
            Ok(acquisition) => acquisition,
            Err(e) => {
                error!(node_id = %self.node_id, error = %e, "Failed to take execution lock");
                let result = AttemptResult::bare(
                    AttemptStatus::Failed,
                    format!("execution lock unavailable: {e}"),
                );
                self.record(request, &result.status, &result.detail).await;
                return result;
            }
        };

        let (guard, reclaimed) = match acquisition {
            Acquisition::Acquired(guard) => (guard, None),
            Acquisition::Reclaimed { guard, stale } => {
                warn!(
                    node_id = %self.node_id,
                    previous_holder = %stale.previous_holder,
                    age_ms = stale.age_ms,
                    ttl_ms = stale.ttl_ms,
                    "Reclaimed stale execution lock"
                );
                self.append(AuditRecord::node(
                    &request.node_id,
                    action,
                    request.attempt_number,
                    AuditStatus::StaleLockReclaimed,
                    format!(
                        "reclaimed lock from attempt {} (age {}ms >= ttl {}ms)",
                        stale.previous_holder, stale.age_ms, stale.ttl_ms
                    ),
                ))
                .await;
                (guard, Some(stale))
            }
            Acquisition::Held(existing) => {
                info!(
                    node_id = %self.node_id,
                    holder = %existing.holder_attempt_id,
                    "Execution lock held, skipping attempt"
                );
                let status = AttemptStatus::Skipped(HEALING_IN_PROGRESS.to_string());
                let detail = format!(
                    "lock held by attempt {} since {}",
                    existing.holder_attempt_id,
                    existing.acquired_at.to_rfc3339()
                );
                self.record(request, &status, &detail).await;
                let mut result = AttemptResult::bare(status, detail);
                result.held_by = Some(existing.holder_attempt_id);
                result.started_at = started_at;
                return result;
            }
        };

        self.record(request, &AttemptStatus::Running, "").await;
        info!(
            node_id = %self.node_id,
            action = %action,
            attempt = request.attempt_number,
            "Executing remediation"
        );

        let ctx = ActionContext {
            runner: self.runner.as_ref(),
            settings: &self.settings,
        };
        let outcome = match self.registry.get(action.tag()) {
            Some(handler) => handler.execute(action, &ctx).await,
            None => HandlerOutcome::bare(
                AttemptStatus::Failed,
                format!("no handler registered for {}", action.tag().name()),
            ),
        };

        if let Err(e) = guard.unlock().await {
            warn!(node_id = %self.node_id, error = %e, "Failed to release execution lock");
        }

        let result = AttemptResult {
            status: outcome.status,
            detail: outcome.detail,
            steps: outcome.steps,
            metrics: outcome.metrics,
            reclaimed_lock: reclaimed,
            held_by: None,
            started_at,
            ended_at: Utc::now(),
        };

        info!(
            node_id = %self.node_id,
            action = %action,
            attempt = request.attempt_number,
            status = %result.status,
            "Remediation finished"
        );
        self.record(request, &result.status, &result.detail).await;
        result
    }

    async fn record(&self, request: &ExecuteRequest, status: &AttemptStatus, detail: &str) {
        self.append(AuditRecord::node(
            &request.node_id,
            &request.action,
            request.attempt_number,
            AuditStatus::from(status),
            detail,
        ))
        .await;
    }

    async fn append(&self, record: AuditRecord) {
        if let Err(e) = self.audit.append(record).await {
            warn!(node_id = %self.node_id, error = %e, "Failed to append node audit record");
        }
    }
}
