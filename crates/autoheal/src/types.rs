//! Core remediation types shared by the coordinator and the node executor.
//!
//! - [`ActionKind`] / [`RemediationAction`]: what the selector decided
//! - [`RemediationAttempt`] / [`AttemptStatus`]: one execution try and its state machine
//! - [`ExecuteRequest`] / [`AttemptResult`]: the wire contract with the node agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::HealError;

/// Remediation the engine can perform on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "service", rename_all = "snake_case")]
pub enum ActionKind {
    /// Reboot the node
    Reboot,
    /// Restart a named service
    RestartService(String),
    /// Flush OS and package-manager caches
    ClearCache,
    /// Remove temp files, compress old logs, clear package caches
    CleanupDisk,
    /// Gather a diagnostic snapshot
    CollectDiagnostics,
    /// Deliberately do nothing
    NoOp,
}

/// Discriminant of [`ActionKind`] without payload, used to key the handler registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTag {
    Reboot,
    RestartService,
    ClearCache,
    CleanupDisk,
    CollectDiagnostics,
    NoOp,
}

impl ActionTag {
    /// Every supported action, in registry order.
    pub const ALL: [ActionTag; 6] = [
        Self::Reboot,
        Self::RestartService,
        Self::ClearCache,
        Self::CleanupDisk,
        Self::CollectDiagnostics,
        Self::NoOp,
    ];

    /// Get the action's name as a string.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Reboot => "reboot",
            Self::RestartService => "restart_service",
            Self::ClearCache => "clear_cache",
            Self::CleanupDisk => "cleanup_disk",
            Self::CollectDiagnostics => "collect_diagnostics",
            Self::NoOp => "noop",
        }
    }
}

impl ActionKind {
    /// Get the payload-free discriminant.
    #[must_use]
    pub fn tag(&self) -> ActionTag {
        match self {
            Self::Reboot => ActionTag::Reboot,
            Self::RestartService(_) => ActionTag::RestartService,
            Self::ClearCache => ActionTag::ClearCache,
            Self::CleanupDisk => ActionTag::CleanupDisk,
            Self::CollectDiagnostics => ActionTag::CollectDiagnostics,
            Self::NoOp => ActionTag::NoOp,
        }
    }

    /// Parse an operator/alert hint such as `restart_service` or `diagnostic`.
    ///
    /// `service` is required for `restart_service`.
    #[must_use]
    pub fn from_hint(hint: &str, service: Option<&str>) -> Option<Self> {
        let normalized = hint.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "reboot" => Some(Self::Reboot),
            "restart_service" | "restart" => service
                .filter(|s| !s.trim().is_empty())
                .map(|s| Self::RestartService(s.trim().to_string())),
            "clear_cache" => Some(Self::ClearCache),
            "cleanup_disk" => Some(Self::CleanupDisk),
            "diagnostic" | "diagnostics" | "collect_diagnostics" => Some(Self::CollectDiagnostics),
            "noop" | "no_op" => Some(Self::NoOp),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RestartService(name) => write!(f, "restart_service({name})"),
            other => f.write_str(other.tag().name()),
        }
    }
}

/// A decision produced by the action selector. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationAction {
    /// Unique id of this decision
    pub id: Uuid,
    /// What to do
    pub kind: ActionKind,
    /// Why, referencing the triggering alert fields
    pub rationale: String,
    /// Attempt cap (>= 1)
    pub max_attempts: u32,
    /// Budget for a single attempt
    pub attempt_timeout: Duration,
}

impl RemediationAction {
    /// Create a new action. `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(
        kind: ActionKind,
        rationale: impl Into<String>,
        max_attempts: u32,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            rationale: rationale.into(),
            max_attempts: max_attempts.max(1),
            attempt_timeout,
        }
    }
}

/// State of a single attempt.
///
/// `Pending -> Running -> {Succeeded | Failed | TimedOut | Skipped}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Skipped(String),
}

impl AttemptStatus {
    /// Terminal states are final.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether a new attempt may follow this one.
    #[must_use]
    pub fn allows_retry(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }

    /// Get the state's name as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Skipped(_) => "skipped",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped(reason) => write!(f, "skipped ({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// One execution try of an action against a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAttempt {
    /// Unique attempt id; also the lock holder id on the node
    pub id: Uuid,
    /// Target node
    pub node_id: String,
    /// The action being attempted
    pub action: RemediationAction,
    /// 1-based attempt number within the action
    pub attempt_number: u32,
    /// Current status
    pub status: AttemptStatus,
    /// When the attempt entered `Running`
    pub started_at: Option<DateTime<Utc>>,
    /// When the attempt reached a terminal state
    pub ended_at: Option<DateTime<Utc>>,
    /// Human-readable outcome
    pub detail: String,
    /// Node-reported result, if the node answered
    pub result: Option<AttemptResult>,
    /// Why the attempt did not succeed, as classified by the coordinator
    #[serde(skip)]
    pub failure: Option<HealError>,
}

impl RemediationAttempt {
    /// Create a new pending attempt.
    #[must_use]
    pub fn new(node_id: &str, action: RemediationAction, attempt_number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id: node_id.to_string(),
            action,
            attempt_number,
            status: AttemptStatus::Pending,
            started_at: None,
            ended_at: None,
            detail: String::new(),
            result: None,
            failure: None,
        }
    }

    /// Move to `Running`.
    pub fn start(&mut self) {
        self.status = AttemptStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Move to a terminal state.
    pub fn finish(&mut self, status: AttemptStatus, detail: impl Into<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.detail = detail.into();
        self.ended_at = Some(Utc::now());
    }
}

/// Request sent from the coordinator to a node agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Attempt id, used as the lock holder id
    pub attempt_id: Uuid,
    /// Target node (echoed for audit)
    pub node_id: String,
    /// Action to run
    pub action: ActionKind,
    /// Attempt number (echoed for audit)
    pub attempt_number: u32,
}

impl ExecuteRequest {
    /// Build the request for an attempt.
    #[must_use]
    pub fn for_attempt(attempt: &RemediationAttempt) -> Self {
        Self {
            attempt_id: attempt.id,
            node_id: attempt.node_id.clone(),
            action: attempt.action.kind.clone(),
            attempt_number: attempt.attempt_number,
        }
    }
}

/// Outcome of one sub-step of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed(String),
    Skipped(String),
}

/// Structured report of a sub-step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    /// Step name (e.g. `drop_caches`)
    pub name: String,
    /// Command line that ran, if any
    pub command: Option<String>,
    /// Result
    pub outcome: StepOutcome,
    /// Captured output (truncated)
    #[serde(default)]
    pub output: String,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl StepReport {
    /// Whether the step succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outcome == StepOutcome::Succeeded
    }
}

/// A stale lock that was reclaimed before running an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleLockInfo {
    /// Attempt id of the abandoned holder
    pub previous_holder: String,
    /// When the abandoned lock was taken
    pub acquired_at: DateTime<Utc>,
    /// Lock age at reclaim time
    pub age_ms: u64,
    /// Configured TTL
    pub ttl_ms: u64,
}

/// Result reported by the node executor for one attempt.
///
/// Status is always terminal: `Succeeded`, `Failed` or `Skipped`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptResult {
    /// Terminal status
    pub status: AttemptStatus,
    /// Summary, naming causes on failure
    pub detail: String,
    /// Per-step reports
    #[serde(default)]
    pub steps: Vec<StepReport>,
    /// Numeric results (freed memory, disk delta, ...)
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Set when a stale lock was reclaimed
    #[serde(default)]
    pub reclaimed_lock: Option<StaleLockInfo>,
    /// Attempt id holding the node lock, when the node skipped for it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub held_by: Option<String>,
    /// When execution began on the node
    pub started_at: DateTime<Utc>,
    /// When execution ended on the node
    pub ended_at: DateTime<Utc>,
}

impl AttemptResult {
    /// Build a result with no steps.
    #[must_use]
    pub fn bare(status: AttemptStatus, detail: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            status,
            detail: detail.into(),
            steps: Vec::new(),
            metrics: BTreeMap::new(),
            reclaimed_lock: None,
            held_by: None,
            started_at: now,
            ended_at: now,
        }
    }
}
