//! Error types for the auto-heal engine.

use thiserror::Error;

/// Failure taxonomy for a single alert's remediation pipeline.
///
/// Only [`HealError::MalformedAlert`] and [`HealError::Fatal`] halt the
/// pipeline for an alert. Lock contention ends a remediation as skipped;
/// everything else is recovered by the retry loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HealError {
    /// Normalization could not extract a node id
    #[error("Malformed alert: {0}")]
    MalformedAlert(String),

    /// Node id does not resolve to a reachable target
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Another attempt holds the node lock
    #[error("Lock contention on node {node_id}: {reason}")]
    LockContention {
        node_id: String,
        /// Attempt id recorded in the lock, when the node reported it
        holder: Option<String>,
        reason: String,
    },

    /// Node-side action ran and reported failure
    #[error("Action failed: {0}")]
    ActionFailed(String),

    /// Transport or action exceeded its budget
    #[error("Attempt timed out: {0}")]
    AttemptTimedOut(String),

    /// All attempts exhausted without success
    #[error("Remediation fatal after {attempts} attempts: {last_detail}")]
    Fatal { attempts: u32, last_detail: String },
}

impl HealError {
    /// Whether the coordinator should schedule another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NodeNotFound(_) | Self::ActionFailed(_) | Self::AttemptTimedOut(_)
        )
    }
}

/// Errors raised while normalizing an inbound alert payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    /// No node id could be found in any known location
    #[error("Malformed alert: no node id in payload ({0})")]
    MalformedAlert(String),
}

impl From<NormalizeError> for HealError {
    fn from(err: NormalizeError) -> Self {
        match err {
            NormalizeError::MalformedAlert(reason) => Self::MalformedAlert(reason),
        }
    }
}

/// Errors from the remote command transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Node id is not in the inventory
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Node is known but could not be reached
    #[error("Node {node_id} unreachable: {reason}")]
    Unreachable { node_id: String, reason: String },

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Node agent answered with something we cannot interpret
    #[error("Protocol error: {status} - {message}")]
    Protocol { status: u16, message: String },
}

impl TransportError {
    /// Map onto the pipeline taxonomy.
    #[must_use]
    pub fn classify(&self) -> HealError {
        match self {
            Self::NodeNotFound(node) => HealError::NodeNotFound(node.clone()),
            Self::Unreachable { node_id, .. } => HealError::NodeNotFound(node_id.clone()),
            Self::Http(e) if e.is_connect() => HealError::NodeNotFound(e.to_string()),
            Self::Http(e) if e.is_timeout() => HealError::AttemptTimedOut(e.to_string()),
            other => HealError::ActionFailed(other.to_string()),
        }
    }
}

/// Errors from the node-local execution lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Filesystem operation on the lock file failed
    #[error("Lock I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Lock contents could not be encoded
    #[error("Lock serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Lock kept changing hands while we tried to take it
    #[error("Lock at {0} did not settle")]
    Unsettled(String),

    /// Blocking lock task panicked or was cancelled
    #[error("Lock task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Errors from the audit sink.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Writing or reading the audit file failed
    #[error("Audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded
    #[error("Audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON for the schema
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// A value violates a constraint
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
