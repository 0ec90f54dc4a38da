//! Append-only audit trail of decisions and executed actions.
//!
//! Records are never mutated after append. Ordering is append order per
//! sink; there is no global order across nodes. Every append is mirrored
//! to the log as a `HEALING_ACTION` line.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::error::AuditError;
use crate::types::{ActionKind, AttemptStatus};

/// Status recorded in an audit line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    /// Selector produced a decision
    Decided,
    /// Alert could not be normalized and was dropped
    Dropped,
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
    /// Attempts exhausted without success
    Fatal,
    /// An abandoned lock was reclaimed
    StaleLockReclaimed,
}

impl AuditStatus {
    /// Whether this closes an attempt chain.
    #[must_use]
    pub fn is_attempt_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Skipped
        )
    }
}

impl From<&AttemptStatus> for AuditStatus {
    fn from(status: &AttemptStatus) -> Self {
        match status {
            AttemptStatus::Pending => Self::Pending,
            AttemptStatus::Running => Self::Running,
            AttemptStatus::Succeeded => Self::Succeeded,
            AttemptStatus::Failed => Self::Failed,
            AttemptStatus::TimedOut => Self::TimedOut,
            AttemptStatus::Skipped(_) => Self::Skipped,
        }
    }
}

/// Which side of the transport wrote the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOrigin {
    Coordinator,
    Node,
}

/// One immutable audit line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub node_id: String,
    /// Absent only for dropped alerts
    pub action_kind: Option<ActionKind>,
    /// 0 for records that are not tied to an attempt (decisions, drops)
    pub attempt_number: u32,
    pub status: AuditStatus,
    pub detail: String,
    pub origin: AuditOrigin,
}

impl AuditRecord {
    /// Build a coordinator-side record stamped now.
    #[must_use]
    pub fn coordinator(
        node_id: &str,
        action_kind: Option<&ActionKind>,
        attempt_number: u32,
        status: AuditStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            node_id: node_id.to_string(),
            action_kind: action_kind.cloned(),
            attempt_number,
            status,
            detail: detail.into(),
            origin: AuditOrigin::Coordinator,
        }
    }

    /// Build a node-side record stamped now.
    #[must_use]
    pub fn node(
        node_id: &str,
        action_kind: &ActionKind,
        attempt_number: u32,
        status: AuditStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            origin: AuditOrigin::Node,
            ..Self::coordinator(node_id, Some(action_kind), attempt_number, status, detail)
        }
    }
}

/// Destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append a record.
    async fn append(&self, record: AuditRecord) -> Result<(), AuditError>;

    /// All records in append order.
    async fn records(&self) -> Result<Vec<AuditRecord>, AuditError>;

    /// Records for one node, in append order.
    async fn records_for(&self, node_id: &str) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(self
            .records()
            .await?
            .into_iter()
            .filter(|r| r.node_id == node_id)
            .collect())
    }
}

fn mirror_to_log(record: &AuditRecord) {
    let line = serde_json::to_string(record).unwrap_or_else(|_| format!("{record:?}"));
    info!(
        node_id = %record.node_id,
        status = ?record.status,
        attempt = record.attempt_number,
        "HEALING_ACTION: {line}"
    );
}

/// In-memory sink.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: RwLock<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, record: AuditRecord) -> Result<(), AuditError> {
        mirror_to_log(&record);
        self.records.write().await.push(record);
        Ok(())
    }

    async fn records(&self) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(self.records.read().await.clone())
    }
}

/// JSON-lines file sink. Survives process restarts.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditSink {
    /// Open (creating parent directories) a JSONL sink at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, record: AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        drop(file);

        mirror_to_log(&record);
        Ok(())
    }

    async fn records(&self) -> Result<Vec<AuditRecord>, AuditError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(AuditError::from))
            .collect()
    }
}
