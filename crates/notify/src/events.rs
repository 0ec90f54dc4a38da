//! Notification event types for remediation outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity levels for notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - remediation worked
    Info,
    /// Warning - something needs attention
    Warning,
    /// Critical - human attention required
    Critical,
}

impl Severity {
    /// Get the attachment color for this severity.
    #[must_use]
    pub const fn color(&self) -> &'static str {
        match self {
            Self::Info => "#2ecc71",     // Green
            Self::Warning => "#f39c12",  // Orange
            Self::Critical => "#e74c3c", // Red
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Critical => "Critical",
        }
    }
}

/// Terminal remediation outcomes published to the sink.
///
/// Intermediate retries are never published; they live in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    /// An action succeeded on a node
    RemediationSucceeded {
        node_id: String,
        action_kind: String,
        final_status: String,
        attempts: u32,
        detail: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// Every allowed attempt failed; the node needs a human
    RemediationFatal {
        node_id: String,
        action_kind: String,
        final_status: String,
        attempts: u32,
        detail: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl NotifyEvent {
    /// Get a short title for this event.
    #[must_use]
    pub fn title(&self) -> String {
        match self {
            Self::RemediationSucceeded {
                node_id,
                action_kind,
                ..
            } => format!("Remediated {node_id}: {action_kind}"),
            Self::RemediationFatal {
                node_id,
                action_kind,
                ..
            } => format!("Remediation FATAL on {node_id}: {action_kind}"),
        }
    }

    /// Get the severity for this event.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::RemediationSucceeded { .. } => Severity::Info,
            Self::RemediationFatal { .. } => Severity::Critical,
        }
    }

    /// Get the timestamp for this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RemediationSucceeded { timestamp, .. }
            | Self::RemediationFatal { timestamp, .. } => *timestamp,
        }
    }

    /// Node the event is about.
    #[must_use]
    pub fn node_id(&self) -> &str {
        match self {
            Self::RemediationSucceeded { node_id, .. } | Self::RemediationFatal { node_id, .. } => {
                node_id
            }
        }
    }

    /// Human-readable body.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::RemediationSucceeded {
                attempts, detail, ..
            } => format!("Succeeded after {attempts} attempt(s)\n{detail}"),
            Self::RemediationFatal {
                attempts, detail, ..
            } => format!(
                "All {attempts} attempt(s) failed, requires human attention\nLast result: {detail}"
            ),
        }
    }

    /// Key/value fields shared by every channel.
    #[must_use]
    pub fn fields(&self) -> Vec<(String, String)> {
        match self {
            Self::RemediationSucceeded {
                node_id,
                action_kind,
                final_status,
                attempts,
                ..
            }
            | Self::RemediationFatal {
                node_id,
                action_kind,
                final_status,
                attempts,
                ..
            } => vec![
                ("Node".to_string(), node_id.clone()),
                ("Action".to_string(), action_kind.clone()),
                ("Status".to_string(), final_status.clone()),
                ("Attempts".to_string(), attempts.to_string()),
            ],
        }
    }
}
