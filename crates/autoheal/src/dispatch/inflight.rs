//! In-flight remediation tracking.
//!
//! A coordinator-local cache keyed by `(node_id, action kind)`. It keeps
//! duplicate alerts from stacking dispatches, but the node lock remains the
//! authority: this table is empty after a coordinator restart.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

use crate::types::ActionKind;

type Key = (String, ActionKind);

/// Snapshot of one in-flight remediation.
#[derive(Debug, Clone, Serialize)]
pub struct InFlightRemediation {
    pub node_id: String,
    pub action_kind: ActionKind,
    pub action_id: Uuid,
    pub since: DateTime<Utc>,
    /// Attempt currently running (0 before the first dispatch)
    pub attempt_number: u32,
}

/// Table of remediations currently being driven by this coordinator.
#[derive(Debug, Clone, Default)]
pub struct InFlightTable {
    entries: Arc<RwLock<HashMap<Key, InFlightRemediation>>>,
}

impl InFlightTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `(node_id, kind)`. Returns `None` if already claimed.
    #[must_use]
    pub fn try_claim(&self, node_id: &str, kind: &ActionKind, action_id: Uuid) -> Option<InFlightClaim> {
        let key = (node_id.to_string(), kind.clone());
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&key) {
            return None;
        }
        entries.insert(
            key.clone(),
            InFlightRemediation {
                node_id: node_id.to_string(),
                action_kind: kind.clone(),
                action_id,
                since: Utc::now(),
                attempt_number: 0,
            },
        );
        Some(InFlightClaim {
            table: self.clone(),
            key,
        })
    }

    /// Whether `(node_id, kind)` is claimed.
    #[must_use]
    pub fn contains(&self, node_id: &str, kind: &ActionKind) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&(node_id.to_string(), kind.clone()))
    }

    /// Current entries, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<InFlightRemediation> {
        let mut list: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        list.sort_by_key(|e| e.since);
        list
    }
}

/// Ownership of an in-flight slot; released on drop.
#[derive(Debug)]
pub struct InFlightClaim {
    table: InFlightTable,
    key: Key,
}

impl InFlightClaim {
    /// Record which attempt is running.
    pub fn set_attempt(&self, attempt_number: u32) {
        if let Some(entry) = self
            .table
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&self.key)
        {
            entry.attempt_number = attempt_number;
        }
    }
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.table
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_is_refused_until_release() {
        let table = InFlightTable::new();
        let claim = table
            .try_claim("n3", &ActionKind::ClearCache, Uuid::new_v4())
            .unwrap();
        assert!(table
            .try_claim("n3", &ActionKind::ClearCache, Uuid::new_v4())
            .is_none());

        // Different kind or node is independent.
        assert!(table
            .try_claim("n3", &ActionKind::CleanupDisk, Uuid::new_v4())
            .is_some());
        assert!(table
            .try_claim("n4", &ActionKind::ClearCache, Uuid::new_v4())
            .is_some());

        drop(claim);
        assert!(!table.contains("n3", &ActionKind::ClearCache));
    }

    #[test]
    fn test_snapshot_tracks_attempt() {
        let table = InFlightTable::new();
        let claim = table
            .try_claim("n1", &ActionKind::Reboot, Uuid::new_v4())
            .unwrap();
        claim.set_attempt(2);

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].attempt_number, 2);
        assert_eq!(snapshot[0].action_kind, ActionKind::Reboot);
    }
}
