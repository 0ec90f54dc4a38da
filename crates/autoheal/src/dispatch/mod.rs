//! Dispatch coordinator.
//!
//! Owns the retry loop for a remediation: one attempt at a time per
//! `(node_id, action kind)`, at most `max_attempts` attempts, each bounded
//! by `attempt_timeout`, spaced by the [`Backoff`] policy. Every attempt
//! state transition is appended to the audit sink before the next retry
//! decision; terminal outcomes (`Succeeded`, `Fatal`) go to the notifier.
//! Whether a failed attempt is retried is decided on its [`HealError`]
//! classification.

pub mod inflight;
pub mod retry;
pub mod transport;

pub use inflight::{InFlightClaim, InFlightRemediation, InFlightTable};
pub use retry::Backoff;
pub use transport::{HttpTransport, LocalTransport, NodeInventory, RemoteTransport};

use chrono::Utc;
use notify::{Notifier, NotifyEvent};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::alerts::{normalize_body, HealthAlert};
use crate::audit::{AuditOrigin, AuditRecord, AuditSink, AuditStatus};
use crate::error::{AuditError, HealError};
use crate::prometheus::MetricsLookup;
use crate::selector::ActionSelector;
use crate::types::{ActionKind, AttemptStatus, ExecuteRequest, RemediationAction, RemediationAttempt};

/// Skip reason for a duplicate alert while a remediation is in flight.
pub const ALREADY_IN_PROGRESS: &str = "already in progress";

/// Skip reason when auto-healing is switched off.
pub const AUTO_HEALING_DISABLED: &str = "auto-healing disabled";

/// Audit detail for attempts closed by [`DispatchCoordinator::recover`].
pub const ORPHANED: &str = "orphaned by coordinator restart";

/// Detail prefix for chains marked fatal by [`DispatchCoordinator::recover`].
pub const INTERRUPTED: &str = "interrupted by coordinator restart";

/// How a remediation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum FinalStatus {
    Succeeded,
    /// Deliberately not executed (coalesced, disabled, or node lock held)
    Skipped(String),
    /// Attempts exhausted without success
    Fatal,
}

/// Result of driving one action to a terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct RemediationOutcome {
    pub node_id: String,
    pub action: RemediationAction,
    pub attempts: Vec<RemediationAttempt>,
    pub final_status: FinalStatus,
    /// Detail of the last attempt
    pub detail: String,
}

impl RemediationOutcome {
    /// Whether the remediation needs human attention.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.final_status == FinalStatus::Fatal
    }

    /// Convert a fatal outcome into the pipeline error.
    #[must_use]
    pub fn fatal_error(&self) -> Option<HealError> {
        self.is_fatal().then(|| HealError::Fatal {
            attempts: self.attempts.len() as u32,
            last_detail: self.detail.clone(),
        })
    }
}

/// Drives remediations from alert to terminal outcome.
pub struct DispatchCoordinator {
    selector: ActionSelector,
    telemetry: Option<Arc<dyn MetricsLookup>>,
    transport: Arc<dyn RemoteTransport>,
    audit: Arc<dyn AuditSink>,
    notifier: Option<Arc<Notifier>>,
    inflight: InFlightTable,
    backoff: Backoff,
    auto_healing: bool,
}

impl DispatchCoordinator {
    /// Create a coordinator with fixed backoff, no telemetry and no notifier.
    #[must_use]
    pub fn new(
        selector: ActionSelector,
        transport: Arc<dyn RemoteTransport>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            selector,
            telemetry: None,
            transport,
            audit,
            notifier: None,
            inflight: InFlightTable::new(),
            backoff: Backoff::default(),
            auto_healing: true,
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn MetricsLookup>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Switch node execution on or off. When off, decisions are still
    /// recorded but every remediation is `Skipped("auto-healing disabled")`.
    #[must_use]
    pub fn with_auto_healing(mut self, enabled: bool) -> Self {
        self.auto_healing = enabled;
        self
    }

    /// Run the whole pipeline for a raw alert body.
    ///
    /// Only a malformed alert is an error; a fatal remediation is reported
    /// through [`RemediationOutcome::final_status`].
    pub async fn handle_alert(&self, body: &str) -> Result<RemediationOutcome, HealError> {
        let (alert, action) = self.intake(body).await?;
        Ok(self.remediate(&alert.node_id, action).await)
    }

    /// Normalize and decide, without executing.
    ///
    /// Malformed alerts are audited as dropped under node `unknown`.
    pub async fn intake(&self, body: &str) -> Result<(HealthAlert, RemediationAction), HealError> {
        let alert = match normalize_body(body) {
            Ok(alert) => alert,
            Err(e) => {
                warn!(error = %e, "Dropping malformed alert");
                self.append(AuditRecord::coordinator(
                    "unknown",
                    None,
                    0,
                    AuditStatus::Dropped,
                    e.to_string(),
                ))
                .await;
                return Err(e.into());
            }
        };
        let action = self.decide(&alert).await;
        Ok((alert, action))
    }

    /// Select an action for the alert and record the decision.
    pub async fn decide(&self, alert: &HealthAlert) -> RemediationAction {
        let action = match &self.telemetry {
            Some(telemetry) => self.selector.select_with_telemetry(alert, telemetry.as_ref()).await,
            None => self.selector.select(alert),
        };
        info!(
            node_id = %alert.node_id,
            action = %action.kind,
            max_attempts = action.max_attempts,
            "Remediation decided"
        );
        self.append(AuditRecord::coordinator(
            &alert.node_id,
            Some(&action.kind),
            0,
            AuditStatus::Decided,
            action.rationale.clone(),
        ))
        .await;
        action
    }

    /// Drive `action` on `node_id` to a terminal outcome.
    pub async fn remediate(&self, node_id: &str, action: RemediationAction) -> RemediationOutcome {
        let Some(claim) = self.inflight.try_claim(node_id, &action.kind, action.id) else {
            info!(node_id = %node_id, action = %action.kind, "Coalescing duplicate alert");
            return self.skip(node_id, action, ALREADY_IN_PROGRESS).await;
        };

        if !self.auto_healing {
            info!(node_id = %node_id, action = %action.kind, "Auto-healing disabled, not dispatching");
            drop(claim);
            return self.skip(node_id, action, AUTO_HEALING_DISABLED).await;
        }

        let mut attempts: Vec<RemediationAttempt> = Vec::new();
        let mut previous_start: Option<Instant> = None;

        for attempt_number in 1..=action.max_attempts {
            if let Some(started) = previous_start {
                let spacing = self
                    .backoff
                    .spacing_after(attempt_number - 1, action.attempt_timeout);
                debug!(node_id = %node_id, attempt = attempt_number, spacing_ms = spacing.as_millis() as u64, "Waiting before retry");
                tokio::time::sleep_until(started + spacing).await;
            }
            previous_start = Some(Instant::now());
            claim.set_attempt(attempt_number);

            let attempt = self.dispatch(&action, node_id, attempt_number).await;
            let detail = attempt.detail.clone();
            let status = attempt.status.clone();

            let Some(failure) = attempt.failure.clone() else {
                attempts.push(attempt);
                info!(node_id = %node_id, action = %action.kind, attempt = attempt_number, "Remediation succeeded");
                self.publish(NotifyEvent::RemediationSucceeded {
                    node_id: node_id.to_string(),
                    action_kind: action.kind.to_string(),
                    final_status: "succeeded".to_string(),
                    attempts: attempt_number,
                    detail: detail.clone(),
                    timestamp: Utc::now(),
                })
                .await;
                return RemediationOutcome {
                    node_id: node_id.to_string(),
                    action,
                    attempts,
                    final_status: FinalStatus::Succeeded,
                    detail,
                };
            };

            let retry = should_retry(&failure, &attempts);
            attempts.push(attempt);
            if !retry {
                if let HealError::LockContention { reason, .. } = failure {
                    info!(node_id = %node_id, action = %action.kind, reason = %reason, "Remediation skipped by node");
                    return RemediationOutcome {
                        node_id: node_id.to_string(),
                        action,
                        attempts,
                        final_status: FinalStatus::Skipped(reason),
                        detail,
                    };
                }
                warn!(node_id = %node_id, action = %action.kind, error = %failure, "Remediation failure is not retryable");
                break;
            }
            warn!(
                node_id = %node_id,
                action = %action.kind,
                attempt = attempt_number,
                max_attempts = action.max_attempts,
                status = %status,
                error = %failure,
                "Remediation attempt did not succeed"
            );
        }

        let last_detail = attempts
            .last()
            .map(|a| a.detail.clone())
            .unwrap_or_default();
        let attempt_count = attempts.len() as u32;
        error!(
            node_id = %node_id,
            action = %action.kind,
            attempts = attempt_count,
            detail = %last_detail,
            "Remediation FATAL: attempts exhausted, requires human attention"
        );
        self.append(AuditRecord::coordinator(
            node_id,
            Some(&action.kind),
            attempt_count,
            AuditStatus::Fatal,
            format!("{attempt_count} attempts exhausted; last: {last_detail}"),
        ))
        .await;
        self.publish(NotifyEvent::RemediationFatal {
            node_id: node_id.to_string(),
            action_kind: action.kind.to_string(),
            final_status: "fatal".to_string(),
            attempts: attempt_count,
            detail: last_detail.clone(),
            timestamp: Utc::now(),
        })
        .await;

        RemediationOutcome {
            node_id: node_id.to_string(),
            action,
            attempts,
            final_status: FinalStatus::Fatal,
            detail: last_detail,
        }
    }

    /// Run a single attempt and return it in a terminal state, with
    /// [`RemediationAttempt::failure`] set unless it succeeded.
    ///
    /// Does not consult the in-flight table; callers driving retries
    /// themselves must serialize per `(node_id, kind)`.
    pub async fn dispatch(
        &self,
        action: &RemediationAction,
        node_id: &str,
        attempt_number: u32,
    ) -> RemediationAttempt {
        let mut attempt = RemediationAttempt::new(node_id, action.clone(), attempt_number);
        let kind = &action.kind;

        self.append(AuditRecord::coordinator(
            node_id,
            Some(kind),
            attempt_number,
            AuditStatus::Pending,
            format!("attempt {}", attempt.id),
        ))
        .await;

        attempt.start();
        self.append(AuditRecord::coordinator(
            node_id,
            Some(kind),
            attempt_number,
            AuditStatus::Running,
            "",
        ))
        .await;

        let request = ExecuteRequest::for_attempt(&attempt);
        let failure = match tokio::time::timeout(action.attempt_timeout, self.transport.execute(&request)).await {
            Ok(Ok(result)) => {
                let failure = if result.status.is_terminal() {
                    attempt.finish(result.status.clone(), result.detail.clone());
                    match &result.status {
                        AttemptStatus::Succeeded => None,
                        AttemptStatus::TimedOut => Some(HealError::AttemptTimedOut(result.detail.clone())),
                        AttemptStatus::Skipped(reason) => Some(HealError::LockContention {
                            node_id: node_id.to_string(),
                            holder: result.held_by.clone(),
                            reason: reason.clone(),
                        }),
                        _ => Some(HealError::ActionFailed(result.detail.clone())),
                    }
                } else {
                    let detail = format!("node reported non-terminal status {}", result.status);
                    attempt.finish(AttemptStatus::Failed, detail.clone());
                    Some(HealError::ActionFailed(detail))
                };
                attempt.result = Some(result);
                failure
            }
            Ok(Err(e)) => {
                let classified = e.classify();
                match &classified {
                    HealError::AttemptTimedOut(_) => attempt.finish(AttemptStatus::TimedOut, e.to_string()),
                    other => attempt.finish(AttemptStatus::Failed, other.to_string()),
                }
                Some(classified)
            }
            Err(_) => {
                let detail = format!(
                    "no completion within {}ms",
                    action.attempt_timeout.as_millis()
                );
                attempt.finish(AttemptStatus::TimedOut, detail.clone());
                Some(HealError::AttemptTimedOut(detail))
            }
        };
        attempt.failure = failure;

        self.append(AuditRecord::coordinator(
            node_id,
            Some(kind),
            attempt_number,
            AuditStatus::from(&attempt.status),
            attempt.detail.clone(),
        ))
        .await;
        attempt
    }

    /// Resolve remediations left unfinished by a previous coordinator process.
    ///
    /// A `(node_id, action kind)` chain is unresolved when it has attempts
    /// but no `Succeeded` or `Fatal` record and did not end in a node skip.
    /// That includes chains stopped between attempts. An open attempt is
    /// closed with `TimedOut`, then the chain is marked `Fatal` once and
    /// notified: the alert that drove it is gone, so a human decides
    /// whether to re-raise it. Chains this coordinator is driving are left
    /// alone. The node lock stays the authority for anything still running.
    pub async fn recover(&self) -> Result<Vec<AuditRecord>, AuditError> {
        let records = self.audit.records().await?;

        let mut chains: HashMap<(String, ActionKind), Chain> = HashMap::new();
        let mut order = Vec::new();
        for record in records
            .iter()
            .filter(|r| r.origin == AuditOrigin::Coordinator && r.attempt_number > 0)
        {
            let Some(kind) = record.action_kind.clone() else {
                continue;
            };
            let key = (record.node_id.clone(), kind);
            let chain = chains.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                Chain::default()
            });
            chain.observe(record);
        }

        let mut appended = Vec::new();
        for key in order {
            let Some(chain) = chains.remove(&key).filter(|c| c.open) else {
                continue;
            };
            let (node_id, kind) = key;
            if self.inflight.contains(&node_id, &kind) {
                continue;
            }

            let mut last_detail = chain.detail;
            if !chain.last.is_attempt_terminal() {
                warn!(node_id = %node_id, action = %kind, attempt = chain.attempt, "Closing orphaned attempt");
                let record = AuditRecord::coordinator(
                    &node_id,
                    Some(&kind),
                    chain.attempt,
                    AuditStatus::TimedOut,
                    ORPHANED,
                );
                self.audit.append(record.clone()).await?;
                appended.push(record);
                last_detail = ORPHANED.to_string();
            }

            error!(
                node_id = %node_id,
                action = %kind,
                attempts = chain.attempt,
                detail = %last_detail,
                "Remediation FATAL: interrupted by coordinator restart, requires human attention"
            );
            let record = AuditRecord::coordinator(
                &node_id,
                Some(&kind),
                chain.attempt,
                AuditStatus::Fatal,
                format!("{INTERRUPTED} after {} attempts; last: {last_detail}", chain.attempt),
            );
            self.audit.append(record.clone()).await?;
            appended.push(record);

            self.publish(NotifyEvent::RemediationFatal {
                node_id: node_id.clone(),
                action_kind: kind.to_string(),
                final_status: "fatal".to_string(),
                attempts: chain.attempt,
                detail: format!("{INTERRUPTED}; last: {last_detail}"),
                timestamp: Utc::now(),
            })
            .await;
        }

        if !appended.is_empty() {
            info!(count = appended.len(), "Recovered unfinished remediations");
        }
        Ok(appended)
    }

    /// Remediations currently driven by this coordinator.
    #[must_use]
    pub fn in_flight(&self) -> Vec<InFlightRemediation> {
        self.inflight.snapshot()
    }

    /// Audit history for one node.
    pub async fn audit_for(&self, node_id: &str) -> Result<Vec<AuditRecord>, AuditError> {
        self.audit.records_for(node_id).await
    }

    /// Full audit history.
    pub async fn audit(&self) -> Result<Vec<AuditRecord>, AuditError> {
        self.audit.records().await
    }

    async fn skip(&self, node_id: &str, action: RemediationAction, reason: &str) -> RemediationOutcome {
        let mut attempt = RemediationAttempt::new(node_id, action.clone(), 1);
        attempt.finish(AttemptStatus::Skipped(reason.to_string()), reason);
        self.append(AuditRecord::coordinator(
            node_id,
            Some(&action.kind),
            1,
            AuditStatus::Skipped,
            reason,
        ))
        .await;
        RemediationOutcome {
            node_id: node_id.to_string(),
            action,
            attempts: vec![attempt],
            final_status: FinalStatus::Skipped(reason.to_string()),
            detail: reason.to_string(),
        }
    }

    async fn publish(&self, event: NotifyEvent) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        for (channel, result) in notifier.notify_and_wait(event).await {
            match result {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    warn!(channel = %channel, error = %e, "Remediation notification not delivered, channel may recover");
                }
                Err(e) => {
                    error!(channel = %channel, error = %e, "Failed to deliver remediation notification");
                }
            }
        }
    }

    async fn append(&self, record: AuditRecord) {
        if let Err(e) = self.audit.append(record).await {
            error!(error = %e, "Failed to append audit record");
        }
    }
}

/// Whether another attempt should follow `failure`.
///
/// Lock contention ends the remediation, unless the lock is held by one of
/// its own earlier attempts that failed or timed out without releasing it.
/// That lock goes stale under the configured TTL and the next attempt
/// reclaims it.
fn should_retry(failure: &HealError, earlier: &[RemediationAttempt]) -> bool {
    match failure {
        HealError::LockContention {
            holder: Some(holder),
            ..
        } => earlier
            .iter()
            .any(|a| a.status.allows_retry() && a.id.to_string() == *holder),
        other => other.is_retryable(),
    }
}

/// Coordinator audit trail of one `(node_id, action kind)`, replayed.
struct Chain {
    open: bool,
    attempt: u32,
    attempt_id: String,
    last: AuditStatus,
    detail: String,
    /// Ids of attempts that failed or timed out, whose node lock may linger
    unreleased: Vec<String>,
}

impl Default for Chain {
    fn default() -> Self {
        Self {
            open: false,
            attempt: 0,
            attempt_id: String::new(),
            last: AuditStatus::Pending,
            detail: String::new(),
            unreleased: Vec::new(),
        }
    }
}

impl Chain {
    fn observe(&mut self, record: &AuditRecord) {
        let current = self.open && record.attempt_number == self.attempt;
        match record.status {
            AuditStatus::Pending => {
                if !self.open {
                    self.unreleased.clear();
                }
                self.open = true;
                self.attempt = record.attempt_number;
                self.attempt_id = record
                    .detail
                    .strip_prefix("attempt ")
                    .unwrap_or_default()
                    .to_string();
                self.last = AuditStatus::Pending;
                self.detail.clear();
            }
            AuditStatus::Succeeded | AuditStatus::Fatal => self.open = false,
            // Coalesced and disabled skips belong to a remediation that never ran.
            AuditStatus::Skipped
                if record.detail == ALREADY_IN_PROGRESS || record.detail == AUTO_HEALING_DISABLED => {}
            // A node skip ends the chain unless our own earlier attempt holds the lock.
            AuditStatus::Skipped if current && self.last == AuditStatus::Running => {
                if self.unreleased.iter().any(|id| record.detail.contains(id.as_str())) {
                    self.last = AuditStatus::Skipped;
                    self.detail.clone_from(&record.detail);
                } else {
                    self.open = false;
                }
            }
            status @ (AuditStatus::Running | AuditStatus::Failed | AuditStatus::TimedOut) if current => {
                if status != AuditStatus::Running && !self.attempt_id.is_empty() {
                    self.unreleased.push(self.attempt_id.clone());
                }
                self.last = status;
                self.detail.clone_from(&record.detail);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::error::TransportError;
    use crate::selector::SelectorSettings;
    use crate::types::AttemptResult;
    use async_trait::async_trait;
    use notify::{ChannelError, NotifyChannel};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use super::transport::MockRemoteTransport;

    const STATUS_CHECK: &str = r#"{
        "AlarmName": "n1-status-check",
        "NewStateValue": "ALARM",
        "Trigger": {"MetricName": "StatusCheckFailed", "Dimensions": [{"name": "InstanceId", "value": "n1"}]}
    }"#;

    #[derive(Default)]
    struct Recording {
        titles: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotifyChannel for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn enabled(&self) -> bool {
            true
        }

        async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
            self.titles.lock().unwrap().push(event.title());
            Ok(())
        }
    }

    fn settings(max_attempts: u32) -> SelectorSettings {
        SelectorSettings {
            max_attempts,
            attempt_timeout: Duration::from_millis(50),
            ..SelectorSettings::default()
        }
    }

    fn coordinator(
        transport: MockRemoteTransport,
        max_attempts: u32,
    ) -> (DispatchCoordinator, Arc<MemoryAuditSink>, Arc<Recording>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let recording = Arc::new(Recording::default());
        let channel: Arc<dyn NotifyChannel> = recording.clone();
        let coordinator = DispatchCoordinator::new(
            ActionSelector::new(settings(max_attempts)),
            Arc::new(transport),
            audit.clone(),
        )
        .with_notifier(Arc::new(Notifier::with_channels(vec![channel])));
        (coordinator, audit, recording)
    }

    fn action(kind: ActionKind, max_attempts: u32) -> RemediationAction {
        RemediationAction::new(kind, "test", max_attempts, Duration::from_millis(50))
    }

    fn statuses(records: &[AuditRecord]) -> Vec<AuditStatus> {
        records.iter().map(|r| r.status).collect()
    }

    #[tokio::test]
    async fn test_status_check_alert_reboots_once() {
        let mut transport = MockRemoteTransport::new();
        transport
            .expect_execute()
            .times(1)
            .returning(|req| {
                assert_eq!(req.action, ActionKind::Reboot);
                Ok(AttemptResult::bare(AttemptStatus::Succeeded, "reboot accepted by systemctl"))
            });
        let (coordinator, audit, recording) = coordinator(transport, 3);

        let outcome = coordinator.handle_alert(STATUS_CHECK).await.unwrap();
        assert_eq!(outcome.final_status, FinalStatus::Succeeded);
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.action.kind, ActionKind::Reboot);

        let records = audit.records_for("n1").await.unwrap();
        assert_eq!(
            statuses(&records),
            vec![
                AuditStatus::Decided,
                AuditStatus::Pending,
                AuditStatus::Running,
                AuditStatus::Succeeded
            ]
        );
        assert_eq!(*recording.titles.lock().unwrap(), vec!["Remediated n1: reboot".to_string()]);
    }

    #[tokio::test]
    async fn test_exhaustion_is_fatal_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut transport = MockRemoteTransport::new();
        transport.expect_execute().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(AttemptResult::bare(AttemptStatus::Failed, "exit 1: disk busy"))
        });
        let (coordinator, audit, recording) = coordinator(transport, 3);

        let outcome = coordinator
            .remediate("n2", action(ActionKind::CleanupDisk, 3))
            .await;
        assert!(outcome.is_fatal());
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(outcome.fatal_error(), Some(HealError::Fatal { attempts: 3, .. })));

        let records = audit.records().await.unwrap();
        let fatal: Vec<_> = records.iter().filter(|r| r.status == AuditStatus::Fatal).collect();
        assert_eq!(fatal.len(), 1);
        assert_eq!(records.last().unwrap().status, AuditStatus::Fatal);
        let numbers: Vec<u32> = outcome.attempts.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(recording.titles.lock().unwrap().len(), 1);
        assert!(recording.titles.lock().unwrap()[0].contains("FATAL"));
    }

    #[tokio::test]
    async fn test_retries_are_spaced_by_attempt_timeout() {
        let mut transport = MockRemoteTransport::new();
        transport
            .expect_execute()
            .returning(|_| Ok(AttemptResult::bare(AttemptStatus::Failed, "nope")));
        let (coordinator, _, _) = coordinator(transport, 3);

        let outcome = coordinator.remediate("n2", action(ActionKind::ClearCache, 3)).await;
        let starts: Vec<_> = outcome
            .attempts
            .iter()
            .map(|a| a.started_at.unwrap())
            .collect();
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= chrono::Duration::milliseconds(45));
        }
    }

    #[tokio::test]
    async fn test_unreachable_node_is_retried_then_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut transport = MockRemoteTransport::new();
        transport.expect_execute().returning(move |req| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TransportError::Unreachable {
                    node_id: req.node_id.clone(),
                    reason: "connection refused".into(),
                })
            } else {
                Ok(AttemptResult::bare(AttemptStatus::Succeeded, "freed 128 MB"))
            }
        });
        let (coordinator, audit, _) = coordinator(transport, 3);

        let outcome = coordinator.remediate("n4", action(ActionKind::ClearCache, 3)).await;
        assert_eq!(outcome.final_status, FinalStatus::Succeeded);
        assert_eq!(outcome.attempts[0].status, AttemptStatus::Failed);
        assert!(outcome.attempts[0].detail.contains("Node not found"));
        assert!(matches!(outcome.attempts[0].failure, Some(HealError::NodeNotFound(_))));
        assert!(outcome.attempts[1].failure.is_none());
        assert_eq!(
            statuses(&audit.records().await.unwrap()),
            vec![
                AuditStatus::Pending,
                AuditStatus::Running,
                AuditStatus::Failed,
                AuditStatus::Pending,
                AuditStatus::Running,
                AuditStatus::Succeeded
            ]
        );
    }

    #[tokio::test]
    async fn test_node_skip_ends_without_fatal() {
        let mut transport = MockRemoteTransport::new();
        transport.expect_execute().times(1).returning(|_| {
            Ok(AttemptResult::bare(
                AttemptStatus::Skipped("healing in progress".into()),
                "lock held",
            ))
        });
        let (coordinator, audit, recording) = coordinator(transport, 3);

        let outcome = coordinator.remediate("n1", action(ActionKind::Reboot, 3)).await;
        assert_eq!(outcome.final_status, FinalStatus::Skipped("healing in progress".into()));
        assert!(!audit
            .records()
            .await
            .unwrap()
            .iter()
            .any(|r| r.status == AuditStatus::Fatal));
        assert!(recording.titles.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_alert_is_dropped() {
        let (coordinator, audit, _) = coordinator(MockRemoteTransport::new(), 3);

        let err = coordinator
            .handle_alert(r#"{"AlarmName": "mystery"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, HealError::MalformedAlert(_)));

        let records = audit.records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, AuditStatus::Dropped);
        assert_eq!(records[0].node_id, "unknown");
    }

    #[tokio::test]
    async fn test_disabled_records_skip_without_dispatch() {
        let (coordinator, audit, _) = coordinator(MockRemoteTransport::new(), 3);
        let coordinator = coordinator.with_auto_healing(false);

        let outcome = coordinator.handle_alert(STATUS_CHECK).await.unwrap();
        assert_eq!(
            outcome.final_status,
            FinalStatus::Skipped(AUTO_HEALING_DISABLED.into())
        );
        assert_eq!(
            statuses(&audit.records().await.unwrap()),
            vec![AuditStatus::Decided, AuditStatus::Skipped]
        );
        assert!(coordinator.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_non_terminal_node_status_counts_as_failed() {
        let mut transport = MockRemoteTransport::new();
        transport
            .expect_execute()
            .returning(|_| Ok(AttemptResult::bare(AttemptStatus::Running, "")));
        let (coordinator, _, _) = coordinator(transport, 1);

        let attempt = coordinator
            .dispatch(&action(ActionKind::ClearCache, 1), "n1", 1)
            .await;
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert!(attempt.detail.contains("non-terminal"));
        assert!(matches!(attempt.failure, Some(HealError::ActionFailed(_))));
    }

    #[tokio::test]
    async fn test_node_skip_for_own_unreleased_lock_is_retried() {
        let first_id = Arc::new(Mutex::new(String::new()));
        let calls = Arc::new(AtomicU32::new(0));
        let (seen, counter) = (first_id.clone(), calls.clone());
        let mut transport = MockRemoteTransport::new();
        transport.expect_execute().returning(move |req| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => {
                    *seen.lock().unwrap() = req.attempt_id.to_string();
                    Ok(AttemptResult::bare(AttemptStatus::TimedOut, "step budget exceeded"))
                }
                1 => {
                    let mut result = AttemptResult::bare(
                        AttemptStatus::Skipped("healing in progress".into()),
                        "lock held",
                    );
                    result.held_by = Some(seen.lock().unwrap().clone());
                    Ok(result)
                }
                _ => Ok(AttemptResult::bare(AttemptStatus::Succeeded, "reboot accepted")),
            }
        });
        let (coordinator, _, _) = coordinator(transport, 3);

        let outcome = coordinator.remediate("n1", action(ActionKind::Reboot, 3)).await;
        assert_eq!(outcome.final_status, FinalStatus::Succeeded);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.attempts[0].id.to_string(), *first_id.lock().unwrap());
        assert!(matches!(outcome.attempts[1].status, AttemptStatus::Skipped(_)));
    }

    #[tokio::test]
    async fn test_node_skip_for_foreign_lock_ends_without_retry() {
        let mut transport = MockRemoteTransport::new();
        transport.expect_execute().times(1).returning(|_| {
            let mut result = AttemptResult::bare(
                AttemptStatus::Skipped("healing in progress".into()),
                "lock held",
            );
            result.held_by = Some(uuid::Uuid::new_v4().to_string());
            Ok(result)
        });
        let (coordinator, _, recording) = coordinator(transport, 3);

        let outcome = coordinator.remediate("n1", action(ActionKind::Reboot, 3)).await;
        assert_eq!(outcome.final_status, FinalStatus::Skipped("healing in progress".into()));
        assert_eq!(outcome.attempts.len(), 1);
        assert!(recording.titles.lock().unwrap().is_empty());
    }

    #[test]
    fn test_retry_decision() {
        let mut earlier = RemediationAttempt::new("n1", action(ActionKind::Reboot, 3), 1);
        earlier.finish(AttemptStatus::TimedOut, "no completion within 50ms");
        let contention = |holder: Option<String>| HealError::LockContention {
            node_id: "n1".into(),
            holder,
            reason: "healing in progress".into(),
        };

        assert!(should_retry(&contention(Some(earlier.id.to_string())), &[earlier.clone()]));
        assert!(!should_retry(&contention(Some("other".into())), &[earlier.clone()]));
        assert!(!should_retry(&contention(None), &[earlier.clone()]));
        assert!(should_retry(&HealError::ActionFailed("x".into()), &[]));

        // An earlier attempt that succeeded released its lock.
        earlier.status = AttemptStatus::Succeeded;
        assert!(!should_retry(&contention(Some(earlier.id.to_string())), &[earlier]));
    }

    async fn seed(audit: &MemoryAuditSink, node_id: &str, kind: &ActionKind, trail: &[(u32, AuditStatus, &str)]) {
        for (n, status, detail) in trail {
            audit
                .append(AuditRecord::coordinator(node_id, Some(kind), *n, *status, *detail))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_recover_closes_open_chains_as_fatal() {
        let (coordinator, audit, recording) = coordinator(MockRemoteTransport::new(), 3);
        let kind = ActionKind::CleanupDisk;
        seed(
            &audit,
            "n2",
            &kind,
            &[
                (1, AuditStatus::Pending, "attempt a1"),
                (1, AuditStatus::Running, ""),
                (1, AuditStatus::Failed, "exit 1"),
                (2, AuditStatus::Pending, "attempt a2"),
                (2, AuditStatus::Running, ""),
            ],
        )
        .await;
        // Node-side records never count as open coordinator chains.
        audit
            .append(AuditRecord::node("n2", &kind, 3, AuditStatus::Running, ""))
            .await
            .unwrap();

        let appended = coordinator.recover().await.unwrap();
        assert_eq!(
            appended.iter().map(|r| (r.attempt_number, r.status)).collect::<Vec<_>>(),
            vec![(2, AuditStatus::TimedOut), (2, AuditStatus::Fatal)]
        );
        assert_eq!(appended[0].detail, ORPHANED);
        assert!(appended[1].detail.starts_with(INTERRUPTED));
        assert_eq!(*recording.titles.lock().unwrap(), vec!["Remediation FATAL on n2: cleanup_disk".to_string()]);

        assert!(coordinator.recover().await.unwrap().is_empty());
        assert_eq!(recording.titles.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recover_fails_chain_stopped_between_attempts() {
        let (coordinator, audit, recording) = coordinator(MockRemoteTransport::new(), 3);
        let kind = ActionKind::Reboot;
        seed(
            &audit,
            "n1",
            &kind,
            &[
                (1, AuditStatus::Pending, "attempt a1"),
                (1, AuditStatus::Running, ""),
                (1, AuditStatus::TimedOut, "no completion within 50ms"),
                (2, AuditStatus::Pending, "attempt a2"),
                (2, AuditStatus::Running, ""),
                (2, AuditStatus::Skipped, "lock held by attempt a1 since 2024-12-05T10:00:00+00:00"),
            ],
        )
        .await;

        let appended = coordinator.recover().await.unwrap();
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].status, AuditStatus::Fatal);
        assert_eq!(appended[0].attempt_number, 2);
        assert!(appended[0].detail.contains("lock held by attempt a1"));
        assert_eq!(recording.titles.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recover_ignores_coalesced_skip_inside_open_chain() {
        let (coordinator, audit, _) = coordinator(MockRemoteTransport::new(), 3);
        seed(
            &audit,
            "n5",
            &ActionKind::Reboot,
            &[
                (1, AuditStatus::Pending, "attempt e1"),
                (1, AuditStatus::Running, ""),
                (1, AuditStatus::Skipped, ALREADY_IN_PROGRESS),
            ],
        )
        .await;

        let appended = coordinator.recover().await.unwrap();
        assert_eq!(
            appended.iter().map(|r| r.status).collect::<Vec<_>>(),
            vec![AuditStatus::TimedOut, AuditStatus::Fatal]
        );
    }

    #[tokio::test]
    async fn test_recover_leaves_resolved_and_live_chains() {
        let (coordinator, audit, recording) = coordinator(MockRemoteTransport::new(), 3);
        seed(
            &audit,
            "n1",
            &ActionKind::Reboot,
            &[
                (1, AuditStatus::Pending, "attempt a1"),
                (1, AuditStatus::Running, ""),
                (1, AuditStatus::Succeeded, "ok"),
                (1, AuditStatus::Skipped, ALREADY_IN_PROGRESS),
            ],
        )
        .await;
        seed(
            &audit,
            "n2",
            &ActionKind::ClearCache,
            &[
                (1, AuditStatus::Pending, "attempt b1"),
                (1, AuditStatus::Running, ""),
                (1, AuditStatus::Failed, "exit 1"),
                (1, AuditStatus::Fatal, "1 attempts exhausted; last: exit 1"),
            ],
        )
        .await;
        seed(
            &audit,
            "n3",
            &ActionKind::Reboot,
            &[
                (1, AuditStatus::Pending, "attempt c1"),
                (1, AuditStatus::Running, ""),
                (1, AuditStatus::Skipped, "lock held by attempt zz since 2024-12-05T10:00:00+00:00"),
            ],
        )
        .await;
        seed(
            &audit,
            "n4",
            &ActionKind::Reboot,
            &[(1, AuditStatus::Pending, "attempt d1"), (1, AuditStatus::Running, "")],
        )
        .await;
        let _live = coordinator
            .inflight
            .try_claim("n4", &ActionKind::Reboot, uuid::Uuid::new_v4())
            .unwrap();

        assert!(coordinator.recover().await.unwrap().is_empty());
        assert!(recording.titles.lock().unwrap().is_empty());
    }
}
