//! Alert-to-action decision table.
//!
//! [`ActionSelector::select`] is a pure, total function over the alert's
//! discriminant fields: every alert yields an action, `NoOp` included. When
//! several rules match, the most specific wins and ties go to the rule
//! listed first.

use std::time::Duration;
use tracing::{debug, warn};

use crate::alerts::{AlertSource, CheckKind, CheckState, HealthAlert};
use crate::prometheus::MetricsLookup;
use crate::types::{ActionKind, RemediationAction};

/// Rationale used when no rule matches.
pub const UNRECOGNIZED: &str = "unrecognized alert shape";

/// Attempt defaults applied to selected actions.
#[derive(Debug, Clone)]
pub struct SelectorSettings {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    /// Window over which CPU must stay above threshold to count as sustained
    pub cpu_sustain_window: Duration,
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(300),
            cpu_sustain_window: Duration::from_secs(15 * 60),
        }
    }
}

type Matcher = fn(&HealthAlert) -> Option<(ActionKind, String)>;

struct Rule {
    name: &'static str,
    specificity: u8,
    matcher: Matcher,
}

/// Listed in tie-break order.
const RULES: &[Rule] = &[
    Rule {
        name: "status_check",
        specificity: 1,
        matcher: status_check,
    },
    Rule {
        name: "cpu_high",
        specificity: 3,
        matcher: cpu_high,
    },
    Rule {
        name: "memory_high",
        specificity: 3,
        matcher: memory_high,
    },
    Rule {
        name: "disk_high",
        specificity: 3,
        matcher: disk_high,
    },
    Rule {
        name: "service_critical",
        specificity: 3,
        matcher: service_critical,
    },
    Rule {
        name: "action_hint",
        specificity: 2,
        matcher: action_hint,
    },
];

fn status_check(alert: &HealthAlert) -> Option<(ActionKind, String)> {
    (alert.source == AlertSource::StatusCheck).then(|| {
        (
            ActionKind::Reboot,
            format!("status check failed on {}", alert.node_id),
        )
    })
}

fn threshold_rule(alert: &HealthAlert, metric: &str, kind: ActionKind) -> Option<(ActionKind, String)> {
    (alert.source == AlertSource::MetricThreshold && alert.metric_is(metric) && alert.exceeds_threshold())
        .then(|| {
            let observed = alert
                .observed_value
                .map_or_else(|| "unknown".to_string(), |v| v.to_string());
            let threshold = alert
                .threshold
                .map_or_else(|| "unknown".to_string(), |v| v.to_string());
            (
                kind,
                format!("{metric} {observed} above threshold {threshold} on {}", alert.node_id),
            )
        })
}

fn cpu_high(alert: &HealthAlert) -> Option<(ActionKind, String)> {
    threshold_rule(alert, "CPUUtilization", ActionKind::CollectDiagnostics)
}

fn memory_high(alert: &HealthAlert) -> Option<(ActionKind, String)> {
    threshold_rule(alert, "MemoryUtilization", ActionKind::ClearCache)
}

fn disk_high(alert: &HealthAlert) -> Option<(ActionKind, String)> {
    threshold_rule(alert, "DiskUtilization", ActionKind::CleanupDisk)
}

fn service_critical(alert: &HealthAlert) -> Option<(ActionKind, String)> {
    if alert.source != AlertSource::ActiveCheck {
        return None;
    }
    let check = alert.check.as_ref()?;
    if check.kind != CheckKind::Service || check.state != CheckState::Critical {
        return None;
    }
    let service = check.service.as_deref()?.trim();
    if service.is_empty() {
        return None;
    }
    Some((
        ActionKind::RestartService(service.to_string()),
        format!("service check for {service} critical on {}", alert.node_id),
    ))
}

fn action_hint(alert: &HealthAlert) -> Option<(ActionKind, String)> {
    if alert.source != AlertSource::ActiveCheck {
        return None;
    }
    let hint = alert.action_hint.as_deref()?;
    let service = alert.check.as_ref().and_then(|c| c.service.as_deref());
    let kind = ActionKind::from_hint(hint, service)?;
    Some((kind, format!("alert requested {hint} on {}", alert.node_id)))
}

/// Maps alerts to remediation actions.
#[derive(Debug, Clone, Default)]
pub struct ActionSelector {
    settings: SelectorSettings,
}

impl ActionSelector {
    #[must_use]
    pub fn new(settings: SelectorSettings) -> Self {
        Self { settings }
    }

    #[must_use]
    pub fn settings(&self) -> &SelectorSettings {
        &self.settings
    }

    /// Decide the action for an alert. Never fails.
    #[must_use]
    pub fn select(&self, alert: &HealthAlert) -> RemediationAction {
        if alert.resolved {
            return self.action(
                ActionKind::NoOp,
                format!("alert resolved on {} ({})", alert.node_id, alert.summary()),
            );
        }

        let mut best: Option<(&Rule, ActionKind, String)> = None;
        for rule in RULES {
            let Some((kind, why)) = (rule.matcher)(alert) else {
                continue;
            };
            if best.as_ref().is_none_or(|(b, _, _)| rule.specificity > b.specificity) {
                best = Some((rule, kind, why));
            }
        }

        match best {
            Some((rule, kind, why)) => {
                debug!(node_id = %alert.node_id, rule = rule.name, action = %kind, "Rule matched");
                self.action(kind, format!("{why} ({})", alert.summary()))
            }
            None => self.action(
                ActionKind::NoOp,
                format!("{UNRECOGNIZED} ({})", alert.summary()),
            ),
        }
    }

    /// Like [`ActionSelector::select`], refining CPU decisions with telemetry.
    ///
    /// If every sample in the sustain window is above the alert's threshold
    /// the load is sustained and the decision becomes an advisory `NoOp`.
    /// Lookup failures fall back to the plain decision.
    pub async fn select_with_telemetry(
        &self,
        alert: &HealthAlert,
        telemetry: &dyn MetricsLookup,
    ) -> RemediationAction {
        let action = self.select(alert);
        if action.kind != ActionKind::CollectDiagnostics || !alert.metric_is("CPUUtilization") {
            return action;
        }
        let Some(threshold) = alert.threshold else {
            return action;
        };
        let Some(metric) = alert.metric_name.as_deref() else {
            return action;
        };

        let window = self.settings.cpu_sustain_window;
        match telemetry.recent_samples(&alert.node_id, metric, window).await {
            Ok(samples) if !samples.is_empty() && samples.iter().all(|s| s.value > threshold) => {
                let mins = window.as_secs() / 60;
                self.action(
                    ActionKind::NoOp,
                    format!(
                        "CPUUtilization above {threshold} for all {} samples over {mins}m on {}; \
                         sustained load, optimization is advisory",
                        samples.len(),
                        alert.node_id
                    ),
                )
            }
            Ok(_) => action,
            Err(e) => {
                warn!(node_id = %alert.node_id, error = %e, "Telemetry lookup failed, keeping plain decision");
                action
            }
        }
    }

    fn action(&self, kind: ActionKind, rationale: String) -> RemediationAction {
        let max_attempts = match kind {
            ActionKind::NoOp | ActionKind::CollectDiagnostics => 1,
            _ => self.settings.max_attempts,
        };
        RemediationAction::new(kind, rationale, max_attempts, self.settings.attempt_timeout)
    }
}
