//! Canonical alert types produced by the normalizer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where an alert originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSource {
    /// Metric crossed a threshold (CPU, memory, disk, ...)
    MetricThreshold,
    /// Platform status check failed
    StatusCheck,
    /// Active monitoring check (service or host check)
    ActiveCheck,
}

impl AlertSource {
    /// Parse an explicit source label: `StatusCheck`, `status_check`,
    /// `status-check` and the like. Unknown labels yield `None`.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        let folded: String = label
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match folded.as_str() {
            "statuscheck" => Some(Self::StatusCheck),
            "metricthreshold" | "threshold" | "metric" => Some(Self::MetricThreshold),
            "activecheck" | "check" => Some(Self::ActiveCheck),
            _ => None,
        }
    }
}

/// What an active check was probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Service,
    Host,
    Other,
}

impl CheckKind {
    /// Parse from a loose check label.
    #[must_use]
    pub fn parse(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "service" | "svc" => Self::Service,
            "host" | "node" => Self::Host,
            _ => Self::Other,
        }
    }
}

/// Result reported by an active check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl CheckState {
    /// Parse from a loose state label (`CRITICAL`, `crit`, `2`, ...).
    #[must_use]
    pub fn parse(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "ok" | "up" | "0" => Self::Ok,
            "warning" | "warn" | "1" => Self::Warning,
            "critical" | "crit" | "down" | "2" => Self::Critical,
            _ => Self::Unknown,
        }
    }
}

/// Active-check details carried by [`AlertSource::ActiveCheck`] alerts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckResult {
    /// What was checked
    pub kind: CheckKind,
    /// Reported state
    pub state: CheckState,
    /// Service name, when the check targets a service
    pub service: Option<String>,
}

/// Canonical health alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAlert {
    /// Origin of the alert
    pub source: AlertSource,
    /// Opaque id of the target node
    pub node_id: String,
    /// Metric name (present for `MetricThreshold`)
    pub metric_name: Option<String>,
    /// Observed metric value
    pub observed_value: Option<f64>,
    /// Threshold that was crossed
    pub threshold: Option<f64>,
    /// When the alert was raised
    pub raised_at: DateTime<Utc>,
    /// Alarm name as given by the source
    #[serde(default)]
    pub alarm_name: Option<String>,
    /// Active-check result
    #[serde(default)]
    pub check: Option<CheckResult>,
    /// Action hint supplied by the source (`{node_id, action}` style)
    #[serde(default)]
    pub action_hint: Option<String>,
    /// True when the source reports the condition as cleared
    #[serde(default)]
    pub resolved: bool,
    /// Free-text description from the source
    #[serde(default)]
    pub description: Option<String>,
}

impl HealthAlert {
    /// Minimal alert for a node; callers fill in the rest.
    #[must_use]
    pub fn new(source: AlertSource, node_id: impl Into<String>) -> Self {
        Self {
            source,
            node_id: node_id.into(),
            metric_name: None,
            observed_value: None,
            threshold: None,
            raised_at: Utc::now(),
            alarm_name: None,
            check: None,
            action_hint: None,
            resolved: false,
            description: None,
        }
    }

    /// Set the metric reading.
    #[must_use]
    pub fn with_metric(
        mut self,
        name: impl Into<String>,
        observed: Option<f64>,
        threshold: Option<f64>,
    ) -> Self {
        self.metric_name = Some(name.into());
        self.observed_value = observed;
        self.threshold = threshold;
        self
    }

    /// Set the active-check result.
    #[must_use]
    pub fn with_check(mut self, check: CheckResult) -> Self {
        self.check = Some(check);
        self
    }

    /// Whether the metric name matches, ignoring case.
    #[must_use]
    pub fn metric_is(&self, name: &str) -> bool {
        self.metric_name
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case(name))
    }

    /// Whether the reading breaches its threshold.
    ///
    /// Sources only raise threshold alerts on breach, so a missing value or
    /// threshold counts as breached; an explicit reading at or under the
    /// threshold does not.
    #[must_use]
    pub fn exceeds_threshold(&self) -> bool {
        match (self.observed_value, self.threshold) {
            (Some(observed), Some(threshold)) => observed > threshold,
            _ => true,
        }
    }

    /// Short description of the alert's discriminant fields, for rationales.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut parts = vec![format!("source={:?}", self.source)];
        if let Some(metric) = &self.metric_name {
            parts.push(format!("metric={metric}"));
        }
        if let Some(observed) = self.observed_value {
            parts.push(format!("observed={observed}"));
        }
        if let Some(threshold) = self.threshold {
            parts.push(format!("threshold={threshold}"));
        }
        if let Some(check) = &self.check {
            parts.push(format!("check={:?}/{:?}", check.kind, check.state));
            if let Some(service) = &check.service {
                parts.push(format!("service={service}"));
            }
        }
        if let Some(hint) = &self.action_hint {
            parts.push(format!("hint={hint}"));
        }
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exceeds_threshold() {
        let alert = HealthAlert::new(AlertSource::MetricThreshold, "n1")
            .with_metric("DiskUtilization", Some(95.0), Some(90.0));
        assert!(alert.exceeds_threshold());

        let alert = HealthAlert::new(AlertSource::MetricThreshold, "n1")
            .with_metric("DiskUtilization", Some(90.0), Some(90.0));
        assert!(!alert.exceeds_threshold());

        let alert = HealthAlert::new(AlertSource::MetricThreshold, "n1")
            .with_metric("DiskUtilization", None, Some(90.0));
        assert!(alert.exceeds_threshold());
    }

    #[test]
    fn test_metric_is_case_insensitive() {
        let alert = HealthAlert::new(AlertSource::MetricThreshold, "n1")
            .with_metric("cpuutilization", None, None);
        assert!(alert.metric_is("CPUUtilization"));
        assert!(!alert.metric_is("MemoryUtilization"));
    }

    #[test]
    fn test_check_parsing() {
        assert_eq!(CheckState::parse("CRITICAL"), CheckState::Critical);
        assert_eq!(CheckState::parse("2"), CheckState::Critical);
        assert_eq!(CheckState::parse("ok"), CheckState::Ok);
        assert_eq!(CheckState::parse("weird"), CheckState::Unknown);
        assert_eq!(CheckKind::parse("Service"), CheckKind::Service);
        assert_eq!(CheckKind::parse("ping"), CheckKind::Other);
    }

    #[test]
    fn test_summary_mentions_discriminants() {
        let alert = HealthAlert::new(AlertSource::ActiveCheck, "n1").with_check(CheckResult {
            kind: CheckKind::Service,
            state: CheckState::Critical,
            service: Some("nginx".into()),
        });
        let summary = alert.summary();
        assert!(summary.contains("ActiveCheck"));
        assert!(summary.contains("service=nginx"));
    }
}
