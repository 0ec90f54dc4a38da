//! Alert normalization: heterogeneous payloads in, [`HealthAlert`] out.
//!
//! Accepted shapes:
//! - SNS-style envelopes (`Records[0].Sns.Message`), unwrapped first
//! - Threshold alarms (`AlarmName`, `NewStateValue`, `Trigger.{MetricName, Threshold, Dimensions}`)
//! - Check hints (`{node_id, action, service, state}`)
//! - Plain text, where the node id is recovered by pattern
//!
//! Unknown fields are ignored. Normalization is pure.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::debug;

use super::types::{AlertSource, CheckKind, CheckResult, CheckState, HealthAlert};
use crate::error::NormalizeError;

/// Explicit node id fields, in lookup order.
const NODE_ID_FIELDS: &[&str] = &["node_id", "nodeId", "instance_id", "InstanceId", "instanceId"];

/// Dimension / tag keys that carry a node id.
const NODE_ID_KEYS: &[&str] = &["NodeId", "node_id", "nodeId", "InstanceId", "instance_id"];

static INSTANCE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(i-[a-z0-9]{4,})\b").expect("static regex"));

/// First datapoint in a CloudWatch `NewStateReason`, e.g. `[95.2 (12/05/24 10:00:00)]`.
static STATE_REASON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\s*(-?\d+(?:\.\d+)?)").expect("static regex"));

/// Normalize a raw request body (JSON or plain text).
pub fn normalize_body(body: &str) -> Result<HealthAlert, NormalizeError> {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => normalize(&value),
        Err(_) => normalize_text(body),
    }
}

/// Normalize a JSON payload.
pub fn normalize(raw: &Value) -> Result<HealthAlert, NormalizeError> {
    match unwrap_envelope(raw) {
        Unwrapped::Json(message) => normalize_object(&message),
        Unwrapped::Text(text) => normalize_text(&text),
    }
}

enum Unwrapped {
    Json(Value),
    Text(String),
}

fn unwrap_envelope(raw: &Value) -> Unwrapped {
    let message = raw
        .get("Records")
        .and_then(|r| r.get(0))
        .and_then(|r| r.get("Sns"))
        .and_then(|s| s.get("Message"));

    match message {
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(inner) if inner.is_object() => Unwrapped::Json(inner),
            _ => {
                debug!("SNS message is not JSON, treating as plain text");
                Unwrapped::Text(s.clone())
            }
        },
        Some(inner) => Unwrapped::Json(inner.clone()),
        None => match raw {
            Value::String(s) => Unwrapped::Text(s.clone()),
            other => Unwrapped::Json(other.clone()),
        },
    }
}

fn normalize_text(text: &str) -> Result<HealthAlert, NormalizeError> {
    let node_id = INSTANCE_ID_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| NormalizeError::MalformedAlert("plain-text alert without node id".into()))?;

    let mut alert = HealthAlert::new(AlertSource::ActiveCheck, node_id);
    alert.description = Some(text.trim().to_string());
    classify_by_name(&mut alert, text);
    Ok(alert)
}

fn normalize_object(message: &Value) -> Result<HealthAlert, NormalizeError> {
    if !message.is_object() {
        return Err(NormalizeError::MalformedAlert("payload is not an object".into()));
    }

    let node_id = extract_node_id(message)
        .ok_or_else(|| NormalizeError::MalformedAlert("no node id field, dimension or tag".into()))?;

    let explicit_source =
        str_field(message, &["source", "Source", "alert_source"]).and_then(|label| AlertSource::parse(&label));
    let trigger = message.get("Trigger");
    let alarm_name = str_field(message, &["AlarmName", "alarm_name", "alarmName"]);
    let metric_name = trigger
        .and_then(|t| str_field(t, &["MetricName"]))
        .or_else(|| str_field(message, &["metric_name", "MetricName", "metric"]));

    let mut alert = HealthAlert::new(AlertSource::ActiveCheck, node_id);
    alert.alarm_name.clone_from(&alarm_name);
    alert.raised_at = str_field(message, &["StateChangeTime", "raised_at", "timestamp"])
        .and_then(|s| parse_timestamp(&s))
        .unwrap_or_else(Utc::now);
    alert.description = str_field(message, &["AlarmDescription", "description", "output"]);
    alert.resolved = is_resolved(message);

    let is_alarm = trigger.is_some()
        || alarm_name.is_some()
        || metric_name.is_some()
        || matches!(
            explicit_source,
            Some(AlertSource::StatusCheck | AlertSource::MetricThreshold)
        );

    if is_alarm {
        alert.threshold = trigger
            .and_then(|t| num_field(t, &["Threshold"]))
            .or_else(|| num_field(message, &["threshold", "Threshold"]));
        alert.observed_value = num_field(message, &["observed_value", "value", "observedValue"])
            .or_else(|| {
                str_field(message, &["NewStateReason"]).and_then(|reason| parse_state_reason(&reason))
            });

        match &metric_name {
            Some(metric) if metric.to_lowercase().contains("statuscheckfailed") => {
                alert.source = AlertSource::StatusCheck;
                alert.metric_name = Some(metric.clone());
            }
            Some(metric) => {
                alert.source = AlertSource::MetricThreshold;
                alert.metric_name = Some(metric.clone());
                if let Some(name) = &alarm_name {
                    if is_status_check_name(name) {
                        alert.source = AlertSource::StatusCheck;
                    }
                }
            }
            None => classify_by_name(&mut alert, alarm_name.as_deref().unwrap_or_default()),
        }
    } else {
        alert.check = extract_check(message);
        alert.action_hint = str_field(message, &["action", "healing_action"]);
    }

    // A stated source beats anything inferred from names.
    if let Some(source) = explicit_source {
        alert.source = source;
    }

    Ok(alert)
}

/// Infer source and metric from an alarm name or free text.
fn classify_by_name(alert: &mut HealthAlert, name: &str) {
    let lower = name.to_lowercase();
    if is_status_check_name(&lower) {
        alert.source = AlertSource::StatusCheck;
        return;
    }

    let metric = if lower.contains("cpu") {
        Some("CPUUtilization")
    } else if lower.contains("memory") {
        Some("MemoryUtilization")
    } else if lower.contains("disk") {
        Some("DiskUtilization")
    } else {
        None
    };

    if let Some(metric) = metric {
        alert.source = AlertSource::MetricThreshold;
        alert.metric_name = Some(metric.to_string());
    }
}

fn is_status_check_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("status-check") || lower.contains("statuscheck") || lower.contains("status check")
}

fn is_resolved(message: &Value) -> bool {
    let state = str_field(message, &["NewStateValue", "status"]).unwrap_or_default();
    state.eq_ignore_ascii_case("ok") || state.eq_ignore_ascii_case("resolved")
}

fn extract_check(message: &Value) -> Option<CheckResult> {
    let service = str_field(message, &["service", "service_name", "serviceName"]);
    let check_label = str_field(message, &["check", "check_type", "checkType"]);
    let state_label = str_field(message, &["state", "result", "check_state"]);

    if service.is_none() && check_label.is_none() && state_label.is_none() {
        return None;
    }

    let kind = match (&check_label, &service) {
        (Some(label), _) => CheckKind::parse(label),
        (None, Some(_)) => CheckKind::Service,
        (None, None) => CheckKind::Host,
    };
    let state = state_label
        .as_deref()
        .map_or(CheckState::Unknown, CheckState::parse);

    Some(CheckResult {
        kind,
        state,
        service,
    })
}

/// Node id from, in order: explicit field, trigger dimensions, tags, raw text.
fn extract_node_id(message: &Value) -> Option<String> {
    if let Some(id) = str_field(message, NODE_ID_FIELDS) {
        return Some(id);
    }

    let dimensions = message
        .get("Trigger")
        .and_then(|t| t.get("Dimensions"))
        .or_else(|| message.get("dimensions"));
    if let Some(id) = dimensions.and_then(|d| lookup_pairs(d, &["name", "Name"], &["value", "Value"])) {
        return Some(id);
    }

    let tags = message.get("Tags").or_else(|| message.get("tags"));
    if let Some(id) = tags.and_then(|t| lookup_pairs(t, &["Key", "key"], &["Value", "value"])) {
        return Some(id);
    }

    str_field(message, &["raw_message", "message"]).and_then(|text| {
        INSTANCE_ID_RE
            .captures(&text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    })
}

/// Find a node id in either `[{name, value}, ...]` or `{name: value}` form.
fn lookup_pairs(container: &Value, key_fields: &[&str], value_fields: &[&str]) -> Option<String> {
    match container {
        Value::Array(items) => items.iter().find_map(|item| {
            let key = str_field(item, key_fields)?;
            if NODE_ID_KEYS.iter().any(|k| k.eq_ignore_ascii_case(&key)) {
                str_field(item, value_fields)
            } else {
                None
            }
        }),
        Value::Object(_) => str_field(container, NODE_ID_KEYS),
        _ => None,
    }
}

/// First non-empty string among `fields`.
fn str_field(value: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|f| {
        value
            .get(*f)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
    })
}

/// First numeric field among `fields`; numeric strings are accepted.
fn num_field(value: &Value, fields: &[&str]) -> Option<f64> {
    fields.iter().find_map(|f| match value.get(*f)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn parse_state_reason(reason: &str) -> Option<f64> {
    STATE_REASON_RE
        .captures(reason)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// RFC 3339, or CloudWatch's `2024-01-01T00:00:00.000+0000`.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cloudwatch_alarm() -> Value {
        json!({
            "AlarmName": "web-1-disk-high",
            "NewStateValue": "ALARM",
            "NewStateReason": "Threshold Crossed: 1 datapoint [95.0 (05/12/24 10:00:00)] was greater than the threshold (90.0).",
            "StateChangeTime": "2024-12-05T10:00:00.000+0000",
            "Trigger": {
                "MetricName": "DiskUtilization",
                "Namespace": "CWAgent",
                "Threshold": 90.0,
                "Dimensions": [{"name": "InstanceId", "value": "i-0abc1234"}]
            }
        })
    }

    #[test]
    fn test_threshold_alarm_with_dimension_list() {
        let alert = normalize(&cloudwatch_alarm()).unwrap();
        assert_eq!(alert.source, AlertSource::MetricThreshold);
        assert_eq!(alert.node_id, "i-0abc1234");
        assert_eq!(alert.metric_name.as_deref(), Some("DiskUtilization"));
        assert_eq!(alert.threshold, Some(90.0));
        assert_eq!(alert.observed_value, Some(95.0));
        assert_eq!(alert.raised_at.to_rfc3339(), "2024-12-05T10:00:00+00:00");
        assert!(!alert.resolved);
    }

    #[test]
    fn test_sns_envelope_is_unwrapped() {
        let envelope = json!({
            "Records": [{"Sns": {"Message": cloudwatch_alarm().to_string()}}]
        });
        let alert = normalize(&envelope).unwrap();
        assert_eq!(alert.node_id, "i-0abc1234");
        assert_eq!(alert.source, AlertSource::MetricThreshold);
    }

    #[test]
    fn test_sns_plain_text_message() {
        let envelope = json!({
            "Records": [{"Sns": {"Message": "Status check failed on i-0deadbeef"}}]
        });
        let alert = normalize(&envelope).unwrap();
        assert_eq!(alert.node_id, "i-0deadbeef");
        assert_eq!(alert.source, AlertSource::StatusCheck);
    }

    #[test]
    fn test_status_check_metric() {
        let payload = json!({
            "AlarmName": "n1-health",
            "Trigger": {"MetricName": "StatusCheckFailed", "Dimensions": {"InstanceId": "n1"}}
        });
        let alert = normalize(&payload).unwrap();
        assert_eq!(alert.source, AlertSource::StatusCheck);
        assert_eq!(alert.node_id, "n1");
    }

    #[test]
    fn test_explicit_source_wins() {
        let alert = normalize_body(r#"{"source":"StatusCheck","node_id":"n1","raised_at":"2024-12-05T10:00:00Z"}"#)
            .unwrap();
        assert_eq!(alert.source, AlertSource::StatusCheck);
        assert_eq!(alert.node_id, "n1");
        assert_eq!(alert.raised_at.to_rfc3339(), "2024-12-05T10:00:00+00:00");

        let payload = json!({"source": "metric_threshold", "node_id": "n2", "AlarmName": "n2-status-check"});
        assert_eq!(normalize(&payload).unwrap().source, AlertSource::MetricThreshold);

        let payload = json!({"source": "active_check", "node_id": "n3", "check": "host", "state": "critical"});
        let alert = normalize(&payload).unwrap();
        assert_eq!(alert.source, AlertSource::ActiveCheck);
        assert_eq!(alert.check.unwrap().state, CheckState::Critical);

        let payload = json!({"source": "carrier-pigeon", "node_id": "n4"});
        assert_eq!(normalize(&payload).unwrap().source, AlertSource::ActiveCheck);
    }

    #[test]
    fn test_metric_inferred_from_alarm_name() {
        let payload = json!({"AlarmName": "High-Memory-Usage", "node_id": "n3"});
        let alert = normalize(&payload).unwrap();
        assert_eq!(alert.source, AlertSource::MetricThreshold);
        assert_eq!(alert.metric_name.as_deref(), Some("MemoryUtilization"));
    }

    #[test]
    fn test_hint_style_payload() {
        let payload = json!({
            "node_id": "n4",
            "action": "restart_service",
            "service": "nginx",
            "state": "CRITICAL",
            "check": "service",
            "extra_field": {"ignored": true}
        });
        let alert = normalize(&payload).unwrap();
        assert_eq!(alert.source, AlertSource::ActiveCheck);
        assert_eq!(alert.action_hint.as_deref(), Some("restart_service"));
        let check = alert.check.unwrap();
        assert_eq!(check.kind, CheckKind::Service);
        assert_eq!(check.state, CheckState::Critical);
        assert_eq!(check.service.as_deref(), Some("nginx"));
    }

    #[test]
    fn test_node_id_from_tags() {
        let payload = json!({
            "check": "host",
            "state": "critical",
            "Tags": [{"Key": "Name", "Value": "web"}, {"Key": "NodeId", "Value": "node-7"}]
        });
        let alert = normalize(&payload).unwrap();
        assert_eq!(alert.node_id, "node-7");
    }

    #[test]
    fn test_missing_node_id_is_malformed() {
        let payload = json!({"AlarmName": "cpu-high", "Trigger": {"MetricName": "CPUUtilization"}});
        let err = normalize(&payload).unwrap_err();
        assert!(matches!(err, NormalizeError::MalformedAlert(_)));

        let err = normalize_body("something broke somewhere").unwrap_err();
        assert!(matches!(err, NormalizeError::MalformedAlert(_)));

        let err = normalize(&json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, NormalizeError::MalformedAlert(_)));
    }

    #[test]
    fn test_resolved_alarm() {
        let mut payload = cloudwatch_alarm();
        payload["NewStateValue"] = json!("OK");
        let alert = normalize(&payload).unwrap();
        assert!(alert.resolved);
    }

    #[test]
    fn test_numeric_strings_accepted() {
        let payload = json!({
            "node_id": "n2",
            "metric_name": "DiskUtilization",
            "observed_value": "95",
            "threshold": 90
        });
        let alert = normalize(&payload).unwrap();
        assert_eq!(alert.observed_value, Some(95.0));
        assert_eq!(alert.threshold, Some(90.0));
    }

    #[test]
    fn test_normalize_is_pure() {
        let payload = cloudwatch_alarm();
        let first = normalize(&payload).unwrap();
        let second = normalize(&payload).unwrap();
        assert_eq!(first, second);
    }
}
