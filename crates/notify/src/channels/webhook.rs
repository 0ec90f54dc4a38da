//! Generic JSON webhook channel.
//!
//! Posts the event itself plus title and severity, for consumers such as
//! topic fan-outs or dashboards that want `{node_id, action_kind, final_status}`.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::ChannelError;
use crate::events::{NotifyEvent, Severity};
use super::{post_json, NotifyChannel};

/// Environment variable for the webhook URL.
pub const ENV_NOTIFY_WEBHOOK_URL: &str = "NOTIFY_WEBHOOK_URL";

/// Generic JSON webhook channel.
pub struct WebhookChannel {
    url: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    title: String,
    severity: Severity,
    #[serde(flatten)]
    event: &'a NotifyEvent,
}

impl WebhookChannel {
    /// Create a channel from `NOTIFY_WEBHOOK_URL`.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            url: std::env::var(ENV_NOTIFY_WEBHOOK_URL).ok(),
            client: reqwest::Client::new(),
        }
    }

    /// Create a channel posting to `url`.
    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            url: Some(url),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotifyChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn enabled(&self) -> bool {
        self.url.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let url = self
            .url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_NOTIFY_WEBHOOK_URL.to_string()))?;

        let payload = WebhookPayload {
            title: event.title(),
            severity: event.severity(),
            event,
        };

        debug!(channel = "webhook", node_id = %event.node_id(), "Sending notification");
        post_json(&self.client, "webhook", url, &payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fatal() -> NotifyEvent {
        NotifyEvent::RemediationFatal {
            node_id: "n1".to_string(),
            action_kind: "reboot".to_string(),
            final_status: "fatal".to_string(),
            attempts: 3,
            detail: "timed out".to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_posts_flattened_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "type": "remediation_fatal",
                "node_id": "n1",
                "action_kind": "reboot",
                "final_status": "fatal",
                "severity": "critical"
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        WebhookChannel::new(server.uri()).send(&fatal()).await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = WebhookChannel::new(server.uri()).send(&fatal()).await.unwrap_err();
        assert!(matches!(err, ChannelError::RateLimited { retry_after_secs: 7 }));
    }

    #[test]
    fn test_unconfigured_is_disabled() {
        let channel = WebhookChannel { url: None, client: reqwest::Client::new() };
        assert!(!channel.enabled());
    }
}
