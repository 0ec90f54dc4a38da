//! Result/notification sink for remediation outcomes.
//!
//! Publishes `{node_id, action_kind, final_status}` when a remediation
//! reaches a terminal state. Fire-and-forget by default, with a blocking
//! variant for callers that need delivery results.
//!
//! # Usage
//!
//! ```no_run
//! use notify::{Notifier, NotifyEvent};
//!
//! # async fn run() {
//! let notifier = Notifier::from_env();
//!
//! notifier.notify(NotifyEvent::RemediationSucceeded {
//!     node_id: "i-0abc123".to_string(),
//!     action_kind: "reboot".to_string(),
//!     final_status: "succeeded".to_string(),
//!     attempts: 1,
//!     detail: "reboot accepted by systemctl".to_string(),
//!     timestamp: chrono::Utc::now(),
//! });
//! # }
//! ```
//!
//! # Configuration
//!
//! - `SLACK_WEBHOOK_URL`: Slack incoming webhook (enables Slack channel)
//! - `NOTIFY_WEBHOOK_URL`: generic JSON webhook (enables webhook channel)
//! - `NOTIFY_DISABLED`: Set to "true" to disable all notifications

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;

pub use channels::slack::SlackChannel;
pub use channels::webhook::WebhookChannel;
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use events::{NotifyEvent, Severity};

use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Environment variable to disable all notifications.
const ENV_NOTIFY_DISABLED: &str = "NOTIFY_DISABLED";

/// Fans terminal remediation events out to every configured channel.
pub struct Notifier {
    channels: Vec<Arc<dyn NotifyChannel>>,
    disabled: bool,
}

impl Notifier {
    /// Build from `SLACK_WEBHOOK_URL`, `NOTIFY_WEBHOOK_URL` and `NOTIFY_DISABLED`.
    #[must_use]
    pub fn from_env() -> Self {
        let disabled = std::env::var(ENV_NOTIFY_DISABLED)
            .is_ok_and(|v| v.eq_ignore_ascii_case("true") || v == "1");
        if disabled {
            info!("Notifications disabled via {ENV_NOTIFY_DISABLED}");
            return Self::disabled();
        }
        Self::from_urls(
            std::env::var(channels::slack::ENV_SLACK_WEBHOOK_URL).ok(),
            std::env::var(channels::webhook::ENV_NOTIFY_WEBHOOK_URL).ok(),
        )
    }

    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        Self {
            channels,
            disabled: false,
        }
    }

    /// One channel per URL given; `None` leaves that channel out.
    #[must_use]
    pub fn from_urls(slack_webhook_url: Option<String>, webhook_url: Option<String>) -> Self {
        let slack = slack_webhook_url.map(|url| Arc::new(SlackChannel::new(url)) as Arc<dyn NotifyChannel>);
        let webhook = webhook_url.map(|url| Arc::new(WebhookChannel::new(url)) as Arc<dyn NotifyChannel>);
        let channels: Vec<_> = slack.into_iter().chain(webhook).collect();

        if channels.is_empty() {
            warn!("No notification channels configured");
        } else {
            let names: Vec<_> = channels.iter().map(|c| c.name()).collect();
            info!(channels = ?names, "Remediation notifications enabled");
        }
        Self::with_channels(channels)
    }

    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            channels: vec![],
            disabled: true,
        }
    }

    #[must_use]
    pub fn has_channels(&self) -> bool {
        self.channel_count() > 0
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        if self.disabled {
            0
        } else {
            self.channels.iter().filter(|c| c.enabled()).count()
        }
    }

    /// Deliver in the background; failures are logged, never returned.
    pub fn notify(&self, event: NotifyEvent) {
        if !self.has_channels() {
            debug!(node_id = %event.node_id(), "No active notification channels, dropping event");
            return;
        }
        let channels = self.channels.clone();
        tokio::spawn(async move {
            for (channel, result) in deliver(&channels, &event).await {
                match result {
                    Ok(()) => debug!(channel, "Notification sent"),
                    Err(e) => error!(channel, error = %e, "Failed to send notification"),
                }
            }
        });
    }

    /// Deliver and report per-channel results.
    ///
    /// Channels are driven concurrently; results come back in channel order.
    pub async fn notify_and_wait(
        &self,
        event: NotifyEvent,
    ) -> Vec<(String, Result<(), ChannelError>)> {
        if self.disabled {
            return vec![];
        }
        deliver(&self.channels, &event)
            .await
            .into_iter()
            .map(|(name, result)| (name.to_string(), result))
            .collect()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::from_env()
    }
}

async fn deliver(
    channels: &[Arc<dyn NotifyChannel>],
    event: &NotifyEvent,
) -> Vec<(&'static str, Result<(), ChannelError>)> {
    let sends = channels
        .iter()
        .filter(|channel| channel.enabled())
        .map(|channel| async move { (channel.name(), channel.send(event).await) });
    join_all(sends).await
}
