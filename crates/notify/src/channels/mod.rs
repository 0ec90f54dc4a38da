//! Delivery channels for remediation outcomes.

pub mod slack;
pub mod webhook;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::NotifyEvent;

/// A destination for terminal remediation events.
///
/// Channels are shared across tasks by the [`crate::Notifier`], so `send`
/// takes `&self` and must tolerate concurrent calls.
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    /// Stable name used in logs and delivery results.
    fn name(&self) -> &'static str;

    /// A channel without a destination URL is skipped, not failed.
    fn enabled(&self) -> bool;

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError>;
}

/// POST `payload` as JSON and map the response onto [`ChannelError`].
pub(crate) async fn post_json<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    channel: &'static str,
    url: &str,
    payload: &T,
) -> Result<(), ChannelError> {
    let response = client.post(url).json(payload).send().await?;
    let status = response.status();

    if status.is_success() {
        debug!(channel, "Notification delivered");
        return Ok(());
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);
        return Err(ChannelError::RateLimited { retry_after_secs });
    }

    let body = response.text().await.unwrap_or_default();
    warn!(channel, %status, %body, "Notification rejected");
    Err(ChannelError::Rejected {
        channel,
        status: status.as_u16(),
        body,
    })
}
