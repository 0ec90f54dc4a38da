//! Delivery errors for notification channels.

use thiserror::Error;

/// Why a channel could not deliver a remediation outcome.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Named environment variable or URL is missing
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    #[error("{channel} rejected notification with {status}: {body}")]
    Rejected {
        channel: &'static str,
        status: u16,
        body: String,
    },

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

impl ChannelError {
    /// Whether a later delivery of the same event could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::RateLimited { .. } => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::NotConfigured(_) => false,
        }
    }
}
