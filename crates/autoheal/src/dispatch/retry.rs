//! Spacing between attempts of the same action.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest exponent applied by [`Backoff::Exponential`].
const MAX_EXPONENT: u32 = 6;

/// Backoff policy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Every retry waits one attempt timeout
    #[default]
    Fixed,
    /// Retry after attempt `n` waits `timeout * 2^(n-1)`
    Exponential,
}

impl Backoff {
    /// Minimum gap between the start of attempt `previous` and the next one.
    ///
    /// Never shorter than `attempt_timeout`, so a node still recovering from
    /// the previous attempt is not stacked with requests.
    #[must_use]
    pub fn spacing_after(self, previous: u32, attempt_timeout: Duration) -> Duration {
        match self {
            Self::Fixed => attempt_timeout,
            Self::Exponential => {
                let exponent = previous.saturating_sub(1).min(MAX_EXPONENT);
                attempt_timeout.saturating_mul(1 << exponent)
            }
        }
    }
}
