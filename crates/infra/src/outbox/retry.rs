//! Retry policy for failed publishes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound on any single backoff, whatever the policy says.
pub const BACKOFF_LIMIT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Exponential backoff with a cap and a hard attempt limit.
///
/// After the n-th failure (n starting at 1) the row waits
/// `min(base_backoff * 2^(n-1), max_backoff)`; once n reaches `max_attempts`
/// it is dead-lettered instead. Delays never exceed [`BACKOFF_LIMIT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempt count at which a row gives up (must be at least 1).
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
            max_backoff,
        }
    }

    /// Dead-letter on the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay after the given failed attempt (1-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2_u32.saturating_pow(attempt - 1);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
            .min(BACKOFF_LIMIT)
    }

    /// Whether a row with `attempts` failures may be tried again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Next eligible time after the `attempts`-th failure at `now`, or `None`
    /// when the row is exhausted. Saturates at the latest representable time.
    pub fn next_attempt_at(&self, attempts: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.should_retry(attempts) {
            return None;
        }
        let at = chrono::Duration::from_std(self.backoff_for_attempt(attempts))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Some(at)
    }
}
