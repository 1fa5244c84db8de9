//! Retry with bounded exponential backoff.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::WeftError;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(8_000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// `min(base_delay * 2^attempt, max_delay)` for a zero-based attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Sleep for `delay`, returning `Cancelled` as soon as `cancel` fires.
    pub async fn sleep_or_cancel(
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), WeftError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WeftError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
