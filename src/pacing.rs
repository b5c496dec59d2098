//! Rate-limiting delays and retry backoff for the external maps service.
//!
//! Every wait races against a [`CancellationToken`] so a caller can abort a long
//! tiled search between requests.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fixed delays applied between external calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    /// Wait before a freshly issued continuation token may be used.
    pub page_settle: Duration,
    /// Wait after each place-details fetch that hit the network.
    pub detail_fetch: Duration,
    /// Wait between leads in a batch.
    pub between_leads: Duration,
}

impl Pacing {
    /// No delays at all. Intended for tests and mock backends.
    pub const fn none() -> Self {
        Self {
            page_settle: Duration::ZERO,
            detail_fetch: Duration::ZERO,
            between_leads: Duration::ZERO,
        }
    }
}

/// Exponential backoff: the wait after attempt `n` (1-based) is `base_delay * 2^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Total time slept when every attempt fails.
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts)
            .map(|attempt| self.delay_after(attempt))
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(d))
    }
}

/// Returned when the token fired before the wait elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Sleeps for `duration` unless `cancel` fires first.
pub async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    if cancel.is_cancelled() {
        return Err(Cancelled);
    }
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_each_attempt() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.total_backoff(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn pause_returns_early_when_cancelled() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });

        let started = std::time::Instant::now();
        let result = pause(Duration::from_secs(30), &token).await;
        assert_eq!(result, Err(Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn zero_pause_still_honours_cancellation() {
        let token = CancellationToken::new();
        assert_eq!(pause(Duration::ZERO, &token).await, Ok(()));
        token.cancel();
        assert_eq!(pause(Duration::ZERO, &token).await, Err(Cancelled));
    }
}
