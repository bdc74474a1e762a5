// Retry-with-backoff for segment and key fetches.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::DownloadConfig;
use crate::error::DownloadError;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, counting the first. Must be >= 1.
    pub max_attempts: u32,
    /// Base delay; the wait before attempt `k` (1-indexed) is `base * 2^(k-1)`.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.retry_base_delay,
        }
    }

    /// Delay to sleep before the given attempt (1-indexed). The first attempt
    /// carries no delay; attempt 2 waits `2 * base`, attempt 3 waits
    /// `4 * base`, and so on.
    fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let multiplier = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(Duration::MAX)
    }
}

/// Result of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T> {
    /// Operation succeeded.
    Success(T),
    /// Operation failed with a transient error (reset, timeout, 5xx).
    Retry(DownloadError),
    /// Operation failed with a terminal error (4xx, parse error).
    Fail(DownloadError),
}

/// Execute an async operation with retry-and-backoff.
///
/// The `operation` closure receives the current attempt number (1-indexed)
/// and returns a [`RetryAction`] indicating whether the result is a success,
/// a transient failure, or a permanent one. Cancellation during the backoff
/// sleep surfaces as [`DownloadError::Cancelled`].
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, DownloadError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let delay = policy.delay_before_attempt(attempt);
        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return Err(DownloadError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => {
                if attempt == max_attempts {
                    return Err(err);
                }
                warn!(
                    attempt,
                    max = max_attempts,
                    error = %err,
                    "Transient failure, will retry"
                );
            }
        }
    }

    // Unreachable: the loop covers 1..=max_attempts and the last iteration
    // returns on Retry.
    Err(DownloadError::Interrupted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn delay_schedule_is_exponential_from_the_second_attempt() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_before_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_before_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_before_attempt(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let token = CancellationToken::new();
        let result = retry_with_backoff(&quick_policy(3), &token, |_| async {
            RetryAction::Success(42u32)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn fails_immediately_on_terminal_error() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32, _> = retry_with_backoff(&quick_policy(3), &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async {
                RetryAction::Fail(DownloadError::HttpStatus {
                    status: reqwest::StatusCode::NOT_FOUND,
                    url: "https://example.com/seg.ts".to_string(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts_then_fails() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32, _> = retry_with_backoff(&quick_policy(3), &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async {
                RetryAction::Retry(DownloadError::FetchTransient {
                    reason: "connection reset".to_string(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn recovers_on_final_attempt() {
        let token = CancellationToken::new();
        let result = retry_with_backoff(&quick_policy(3), &token, |attempt| async move {
            if attempt < 3 {
                RetryAction::Retry(DownloadError::FetchTransient {
                    reason: "timeout".to_string(),
                })
            } else {
                RetryAction::Success(99u32)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 99);
    }

    #[tokio::test]
    async fn observes_cancellation_before_the_first_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<u32, _> = retry_with_backoff(&quick_policy(3), &token, |_| async {
            RetryAction::Success(1u32)
        })
        .await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }

    #[tokio::test]
    async fn observes_cancellation_during_backoff_sleep() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
        };
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let result: Result<u32, _> = retry_with_backoff(&policy, &token, |_| async {
            RetryAction::Retry(DownloadError::FetchTransient {
                reason: "reset".to_string(),
            })
        })
        .await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }
}
