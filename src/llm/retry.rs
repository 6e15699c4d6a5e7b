//! Transport Retry
//!
//! Exponential backoff for transient generator failures. This budget is
//! internal to one generation call; the orchestrator's own retry budget sits
//! above it.

use crate::error::{RagError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: usize,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: usize,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// 1s, 2s, 4s ... for the given number of attempts
    pub fn exponential(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// No waiting between attempts; used by tests and local backends
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay before retrying after the zero-based `attempt` failed
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let delay_ms = (self.initial_delay.as_millis() as f64)
            * self.backoff_multiplier.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Run `operation` until it succeeds, a non-retryable error occurs, or
    /// the attempts are used up. Exhaustion returns the last error unchanged.
    pub async fn retry_with_backoff<F, Fut, T>(
        &self,
        mut operation: F,
        is_retryable: impl Fn(&RagError) -> bool,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error: Option<RagError> = None;

        for attempt in 0..attempts {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !is_retryable(&e) {
                        return Err(e);
                    }
                    warn!("Attempt {} of {} failed: {}", attempt + 1, attempts, e);
                    last_error = Some(e);

                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        warn!("Giving up after {} attempts", attempts);
        Err(last_error.unwrap_or_else(|| RagError::Generation("Unknown error".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_with_backoff_success() {
        let policy = RetryPolicy::immediate(3);
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result = policy
            .retry_with_backoff(
                move || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 1 {
                            Err(RagError::Generation("connection reset".to_string()))
                        } else {
                            Ok("ok")
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_exhausted() {
        let policy = RetryPolicy::immediate(3);
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<()> = policy
            .retry_with_backoff(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(RagError::Generation("connection refused".to_string())) }
                },
                |_| true,
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "Generation error: connection refused");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returned_immediately() {
        let policy = RetryPolicy::immediate(5);
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<()> = policy
            .retry_with_backoff(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(RagError::Validation("bad request".to_string())) }
                },
                |e| matches!(e, RagError::Generation(_)),
            )
            .await;

        assert!(matches!(result, Err(RagError::Validation(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_policy_delay_calculation() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
    }
}
