//! Retry policy for RPCs that fail transiently.
//!
//! Backoff is exponential with deterministic jitter. A failure is retried
//! only when its error kind is retriable (`Unavailable`, `Aborted`,
//! `Cancelled`).

use std::time::Duration;

use tracing::debug;

use crate::error::{Result, ServiceError};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Add up to 25% jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Constant `delay` between attempts, no jitter.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Calculates the delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt >= self.max_retries {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter {
            capped * (1.0 + jitter_fraction(attempt) * 0.25)
        } else {
            capped
        };
        Duration::from_secs_f64(delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

// Deterministic value in [0, 1) derived from the attempt number.
fn jitter_fraction(seed: u32) -> f64 {
    let x = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
    f64::from(x) / (f64::from(u32::MAX) + 1.0)
}

/// Outcome of one attempt of a retried operation.
#[derive(Debug)]
pub enum RetryResult<T> {
    Ok(T),
    /// Failed; may be retried.
    Retry(ServiceError),
    /// Failed; must not be retried.
    Fail(ServiceError),
}

impl<T> From<Result<T>> for RetryResult<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(e) if e.is_retriable() => Self::Retry(e),
            Err(e) => Self::Fail(e),
        }
    }
}

/// Runs `operation` until it succeeds, fails permanently, or the policy's
/// retries are used up.
pub async fn retry_async<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = RetryResult<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            RetryResult::Ok(value) => return Ok(value),
            RetryResult::Fail(error) => return Err(error),
            RetryResult::Retry(error) => {
                if !policy.should_retry(attempt) {
                    return Err(error);
                }
                let delay = policy.delay_for_attempt(attempt);
                debug!("Retrying after {:?} (attempt {}): {}", delay, attempt + 1, error);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_respects_max() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy::default();
        for attempt in 0..5 {
            let base = Duration::from_millis(100 * 2u64.pow(attempt));
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay >= base);
            assert!(delay <= base.mul_f64(1.25));
        }
    }

    #[test]
    fn test_classification() {
        let retry = RetryResult::from(Err::<(), _>(ServiceError::unavailable("down")));
        assert!(matches!(retry, RetryResult::Retry(_)));

        let fail = RetryResult::from(Err::<(), _>(ServiceError::not_found("gone")));
        assert!(matches!(fail, RetryResult::Fail(_)));
    }

    #[tokio::test]
    async fn test_retry_async_eventual_success() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let attempts = AtomicU32::new(0);

        let result = retry_async(&policy, || {
            let count = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    RetryResult::from(Err::<i32, _>(ServiceError::unavailable("not yet")))
                } else {
                    RetryResult::Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_async_exhausted() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(1));
        let attempts = AtomicU32::new(0);

        let result: Result<i32> = retry_async(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { RetryResult::Retry(ServiceError::unavailable("always")) }
        })
        .await;

        assert!(result.unwrap_err().is_retriable());
        // Initial attempt + 2 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let attempts = AtomicU32::new(0);

        let result: Result<i32> = retry_async(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { RetryResult::from(Err::<i32, _>(ServiceError::invalid_argument("bad"))) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
