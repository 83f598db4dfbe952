//! Bounded retries for transient failures
//!
//! Used around operations that talk to a node or API server outside the
//! reconcile loop's own requeue cycle (opening SSH sessions, building a
//! cluster client). Errors that [`Error::is_retryable`] rejects are returned
//! on the first attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Backoff policy for a retried operation
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts including the first (at least 1)
    pub attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Policy that runs the operation exactly once
    pub fn once() -> Self {
        Self {
            attempts: 1,
            ..Default::default()
        }
    }

    /// Policy with `attempts` tries and the default delays
    pub fn attempts(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// Un-jittered delay after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails permanently, or attempts run out
///
/// Each delay is jittered to 0.5x..1.5x of [`RetryPolicy::delay_for`].
pub async fn retry_transient<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err: Error = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_retryable() || attempt >= attempts {
            debug!(operation = %operation_name, attempt, error = %err, "giving up");
            return Err(err);
        }

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = policy.delay_for(attempt).mul_f64(jitter);
        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn test_attempts_never_zero() {
        assert_eq!(RetryPolicy::attempts(0).attempts, 1);
        assert_eq!(RetryPolicy::once().attempts, 1);
    }

    #[tokio::test]
    async fn story_transient_failure_recovers() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = retry_transient(&fast(5), "connect", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::remote("10.0.0.1", "connection reset"))
                } else {
                    Ok("session")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "session");
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn story_permanent_failure_is_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<()> = retry_transient(&fast(5), "auth", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::validation("no credentials"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<()> = retry_transient(&fast(3), "connect", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::remote("h", "refused"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
