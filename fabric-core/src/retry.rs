//! Retry policies for dispatch, polling and background redelivery.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Exponential backoff: `first × factor^attempt`, capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// How many times to try an operation and how long to wait in between.
/// `max_attempts: None` retries forever.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub backoff: BackoffPolicy,
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Bounded, for work a caller is waiting on.
    pub fn interactive() -> Self {
        Self {
            backoff: BackoffPolicy {
                first: Duration::from_millis(50),
                max: Duration::from_secs(2),
                factor: 2.0,
            },
            max_attempts: Some(5),
        }
    }

    /// Unbounded, for redelivery nobody is waiting on.
    pub fn background() -> Self {
        Self {
            backoff: BackoffPolicy {
                first: Duration::from_millis(250),
                max: Duration::from_secs(60),
                factor: 2.0,
            },
            max_attempts: None,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_attempts: Some(1),
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. The last error is returned.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempts += 1;
                    if !e.is_retryable() || !self.allows(attempts) {
                        if attempts > 1 {
                            tracing::warn!(
                                operation,
                                attempts,
                                error = %e,
                                "Giving up after retries"
                            );
                        }
                        return Err(e);
                    }
                    let delay = self.backoff.next(attempts - 1);
                    tracing::debug!(
                        operation,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FabricError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 2.0,
        };
        assert_eq!(policy.next(0), Duration::from_millis(100));
        assert_eq!(policy.next(1), Duration::from_millis(200));
        assert_eq!(policy.next(2), Duration::from_millis(400));
        assert_eq!(policy.next(10), Duration::from_secs(1));
        assert_eq!(policy.next(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn attempt_limits() {
        assert!(RetryPolicy::background().allows(1_000_000));
        assert!(RetryPolicy::interactive().allows(4));
        assert!(!RetryPolicy::interactive().allows(5));
        assert!(!RetryPolicy::no_retry().allows(1));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = RetryPolicy::interactive()
            .run("flaky", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FabricError::transient("not yet"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = RetryPolicy::background()
            .run("misrouted", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(FabricError::configuration("no route"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::Configuration(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_policy_returns_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = RetryPolicy::interactive()
            .run("down", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(FabricError::transient("down"))
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
