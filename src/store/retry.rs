//! Exponential-backoff retrier for idempotent operations. Only errors the
//! caller marks retryable are retried; validation/authorization errors are
//! never retried, matching the error-propagation policy.

use crate::error::ArbiterError;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// delay_k = min(maxDelay, baseDelay * multiplier^(k-1)), optionally
    /// jittered by +/-25%. `attempt` is 1-indexed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi((attempt.saturating_sub(1)) as i32);
        let raw_ms = (self.base_delay.as_millis() as f64 * exp).min(self.max_delay.as_millis() as f64);
        let ms = if self.jitter {
            let mut rng = rand::thread_rng();
            let jitter_factor = rng.gen_range(0.75..=1.25);
            raw_ms * jitter_factor
        } else {
            raw_ms
        };
        Duration::from_millis(ms.max(0.0) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub cause: String,
}

/// Runs `op` with exponential backoff, retrying only when the returned
/// error's [`ErrorKind`] is retryable. Surfaces [`ArbiterError::Exhausted`]
/// carrying the last cause once the attempt budget is spent.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, ArbiterError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ArbiterError>>,
{
    let mut history: Vec<AttemptRecord> = Vec::new();
    for attempt in 1..=policy.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                history.push(AttemptRecord {
                    attempt,
                    cause: err.to_string(),
                });
                if !err.kind().is_retryable() {
                    return Err(err);
                }
                if attempt == policy.max_attempts {
                    return Err(ArbiterError::Exhausted {
                        attempts: attempt,
                        last_cause: err.to_string(),
                    });
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            }
        }
    }
    unreachable!("loop always returns before exhausting max_attempts == 0 is rejected by config validation")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_retryable_errors_until_success() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: false,
        };
        let calls = AtomicU32::new(0);
        let result = retry(&policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ArbiterError::Unavailable("down".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_retries_validation_errors() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ArbiterError::Validation("bad".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn surfaces_exhausted_after_budget_spent() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 1.0,
            jitter: false,
        };
        let result: Result<(), _> = retry(&policy, || async { Err(ArbiterError::Timeout("slow".into())) }).await;
        match result {
            Err(ArbiterError::Exhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }
}
