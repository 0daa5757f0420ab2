//! Generic bounded retry with exponential backoff and jitter.
//!
//! [`RetryExecutor`] knows nothing about agents or phases; it is the
//! primitive other components build retry policies on top of. Each attempt
//! gets the 1-based attempt number; between failed attempts the executor
//! sleeps `min(max, base * 2^(attempt-1) + random(0..=base))` milliseconds.
//! After the final attempt fails an optional recovery hook runs exactly
//! once; a `Some(value)` from it turns the outcome into a success with
//! `recovery_used` set.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Backoff policy for one retry loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Outcome of one `execute` call.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub success: bool,
    pub value: Option<T>,
    /// How many attempts actually ran.
    pub attempts: u32,
    /// Whether the value came from the recovery hook.
    pub recovery_used: bool,
    /// Stringified last error when `success` is false.
    pub error: Option<String>,
}

/// Recovery type for callers that supply none.
type NoRecovery<T> = fn(String) -> std::future::Ready<anyhow::Result<Option<T>>>;

/// Generic attempt loop. Construct once with a policy, call per operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Run `op` under the policy with no callbacks.
    pub async fn execute<T, F, Fut>(&self, op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute_with(op, |_, _| {}, None::<NoRecovery<T>>).await
    }

    /// Run `op` under the policy.
    ///
    /// `on_retry(attempt, error)` fires after each failed attempt that will
    /// be retried, before the backoff sleep. `recover` fires once after the
    /// final attempt fails; the error it receives is the stringified last
    /// failure. Neither fires after a success.
    pub async fn execute_with<T, F, Fut, H, R, RFut>(
        &self,
        mut op: F,
        mut on_retry: H,
        recover: Option<R>,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        H: FnMut(u32, &str),
        R: FnOnce(String) -> RFut,
        RFut: Future<Output = anyhow::Result<Option<T>>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error: Option<String> = None;

        for attempt in 1..=max_attempts {
            match op(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        success: true,
                        value: Some(value),
                        attempts: attempt,
                        recovery_used: false,
                        error: None,
                    };
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    debug!(attempt, max_attempts, error = %message, "attempt failed");
                    if attempt < max_attempts {
                        on_retry(attempt, &message);
                        last_error = Some(message);
                        tokio::time::sleep(self.delay_for(attempt)).await;
                    } else {
                        last_error = Some(message);
                    }
                }
            }
        }

        let message = last_error
            .unwrap_or_else(|| "retry loop exited without running an attempt".to_string());

        if let Some(recover) = recover {
            warn!(
                attempts = max_attempts,
                error = %message,
                "all attempts exhausted; invoking recovery hook"
            );
            match recover(message.clone()).await {
                Ok(Some(value)) => {
                    return RetryOutcome {
                        success: true,
                        value: Some(value),
                        attempts: max_attempts,
                        recovery_used: true,
                        error: None,
                    };
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(error = %format!("{err:#}"), "recovery hook failed");
                }
            }
        }

        RetryOutcome {
            success: false,
            value: None,
            attempts: max_attempts,
            recovery_used: false,
            error: Some(message),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.policy.base_delay_ms;
        // Shift capped so large attempt counts cannot overflow the factor.
        let factor = 1u64 << (attempt.saturating_sub(1)).min(16);
        let exponential = base.saturating_mul(factor);
        let jitter = rand::thread_rng().gen_range(0..=base);
        let delay = exponential.saturating_add(jitter).min(self.policy.max_delay_ms);
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 10,
            max_delay_ms: 50,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_runs_exactly_n_attempts() {
        let executor = RetryExecutor::new(fast_policy(4));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = Arc::clone(&calls);

        let outcome: RetryOutcome<()> = executor
            .execute(move |_attempt| {
                let calls = Arc::clone(&calls_in_op);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("still broken")
                }
            })
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(outcome.error.unwrap().contains("still broken"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_retry_fires_n_minus_one_times_in_order() {
        let executor = RetryExecutor::new(fast_policy(3));
        let mut retried_attempts: Vec<u32> = Vec::new();

        let outcome: RetryOutcome<()> = executor
            .execute_with(
                |_attempt| async { anyhow::bail!("nope") },
                |attempt, _err| retried_attempts.push(attempt),
                None::<super::NoRecovery<()>>,
            )
            .await;

        assert!(!outcome.success);
        assert_eq!(retried_attempts, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_stops_immediately_without_recovery() {
        let executor = RetryExecutor::new(fast_policy(5));

        let outcome = executor
            .execute(|attempt| async move {
                if attempt < 3 {
                    anyhow::bail!("warming up")
                }
                Ok(attempt)
            })
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.value, Some(3));
        assert!(!outcome.recovery_used);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_value_becomes_successful_outcome() {
        let executor = RetryExecutor::new(fast_policy(2));

        let outcome = executor
            .execute_with(
                |_attempt| async { anyhow::bail!("hard failure") },
                |_, _| {},
                Some(|last_error: String| async move {
                    assert!(last_error.contains("hard failure"));
                    Ok(Some("fallback".to_string()))
                }),
            )
            .await;

        assert!(outcome.success);
        assert!(outcome.recovery_used);
        assert_eq!(outcome.value.as_deref(), Some("fallback"));
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_none_keeps_the_failure() {
        let executor = RetryExecutor::new(fast_policy(2));

        let outcome: RetryOutcome<String> = executor
            .execute_with(
                |_attempt| async { anyhow::bail!("hard failure") },
                |_, _| {},
                Some(|_last: String| async move { Ok(None) }),
            )
            .await;

        assert!(!outcome.success);
        assert!(!outcome.recovery_used);
        assert!(outcome.error.unwrap().contains("hard failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throwing_recovery_keeps_the_original_error() {
        let executor = RetryExecutor::new(fast_policy(1));

        let outcome: RetryOutcome<String> = executor
            .execute_with(
                |_attempt| async { anyhow::bail!("original") },
                |_, _| {},
                Some(|_last: String| async move { anyhow::bail!("recovery also broke") }),
            )
            .await;

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("original"));
    }
}
