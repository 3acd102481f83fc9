//! Retry utilities for resilient operations
//!
//! A single retry policy shape is shared by the HTTP client (per-request retries)
//! and the local workflow runtime (per-activity retries). Rate-limit family
//! errors are never retried here: they escalate so the orchestrator can
//! checkpoint and continue once the budget is back.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Backoff policy {initial interval, backoff coefficient, maximum interval, maximum attempts}
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_interval: Duration,

    /// Multiplier applied per further retry
    pub backoff_coefficient: f64,

    /// Upper bound for any single delay
    pub maximum_interval: Duration,

    /// Total attempts including the first one
    pub maximum_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(1000),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(30),
            maximum_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with custom attempt count
    pub fn new(maximum_attempts: u32) -> Self {
        Self {
            maximum_attempts,
            ..Default::default()
        }
    }

    /// Create a policy with custom delays
    pub fn with_delays(maximum_attempts: u32, initial_ms: u64, maximum_ms: u64) -> Self {
        Self {
            initial_interval: Duration::from_millis(initial_ms),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_millis(maximum_ms),
            maximum_attempts,
        }
    }

    /// Delay before retry number `retry` (1-based); zero for `retry == 0`
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_interval.as_millis() as f64;
        let exponential = base * self.backoff_coefficient.powi((retry - 1) as i32);
        let capped = exponential.min(self.maximum_interval.as_millis() as f64);

        Duration::from_millis(capped as u64)
    }
}

/// Errors worth retrying at the request/activity level
pub fn is_transient(err: &Error) -> bool {
    err.is_retryable() && !err.is_rate_limited()
}

/// Execute an operation, retrying transient failures with exponential backoff
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_if(policy, operation, is_transient).await
}

/// Execute an operation with retry logic, using a custom retry predicate
///
/// Returns the first success, the first error the predicate rejects, or the
/// last error once `maximum_attempts` is spent.
pub async fn with_retry_if<T, F, Fut, P>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: P,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let attempts = policy.maximum_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = policy.calculate_delay(attempt);
            debug!(
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying operation after delay"
            );
            tokio::time::sleep(delay).await;
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }

                warn!(
                    attempt = attempt + 1,
                    maximum_attempts = attempts,
                    error = %e,
                    "Operation failed, will retry"
                );
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::other("Operation failed with no error details")))
}
