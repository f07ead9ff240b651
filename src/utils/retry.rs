use std::time::Duration;
use tokio::time::sleep;

// ============================================================================
// Retry Policy - failure classification and exponential backoff
// ============================================================================
//
// Backoff for attempt n (1-based):
//
//   min(base * 2^(n-1), max_backoff)
//
//   attempt   base=5s
//   ─────────────────
//      1         5s
//      2        10s
//      3        20s
//      4        40s
//     ...      capped
//
// Non-retryable failures and failures past `max_attempts` are routed to the
// dead-letter topic instead of being scheduled again.
//
// ============================================================================

/// Check if an error is transient (should retry) or permanent (should not retry)
pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

/// What the relay should do with a failed event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    RetryAfter(Duration),
    DeadLetter,
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub base_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Attempts before an event is dead-lettered; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(5_000),
            max_backoff: Duration::from_secs(300),
            max_attempts: Some(10),
        }
    }
}

impl RetryPolicy {
    pub fn should_retry<E: IsTransient + ?Sized>(&self, error: &E) -> bool {
        error.is_transient()
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_backoff.as_millis().min(u64::MAX as u128) as u64;
        let max_ms = self.max_backoff.as_millis().min(u64::MAX as u128) as u64;

        let exponent = attempt.saturating_sub(1);
        let factor = if exponent >= 64 { u64::MAX } else { 1u64 << exponent };

        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }

    pub fn is_exhausted(&self, attempt_count: i32) -> bool {
        match self.max_attempts {
            Some(max) => attempt_count.max(0) as u32 >= max,
            None => false,
        }
    }

    pub fn disposition<E: IsTransient + ?Sized>(&self, error: &E, attempt_count: i32) -> Disposition {
        if !self.should_retry(error) || self.is_exhausted(attempt_count) {
            Disposition::DeadLetter
        } else {
            Disposition::RetryAfter(self.backoff(attempt_count.max(1) as u32))
        }
    }
}

/// Result of a retry operation
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// Operation succeeded
    Success(T),
    /// Operation failed after all retries
    Failed(E),
    /// Operation permanently failed (should not retry)
    PermanentFailure(E),
}

/// Execute an operation in-process, sleeping `policy.backoff(attempt)` between
/// transient failures. Used for startup dependencies (database, schema), not
/// for event delivery, which is retried through the outbox table instead.
pub async fn retry_on_transient<F, Fut, T, E>(
    policy: &RetryPolicy,
    max_attempts: u32,
    mut operation: F,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + IsTransient,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt = attempt, "Operation succeeded after retry");
                }
                return RetryResult::Success(result);
            }
            Err(error) => {
                if !policy.should_retry(&error) {
                    tracing::error!(error = %error, "Permanent failure detected, not retrying");
                    return RetryResult::PermanentFailure(error);
                }

                if attempt >= max_attempts {
                    tracing::error!(
                        attempt = attempt,
                        error = %error,
                        "Operation failed after all retries"
                    );
                    return RetryResult::Failed(error);
                }

                let delay = policy.backoff(attempt);
                tracing::warn!(
                    attempt = attempt,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying after delay"
                );

                sleep(delay).await;
            }
        }
    }
}

impl IsTransient for sqlx::Error {
    fn is_transient(&self) -> bool {
        matches!(self, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
    }
}
