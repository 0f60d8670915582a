//! Bounded exponential backoff.
//!
//! Epistemic foundation:
//! - K_i: Delay before retry n is `base_delay * 2^n`, capped at `max_delay`
//! - K_i: Only `ErrorKind::Transient` errors are retried
//! - I^B: Remote recovery time unknowable → bounded attempts, then escalate

use crate::models::Classify;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Result of running an operation under the retry policy.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The error was not retryable and bubbled up immediately.
    Fatal(E),
    /// The error was retryable, but the configured attempts were exhausted.
    AttemptsExceeded(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            Self::Fatal(e) | Self::AttemptsExceeded(e) => e,
        }
    }
}

/// Stateless retry policy, reusable for any fallible operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: if max_delay.is_zero() {
                base_delay
            } else {
                max_delay
            },
        }
    }

    /// Policy that retries without sleeping.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Same delays, different attempt budget.
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self::new(max_attempts, self.base_delay, self.max_delay)
    }

    /// Delay before the retry that follows failed attempt `attempt` (0-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let factor = 1u128 << attempt.min(20);
        let delay_ms = self.base_delay.as_millis().saturating_mul(factor);
        let capped = delay_ms.min(self.max_delay.as_millis());
        Duration::from_millis(capped as u64)
    }

    /// Decide what follows failed attempt `attempt` (0-based).
    ///
    /// `Some(delay)` means sleep then try again; `None` means give up.
    pub fn next_delay<E: Classify>(&self, attempt: u32, err: &E) -> Option<Duration> {
        if !err.is_retryable() || attempt + 1 >= self.max_attempts {
            return None;
        }
        let backoff = self.backoff_delay(attempt);
        Some(err.retry_hint().map_or(backoff, |hint| hint.max(backoff)))
    }

    /// Executes the operation with the configured retry policy.
    ///
    /// Use this for operations that only borrow shared state. Operations that
    /// need `&mut` access drive their own loop with [`next_delay`](Self::next_delay).
    pub async fn run<F, Fut, T, E>(&self, what: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::fmt::Display,
    {
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if !err.is_retryable() {
                        return Err(RetryError::Fatal(err));
                    }
                    let Some(delay) = self.next_delay(attempt, &err) else {
                        return Err(RetryError::AttemptsExceeded(err));
                    };
                    warn!(
                        what,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after transient error"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AcquireError, ErrorKind};
    use std::cell::Cell;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_attempts_clamped() {
        assert_eq!(RetryPolicy::immediate(0).max_attempts, 1);
    }

    #[test]
    fn test_next_delay_respects_kind_and_budget() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));
        let transient = AcquireError::Unavailable("503".into());
        let parse = AcquireError::Parse("bad".into());
        assert_eq!(parse.kind(), ErrorKind::Validation);

        assert_eq!(
            policy.next_delay(0, &transient),
            Some(Duration::from_millis(100))
        );
        assert_eq!(
            policy.next_delay(1, &transient),
            Some(Duration::from_millis(200))
        );
        assert_eq!(policy.next_delay(2, &transient), None);
        assert_eq!(policy.next_delay(0, &parse), None);
    }

    #[test]
    fn test_next_delay_honours_rate_limit_hint() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));
        let limited = AcquireError::RateLimited {
            retry_after_secs: 2.0,
        };
        assert_eq!(policy.next_delay(0, &limited), Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_run_retries_transient_until_success() {
        let policy = RetryPolicy::immediate(3);
        let calls = Cell::new(0);

        let result: Result<u32, RetryError<AcquireError>> = policy
            .run("flaky", || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n < 3 {
                        Err(AcquireError::Unavailable("try again".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_max_attempts() {
        let policy = RetryPolicy::immediate(2);
        let calls = Cell::new(0);

        let result: Result<(), _> = policy
            .run("down", || {
                calls.set(calls.get() + 1);
                async { Err(AcquireError::Unavailable("down".into())) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::AttemptsExceeded(_))));
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_non_transient() {
        let policy = RetryPolicy::immediate(5);
        let calls = Cell::new(0);

        let result: Result<(), _> = policy
            .run("broken", || {
                calls.set(calls.get() + 1);
                async { Err(AcquireError::Parse("garbage".into())) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Fatal(_))));
        assert_eq!(calls.get(), 1);
    }
}
