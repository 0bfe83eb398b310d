//! Retry policy and recovery decisions
//!
//! Pure decision logic lives on [`RetryPolicy`]; the only effectful pieces are
//! [`interruptible_sleep`] and [`retry_async`], which drive the policy.

use crate::error::BrokerError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Same delay before every attempt
    Fixed,
    /// Delay doubles after each attempt, capped at `max_delay`
    Exponential,
}

/// Backoff-and-retry policy shared by connection and admin operations
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    pub backoff: BackoffKind,
    pub max_delay: Duration,
}

const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

impl RetryPolicy {
    /// Unbounded fixed-delay policy, used for consumer restarts
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_attempts: None,
            backoff: BackoffKind::Fixed,
            max_delay: delay.max(DEFAULT_MAX_DELAY),
        }
    }

    /// Bounded policy, used for admin calls
    pub fn bounded(initial_delay: Duration, max_attempts: u32, backoff: BackoffKind) -> Self {
        Self {
            initial_delay,
            max_attempts: Some(max_attempts),
            backoff,
            max_delay: initial_delay.max(DEFAULT_MAX_DELAY),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffKind::Fixed => self.initial_delay,
            BackoffKind::Exponential => {
                let exponent = attempt.saturating_sub(1).min(31);
                let factor = 1u32 << exponent;
                self.initial_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }

    /// Decide whether another attempt should be made (pure function)
    pub fn decide(&self, attempts_made: u32, shutdown_requested: bool) -> RetryDecision {
        if shutdown_requested {
            return RetryDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = self.max_attempts {
            if attempts_made >= max_attempts {
                return RetryDecision::AbortMaxAttemptsExceeded;
            }
        }

        RetryDecision::Proceed {
            attempt: attempts_made + 1,
            delay: self.delay_for(attempts_made),
        }
    }

    /// Validate policy parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }
        if self.initial_delay.is_zero() {
            return Err("initial_delay must be greater than 0".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("max_delay must not be lower than initial_delay".to_string());
        }
        Ok(())
    }
}

/// Outcome of consulting a [`RetryPolicy`] after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Wait `delay`, then make attempt number `attempt`
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Sleep that can be interrupted by shutdown.
/// Returns true if the full delay elapsed, false if shutdown was requested.
pub async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown_rx.borrow_and_update() {
        return false;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    // Sender gone, nobody can request shutdown any more
                    (&mut sleep).await;
                    return true;
                }
                if *shutdown_rx.borrow() {
                    info!("Shutdown signal received during retry delay, stopping");
                    return false;
                }
            }
        }
    }
}

/// Run a broker operation, retrying failures per `policy`.
/// Returns the last error once the policy gives up.
pub async fn retry_async<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let mut attempts_made = 0u32;
    loop {
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        attempts_made += 1;

        match policy.decide(attempts_made, false) {
            RetryDecision::Proceed { attempt, delay } => {
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Broker operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            _ => {
                debug!(operation, attempts_made, "Retry budget exhausted");
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_fixed_policy_never_gives_up() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5));
        for attempts in [0, 1, 10, 10_000] {
            assert_eq!(
                policy.decide(attempts, false),
                RetryDecision::Proceed {
                    attempt: attempts + 1,
                    delay: Duration::from_secs(5),
                }
            );
        }
    }

    #[test]
    fn test_shutdown_overrides_everything() {
        let policy = RetryPolicy::fixed(Duration::from_millis(10));
        assert_eq!(
            policy.decide(0, true),
            RetryDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_bounded_policy_stops_at_max_attempts() {
        let policy = RetryPolicy::bounded(Duration::from_millis(100), 3, BackoffKind::Fixed);
        assert!(matches!(policy.decide(2, false), RetryDecision::Proceed { attempt: 3, .. }));
        assert_eq!(
            policy.decide(3, false),
            RetryDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_exponential_delays_double_and_cap() {
        let policy = RetryPolicy::bounded(Duration::from_millis(300), 10, BackoffKind::Exponential)
            .with_max_delay(Duration::from_secs(2));

        assert_eq!(policy.delay_for(1), Duration::from_millis(300));
        assert_eq!(policy.delay_for(2), Duration::from_millis(600));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1200));
        assert_eq!(policy.delay_for(4), Duration::from_secs(2));
        assert_eq!(policy.delay_for(60), Duration::from_secs(2));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let zero_attempts = RetryPolicy::bounded(Duration::from_millis(1), 0, BackoffKind::Fixed);
        assert!(zero_attempts.validate().is_err());

        let zero_delay = RetryPolicy::fixed(Duration::ZERO);
        assert!(zero_delay.validate().is_err());

        assert!(RetryPolicy::fixed(Duration::from_secs(5)).validate().is_ok());
    }

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let (_tx, rx) = watch::channel(false);
        assert!(interruptible_sleep(rx.clone(), Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_returns_early_on_shutdown() {
        let (tx, rx) = watch::channel(false);

        let sleeper = tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let completed = interruptible_sleep(rx.clone(), Duration::from_secs(30)).await;
            (completed, started.elapsed())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let (completed, elapsed) = sleeper.await.unwrap();
        assert!(!completed);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_interruptible_sleep_skips_when_already_shut_down() {
        let (_tx, rx) = watch::channel(true);
        assert!(!interruptible_sleep(rx.clone(), Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn test_retry_async_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::bounded(Duration::from_millis(1), 5, BackoffKind::Fixed);

        let result = retry_async(&policy, "list_topics", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BrokerError::rejected("not ready"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_async_returns_last_error_when_exhausted() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::bounded(Duration::from_millis(1), 3, BackoffKind::Exponential);

        let result: Result<(), _> = retry_async(&policy, "open_admin", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::Closed) }
        })
        .await;

        assert!(matches!(result, Err(BrokerError::Closed)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    proptest! {
        #[test]
        fn prop_exponential_delay_never_exceeds_cap(
            initial_ms in 1u64..5_000,
            cap_ms in 5_000u64..120_000,
            attempt in 0u32..200,
        ) {
            let policy = RetryPolicy::bounded(
                Duration::from_millis(initial_ms),
                10,
                BackoffKind::Exponential,
            )
            .with_max_delay(Duration::from_millis(cap_ms));

            let delay = policy.delay_for(attempt);
            prop_assert!(delay <= Duration::from_millis(cap_ms));
            prop_assert!(delay >= Duration::from_millis(initial_ms));
        }

        #[test]
        fn prop_exponential_delay_is_monotonic(initial_ms in 1u64..1_000, attempt in 1u32..50) {
            let policy = RetryPolicy::bounded(
                Duration::from_millis(initial_ms),
                100,
                BackoffKind::Exponential,
            );
            prop_assert!(policy.delay_for(attempt) <= policy.delay_for(attempt + 1));
        }

        #[test]
        fn prop_bounded_policy_allows_exactly_max_attempts(max in 1u32..50) {
            let policy = RetryPolicy::bounded(Duration::from_millis(1), max, BackoffKind::Fixed);
            let proceeds = (0..max + 5)
                .filter(|made| matches!(policy.decide(*made, false), RetryDecision::Proceed { .. }))
                .count() as u32;
            prop_assert_eq!(proceeds, max);
        }
    }
}
