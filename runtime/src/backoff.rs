//! Exponential backoff for failed publish attempts.
//!
//! The delay before attempt `n + 1` after `n` failures is
//!
//! ```text
//! backoff(n) = min(base * 2^(n-1), ceiling)      n clamped to >= 1
//! ```
//!
//! A zero base or ceiling falls back to the defaults (1 second, 1 minute).
//!
//! # Example
//!
//! ```rust
//! use outbox_runtime::backoff::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::builder()
//!     .base(Duration::from_millis(500))
//!     .ceiling(Duration::from_secs(10))
//!     .build();
//!
//! assert_eq!(policy.delay(1), Duration::from_millis(500));
//! assert_eq!(policy.delay(3), Duration::from_secs(2));
//! assert_eq!(policy.delay(30), Duration::from_secs(10));
//! ```

use std::time::Duration;
use tokio::time::sleep;

/// Default delay after the first failure.
pub const DEFAULT_BASE: Duration = Duration::from_secs(1);

/// Default upper bound on any delay.
pub const DEFAULT_CEILING: Duration = Duration::from_secs(60);

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE,
            ceiling: DEFAULT_CEILING,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy; zero values fall back to the defaults.
    #[must_use]
    pub const fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base: if base.is_zero() { DEFAULT_BASE } else { base },
            ceiling: if ceiling.is_zero() {
                DEFAULT_CEILING
            } else {
                ceiling
            },
        }
    }

    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> BackoffPolicyBuilder {
        BackoffPolicyBuilder {
            base: None,
            ceiling: None,
        }
    }

    /// Delay after the first failure.
    #[must_use]
    pub const fn base(&self) -> Duration {
        self.base
    }

    /// Upper bound on any delay.
    #[must_use]
    pub const fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Delay before the next attempt after `failures` failed attempts.
    ///
    /// `failures` is clamped to at least 1. Overflow saturates at the ceiling.
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.max(1) - 1;

        2u32.checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.ceiling, |delay| delay.min(self.ceiling))
    }
}

/// Builder for [`BackoffPolicy`].
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicyBuilder {
    base: Option<Duration>,
    ceiling: Option<Duration>,
}

impl BackoffPolicyBuilder {
    /// Set the delay after the first failure.
    #[must_use]
    pub const fn base(mut self, base: Duration) -> Self {
        self.base = Some(base);
        self
    }

    /// Set the upper bound on any delay.
    #[must_use]
    pub const fn ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = Some(ceiling);
        self
    }

    /// Build the [`BackoffPolicy`].
    #[must_use]
    pub fn build(self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.base.unwrap_or(DEFAULT_BASE),
            self.ceiling.unwrap_or(DEFAULT_CEILING),
        )
    }
}

/// Retry an async operation, sleeping `policy.delay(n)` after the n-th failure.
///
/// Used at startup to wait for the database or broker to accept connections.
/// Gives up after `max_attempts` attempts (at least one) and returns the last error.
///
/// # Errors
///
/// Returns the last error if every attempt failed.
///
/// # Example
///
/// ```rust
/// use outbox_runtime::backoff::{BackoffPolicy, retry_with_backoff};
///
/// # async fn example() -> Result<(), String> {
/// let value = retry_with_backoff(BackoffPolicy::default(), 3, || async {
///     Ok::<_, String>(42)
/// })
/// .await?;
///
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: BackoffPolicy,
    max_attempts: u32,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if attempt >= max_attempts {
                    tracing::error!(attempt, error = %err, "Operation failed after max attempts");
                    return Err(err);
                }

                let delay = policy.delay(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying..."
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_from_base() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_zero_failures_clamped_to_one() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), policy.delay(1));
        assert_eq!(policy.delay(0), Duration::from_secs(1));
    }

    #[test]
    fn test_delay_capped_at_ceiling() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60));

        assert_eq!(policy.delay(6), Duration::from_secs(32));
        assert_eq!(policy.delay(7), Duration::from_secs(60));
        assert_eq!(policy.delay(40), Duration::from_secs(60));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_values_use_defaults() {
        let policy = BackoffPolicy::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.base(), DEFAULT_BASE);
        assert_eq!(policy.ceiling(), DEFAULT_CEILING);

        let built = BackoffPolicy::builder().build();
        assert_eq!(built, BackoffPolicy::default());
    }

    proptest! {
        #[test]
        fn prop_delay_is_monotonic_and_bounded(
            base_ms in 1u64..5_000,
            ceiling_ms in 1u64..600_000,
            n in 0u32..200,
        ) {
            let policy = BackoffPolicy::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(ceiling_ms),
            );

            prop_assert!(policy.delay(n) <= policy.delay(n + 1));
            prop_assert!(policy.delay(n) <= policy.ceiling());
        }

        #[test]
        fn prop_delay_matches_closed_form(
            base_ms in 1u64..5_000,
            ceiling_ms in 1u64..600_000,
            n in 1u32..20,
        ) {
            let policy = BackoffPolicy::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(ceiling_ms),
            );
            let expected = (base_ms * (1u64 << (n - 1))).min(ceiling_ms);

            prop_assert_eq!(policy.delay(n), Duration::from_millis(expected));
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let policy = BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(20));
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_backoff(policy, 5, || {
            let c = Arc::clone(&counter_clone);
            async move {
                let attempt = c.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(format!("Attempt {attempt} failed"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_returns_last_error() {
        let policy = BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(2));
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let result: Result<(), String> = retry_with_backoff(policy, 3, || {
            let c = Arc::clone(&counter_clone);
            async move {
                let attempt = c.fetch_add(1, Ordering::SeqCst);
                Err(format!("attempt {attempt}"))
            }
        })
        .await;

        assert_eq!(result, Err("attempt 2".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
