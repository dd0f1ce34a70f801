//! Resilience utilities: retry policy with backoff, and rate limiting.
//!
//! - [`RetryPolicy`]: exponential backoff for transient failures, bounded or
//!   unbounded
//! - [`retry_transient`]: drive an operation under a [`RetryPolicy`]
//! - [`RateLimiter`]: token bucket throttling records applied to the local
//!   store
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use cdc_replication::resilience::{RateLimiter, RateLimitConfig, RetryPolicy};
//!
//! // Rate limit: max 1000 records/sec with burst of 100
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // Blocks if over limit
//!
//! // Retry forever, backing off up to 5 minutes
//! let policy = RetryPolicy::daemon();
//! assert!(!policy.is_exhausted(1_000));
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use crate::error::Result;
use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Retry behavior for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    /// `usize::MAX` retries forever.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RetryPolicy {
    /// Infinite retry for long-running streamers.
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 9        256s
    /// 10+      300s (cap, forever)
    /// ```
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Whether this policy never gives up.
    pub fn is_unbounded(&self) -> bool {
        self.max_attempts == usize::MAX
    }

    /// Whether `attempts` failed attempts use up the policy.
    pub fn is_exhausted(&self, attempts: usize) -> bool {
        !self.is_unbounded() && attempts >= self.max_attempts
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        // Past ~60 doublings the cap always applies; keep powi in range.
        let exponent = (attempt - 1).min(64) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;

        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or `policy`
/// runs out of attempts.
///
/// Each retry is logged at warn level and counted under `component`.
pub async fn retry_transient<F, Fut, T>(policy: &RetryPolicy, component: &str, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0usize;
    loop {
        attempts = attempts.saturating_add(1);
        match op().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(component, operation, attempts, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if policy.is_exhausted(attempts) => {
                error!(component, operation, attempts, error = %e, "Retries exhausted");
                crate::metrics::record_retries_exhausted(component);
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for_attempt(attempts);
                warn!(
                    component,
                    operation,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                crate::metrics::record_retry(component, e.kind());
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Uses a token bucket algorithm: tokens refill at `refill_rate` per second,
/// up to `burst_size` tokens. Each applied record consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 1000 records/sec with burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Token bucket rate limiter.
///
/// Shared by every destination worker so the limit applies to the process,
/// not per partition range.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        let limiter = GovLimiter::direct(quota);

        Self { limiter, config }
    }

    /// Acquire a permit, waiting until one is available.
    ///
    /// This method is cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_policy_is_unbounded() {
        let policy = RetryPolicy::daemon();
        assert!(policy.is_unbounded());
        assert!(!policy.is_exhausted(usize::MAX - 1));
        assert_eq!(policy, RetryPolicy::default());
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let policy = RetryPolicy::daemon();
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(1_000_000), Duration::from_secs(300));
    }

    #[test]
    fn test_testing_policy_is_fast() {
        let policy = RetryPolicy::testing();
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.delay_for_attempt(3) <= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_rate_limiter_burst_then_waits() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 5,
            refill_rate: 20,
        });
        assert_eq!(limiter.config().burst_size, 5);

        let start = std::time::Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(40), "burst should not wait");

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(30), "sixth permit waits for refill");
    }

    #[tokio::test]
    async fn test_retry_transient_recovers() {
        use crate::error::CdcError;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = AtomicUsize::new(0);
        let value = retry_transient(&RetryPolicy::testing(), "test", "op", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(CdcError::Store("busy".to_string()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_transient_gives_up() {
        use crate::error::CdcError;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_transient(&RetryPolicy::testing(), "test", "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CdcError::transport_msg("publish", "down"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let fatal = AtomicUsize::new(0);
        let result: Result<()> = retry_transient(&RetryPolicy::daemon(), "test", "op", || async {
            fatal.fetch_add(1, Ordering::SeqCst);
            Err(CdcError::Codec("bad".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(fatal.load(Ordering::SeqCst), 1);
    }
}
