//! Resilience utilities: retry delays, backoff tracking, rate limiting.
//!
//! - [`RetryConfig`]: capped exponential delay schedule
//! - [`Backoff`]: failure counter over a schedule, reset on success
//! - [`RateLimiter`]: token bucket for outgoing remote requests
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use kinto_replication::resilience::{Backoff, RetryConfig};
//!
//! let mut backoff = Backoff::new(RetryConfig::daemon());
//! let delay = backoff.next_delay(); // 1s
//! tokio::time::sleep(delay).await;
//! backoff.reset(); // after a successful request
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

/// Delay schedule for retries. Retries are unbounded, only the delay is
/// capped.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay after the first failure. Also the floor after a reset.
    pub initial_delay: Duration,

    /// Ceiling for the exponential growth.
    pub max_delay: Duration,

    /// Growth per consecutive failure. Values below 1.0 are treated as 1.0.
    pub backoff_factor: f64,
}

impl RetryConfig {
    /// Retry forever, starting at `initial` and doubling up to `max`.
    pub fn forever(initial: Duration, max: Duration) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max.max(initial),
            backoff_factor: 2.0,
        }
    }

    /// Infinite retry for long-running replication (never give up).
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 9        256s
    /// 10+      300s (cap)
    /// ```
    pub fn daemon() -> Self {
        Self::forever(Duration::from_secs(1), Duration::from_secs(300))
    }

    /// Fast schedule for tests.
    pub fn testing() -> Self {
        Self::forever(Duration::from_millis(10), Duration::from_millis(100))
    }

    /// Delay for a given attempt number (1-indexed).
    ///
    /// Non-decreasing in `attempt` and never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return self.initial_delay.min(self.max_delay);
        }

        let factor = self.backoff_factor.max(1.0);
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let nanos = self.initial_delay.as_nanos() as f64 * factor.powi(exponent);

        if nanos.is_finite() && nanos >= 0.0 && nanos < self.max_delay.as_nanos() as f64 {
            Duration::from_nanos(nanos.round() as u64)
        } else {
            self.max_delay
        }
    }
}

// =============================================================================
// Backoff Tracking
// =============================================================================

/// Consecutive-failure tracker over a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    failures: usize,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, failures: 0 }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.config.delay_for_attempt(self.failures)
    }

    /// Delay the next failure would produce, without recording it.
    pub fn peek(&self) -> Duration {
        self.config.delay_for_attempt(self.failures.saturating_add(1))
    }

    /// Back to the floor after a success.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Token bucket: tokens refill at `refill_rate` per second up to
/// `burst_size`. Each remote request consumes one token.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 10 requests/sec with burst of 20.
    fn default() -> Self {
        Self {
            burst_size: 20,
            refill_rate: 10,
        }
    }
}

/// Token bucket rate limiter for outgoing remote requests.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Wait for a permit. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("config", &self.config).finish()
    }
}
