use std::time::Duration;

use rand::Rng;
use warden_core::{PipelineConfig, WardenError};

/// Bounded exponential backoff with jitter, shared by every stage.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use warden_review::RetryPolicy;
///
/// let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(5));
/// let delay = policy.delay(1, None);
/// assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(100));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per stage, including the first one.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
            max_backoff,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.base_backoff(),
            config.max_backoff(),
        )
    }

    /// Whether another attempt is allowed after `failed` attempts failed with `err`.
    pub fn should_retry(&self, failed: u32, err: &WardenError) -> bool {
        err.is_retryable() && failed < self.max_attempts
    }

    /// Delay before the next attempt, after `failed` consecutive failures.
    ///
    /// The exponential step `base * 2^(failed - 1)` is capped at `max_backoff`
    /// and jittered into its upper half. A server `hint` is a floor, even
    /// above the cap.
    pub fn delay(&self, failed: u32, hint: Option<Duration>) -> Duration {
        let exponent = failed.saturating_sub(1).min(16);
        let step = self
            .base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);

        let half = step / 2;
        let jitter_ms = half.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        let delay = half + jitter;

        match hint {
            Some(floor) => delay.max(floor),
            None => delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}
