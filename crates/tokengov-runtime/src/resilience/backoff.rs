//! Exponential backoff with additive jitter.
//!
//! Retry `k` (0-indexed) waits `min(base * 2^k + jitter, max_delay)` where
//! jitter is uniform in `[0, jitter_ratio * base * 2^k)`.

use backon::BackoffBuilder;
use rand::Rng;
use std::time::Duration;
use tokengov_core::RetryConfig;

/// Backoff schedule for one `execute` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for BackoffPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base: config.base_delay,
            max_delay: config.max_delay,
            max_retries: config.max_retries,
            jitter_ratio: config.jitter_ratio,
        }
    }
}

impl BackoffPolicy {
    /// Exponential term for retry `attempt`, before jitter and capping.
    pub fn exponential(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }

    /// Delay for retry `attempt` (0-indexed), jitter included.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.exponential(attempt);
        let max_jitter = exp.as_secs_f64() * self.jitter_ratio;
        let jitter = if max_jitter > 0.0 {
            rand::rng().random_range(0.0..max_jitter)
        } else {
            0.0
        };
        let delay = exp.saturating_add(Duration::from_secs_f64(jitter));
        delay.min(self.max_delay)
    }
}

impl BackoffBuilder for BackoffPolicy {
    type Backoff = ExponentialJitter;

    fn build(self) -> Self::Backoff {
        ExponentialJitter {
            policy: self,
            attempt: 0,
        }
    }
}

/// Iterator of retry delays produced by [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct ExponentialJitter {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Iterator for ExponentialJitter {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_retries {
            return None;
        }
        let delay = self.policy.delay_for_attempt(self.attempt);
        self.attempt += 1;
        Some(delay)
    }
}
