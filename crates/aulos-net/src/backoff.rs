use std::{cmp::min, time::Duration};

/// Backoff configuration for the retry engine.
#[derive(Clone, Debug)]
pub struct BackoffOptions {
    /// Delay before the first same-URL retry. Doubled on each further
    /// retry of the same error class.
    pub base_delay: Duration,
    /// Upper bound on the computed delay, before fuzz.
    pub max_delay: Duration,
    /// Maximum retries for regular (server-side) failures.
    pub max_retry_regular: u32,
    /// Maximum retries while the machine looks offline.
    pub max_retry_offline: u32,
    /// Relative jitter applied to every delay: a factor of 0.3 draws the
    /// actual delay uniformly from ±30% around the computed value.
    /// Zero disables fuzzing, which timing tests rely on.
    pub fuzz_factor: f64,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(3),
            max_retry_regular: 4,
            max_retry_offline: u32::MAX,
            fuzz_factor: 0.3,
        }
    }
}

impl BackoffOptions {
    /// Nth-retry delay, ignoring fuzz: `min(base * 2^(n-1), max)`.
    /// `retry_count` starts at 1 for the first retry.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let exponential = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(retry_count - 1));
        min(exponential, self.max_delay)
    }

    /// Apply the configured jitter to a computed delay.
    pub fn fuzzed(&self, delay: Duration) -> Duration {
        if self.fuzz_factor <= 0.0 {
            return delay;
        }
        let spread = self.fuzz_factor.min(1.0);
        let factor = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * spread;
        delay.mul_f64(factor.max(0.0))
    }
}
