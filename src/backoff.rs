//! Exponential backoff for watch retries

use std::time::Duration;

/// Exponential backoff with additive random jitter
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    minimum_delay: Duration,
    maximum_delay: Duration,
    factor: f64,
    jitter: Duration,
}

impl ExponentialBackoff {
    pub fn new(minimum_delay: Duration, maximum_delay: Duration, factor: f64, jitter: Duration) -> Self {
        Self {
            minimum_delay,
            maximum_delay,
            factor,
            jitter,
        }
    }

    /// Delay before retry number `attempt` (zero-based): the minimum delay
    /// grown by `factor` per attempt plus up to `jitter`, capped at the maximum
    pub fn duration(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base = self.minimum_delay.as_secs_f64() * self.factor.powi(exponent);
        let jitter = rand::random::<f64>() * self.jitter.as_secs_f64();
        let capped = (base + jitter).min(self.maximum_delay.as_secs_f64());

        if capped.is_finite() {
            Duration::from_secs_f64(capped.max(0.0))
        } else {
            self.maximum_delay
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(500),
            Duration::from_secs(30),
            2.0,
            Duration::from_millis(250),
        )
    }
}
