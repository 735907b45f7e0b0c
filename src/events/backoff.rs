//! Retry spacing for failed flushes.

use std::time::Duration;

/// Delay before the next flush after `n` consecutive failures.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max: max.max(initial),
            factor: factor.max(1.0),
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Zero for no failures, otherwise `initial * factor^(failures - 1)`
    /// capped at `max`, jittered by up to ±`jitter`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = failures.saturating_sub(1).min(64) as i32;
        let base = self.initial.as_millis() as f64 * self.factor.powi(exponent);
        let capped = base.min(self.max.as_millis() as f64);

        let jittered = if self.jitter > 0.0 {
            let range = capped * self.jitter;
            (capped + rand::random::<f64>() * range * 2.0 - range).max(0.0)
        } else {
            capped
        };
        Duration::from_millis(jittered.min(self.max.as_millis() as f64) as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2.0)
    }
}
