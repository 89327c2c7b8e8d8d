use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

/// Exponential backoff between attempts of a failing job.
///
/// The delay before retry `n` (0-based) is `min_timeout * factor^n`,
/// multiplied by a random factor in `[1, 2)` when `randomize` is set, and
/// capped at `max_timeout`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Total deliveries allowed, the first one included.
    pub max_attempts: u32,
    pub factor: f64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub randomize: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            factor: 2.0,
            min_timeout_ms: 1_000,
            max_timeout_ms: 3_600_000,
            randomize: true,
        }
    }
}

impl RetryOptions {
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_timeouts(mut self, min: Duration, max: Duration) -> Self {
        self.min_timeout_ms = min.as_millis() as u64;
        self.max_timeout_ms = max.as_millis() as u64;
        self
    }

    pub fn with_randomize(mut self, randomize: bool) -> Self {
        self.randomize = randomize;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(QueueError::Configuration("max_attempts must be >= 1".into()));
        }
        if !(self.factor >= 1.0) {
            return Err(QueueError::Configuration("retry factor must be >= 1".into()));
        }
        if self.max_timeout_ms < self.min_timeout_ms {
            return Err(QueueError::Configuration(
                "max_timeout_ms must be >= min_timeout_ms".into(),
            ));
        }
        Ok(())
    }

    /// Whether a job that just failed its `attempt`-th delivery (0-based)
    /// gets another one.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let multiplier = if self.randomize {
            1.0 + rand::random::<f64>()
        } else {
            1.0
        };
        self.delay_with(retry, multiplier)
    }

    fn delay_with(&self, retry: u32, multiplier: f64) -> Duration {
        let exponent = retry.min(i32::MAX as u32) as i32;
        let raw = self.min_timeout_ms as f64 * self.factor.powi(exponent) * multiplier;
        let capped = if raw.is_finite() {
            raw.round().min(self.max_timeout_ms as f64)
        } else {
            self.max_timeout_ms as f64
        };
        Duration::from_millis(capped as u64)
    }
}
