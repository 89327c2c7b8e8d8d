use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

/// Token bucket settings for one queue: `limit` tokens refill every
/// `period_ms`, the bucket never holds more than `burst`.
///
/// Each distinct `rate_limit_key` on the queue gets its own bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub limit: u32,
    pub period_ms: u64,
    pub burst: u32,
}

impl RateLimitConfig {
    pub fn new(limit: u32, period_ms: u64, burst: u32) -> Result<Self> {
        let config = Self {
            limit,
            period_ms,
            burst,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(QueueError::Configuration("rate limit must be > 0".into()));
        }
        if self.period_ms == 0 {
            return Err(QueueError::Configuration(
                "rate limit period_ms must be > 0".into(),
            ));
        }
        if self.burst == 0 {
            return Err(QueueError::Configuration(
                "rate limit burst must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Tokens added per millisecond.
    pub fn refill_per_ms(&self) -> f64 {
        self.limit as f64 / self.period_ms as f64
    }
}

/// What the dequeue script does with a message whose bucket is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitBackoff {
    /// Leave it where it is; the next dequeue looks at it again.
    #[default]
    Keep,
    /// Move its score forward to the moment the bucket has a token.
    Reschedule,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_values() {
        assert!(RateLimitConfig::new(0, 1000, 1).is_err());
        assert!(RateLimitConfig::new(1, 0, 1).is_err());
        assert!(RateLimitConfig::new(1, 1000, 0).is_err());
        assert!(RateLimitConfig::new(2, 600_000, 2).is_ok());
    }

    #[test]
    fn refill_rate() {
        let config = RateLimitConfig::new(10, 1000, 5).unwrap();
        assert!((config.refill_per_ms() - 0.01).abs() < f64::EPSILON);
    }

    #[test]
    fn stored_as_camel_case() {
        let json = serde_json::to_value(RateLimitConfig::new(2, 60_000, 2).unwrap()).unwrap();
        assert_eq!(json["periodMs"], 60_000);
    }
}
