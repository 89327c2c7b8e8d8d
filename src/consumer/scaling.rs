//! Target consumer count computation.

use serde::{Deserialize, Serialize};

/// How the pool turns a smoothed queue length into a consumer count.
///
/// Every strategy first derives the count that would keep
/// `queue length / consumers` at `target_ratio`, then decides how far to
/// move towards it. The result is always clamped to `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingStrategy {
    /// Static pool; never rescales.
    None,
    /// Moves half of the way to the ideal count per evaluation.
    #[default]
    Smooth,
    /// Jumps straight to the ideal count when scaling up, halves the gap
    /// when scaling down.
    Aggressive,
}

impl ScalingStrategy {
    pub fn is_dynamic(&self) -> bool {
        !matches!(self, ScalingStrategy::None)
    }

    pub fn target_count(
        &self,
        smoothed_queue_length: f64,
        current: usize,
        target_ratio: f64,
        min: usize,
        max: usize,
    ) -> usize {
        let ideal = ideal_count(smoothed_queue_length, target_ratio);
        let target = match self {
            ScalingStrategy::None => current,
            ScalingStrategy::Smooth => halfway(current, ideal),
            ScalingStrategy::Aggressive if ideal > current => ideal,
            ScalingStrategy::Aggressive => halfway(current, ideal),
        };
        target.clamp(min, max.max(min))
    }
}

fn ideal_count(smoothed_queue_length: f64, target_ratio: f64) -> usize {
    if !(target_ratio > 0.0) || !smoothed_queue_length.is_finite() {
        return 0;
    }
    (smoothed_queue_length.max(0.0) / target_ratio).ceil() as usize
}

/// Half the gap, rounded away from `current` so any gap moves by at least one.
fn halfway(current: usize, ideal: usize) -> usize {
    if ideal > current {
        current + (ideal - current).div_ceil(2)
    } else {
        current - (current - ideal).div_ceil(2)
    }
}
