//! Queue-depth smoothing for the autoscaler.
//!
//! Raw samples are noisy (every consumer reports after every poll), so they
//! are collected into fixed windows. When a window closes, its median is
//! folded into an exponentially weighted moving average:
//!
//! ```text
//! smoothed = alpha * median + (1 - alpha) * smoothed_prev
//! ```
//!
//! The first closed window seeds the average with its median.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::{QueueError, Result};

#[derive(Debug, Clone)]
pub struct ScalingMetrics {
    alpha: f64,
    batch_window: Duration,
    samples: Vec<u64>,
    window_started: Option<Instant>,
    queue_length: Option<u64>,
    smoothed_queue_length: Option<f64>,
    last_queue_length_update: Option<Instant>,
}

impl ScalingMetrics {
    pub fn new(alpha: f64, batch_window: Duration) -> Result<Self> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(QueueError::Configuration(format!(
                "ewma alpha must be within [0, 1], got {}",
                alpha
            )));
        }
        if batch_window.is_zero() {
            return Err(QueueError::Configuration(
                "batch window must be > 0".into(),
            ));
        }
        Ok(Self {
            alpha,
            batch_window,
            samples: Vec::new(),
            window_started: None,
            queue_length: None,
            smoothed_queue_length: None,
            last_queue_length_update: None,
        })
    }

    /// Add a sample. Returns the new smoothed value when this sample closed a
    /// window, which is the signal to run a scaling evaluation.
    pub fn record(&mut self, sample: u64, now: Instant) -> Option<f64> {
        let started = *self.window_started.get_or_insert(now);
        self.samples.push(sample);
        self.queue_length = Some(sample);
        self.last_queue_length_update = Some(now);

        if now.duration_since(started) < self.batch_window {
            return None;
        }
        let median = median(&mut self.samples)?;
        self.samples.clear();
        self.window_started = None;

        let smoothed = match self.smoothed_queue_length {
            Some(prev) => self.alpha * median + (1.0 - self.alpha) * prev,
            None => median,
        };
        self.smoothed_queue_length = Some(smoothed);
        Some(smoothed)
    }

    pub fn queue_length(&self) -> Option<u64> {
        self.queue_length
    }

    pub fn smoothed_queue_length(&self) -> Option<f64> {
        self.smoothed_queue_length
    }

    pub fn last_queue_length_update(&self) -> Option<Instant> {
        self.last_queue_length_update
    }

    pub fn pending_samples(&self) -> usize {
        self.samples.len()
    }
}

/// Median of the samples; the mean of the two middle values for even
/// counts. Sorts in place.
pub fn median(samples: &mut [u64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_unstable();
    let mid = samples.len() / 2;
    if samples.len() % 2 == 0 {
        Some((samples[mid - 1] as f64 + samples[mid] as f64) / 2.0)
    } else {
        Some(samples[mid] as f64)
    }
}
