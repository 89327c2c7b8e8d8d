//! Counters and gauges emitted by the long-running components, without
//! coupling them to a metrics backend.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

pub const MESSAGES_DEQUEUED: &str = "messages_dequeued";
pub const MESSAGES_ACKED: &str = "messages_acked";
pub const JOB_RETRIED: &str = "job_retried";
pub const JOB_DEAD_LETTERED: &str = "job_dead_lettered";
pub const POOL_SCALED_UP: &str = "pool_scaled_up";
pub const POOL_SCALED_DOWN: &str = "pool_scaled_down";
pub const POOL_CONSUMER_COUNT: &str = "pool_consumer_count";

pub trait MetricsSink: Send + Sync + 'static {
    fn inc_counter(&self, name: &str, value: u64);
    fn observe_duration(&self, _name: &str, _dur: Duration) {}
    fn gauge(&self, _name: &str, _value: f64) {}
}

pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn inc_counter(&self, _name: &str, _value: u64) {}
}

/// Keeps everything in memory. Useful in tests and for ad-hoc inspection.
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|c| c.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges.lock().ok().and_then(|g| g.get(name).copied())
    }
}

impl MetricsSink for InMemoryMetrics {
    fn inc_counter(&self, name: &str, value: u64) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name.to_string()).or_insert(0) += value;
        }
    }

    fn gauge(&self, name: &str, value: f64) {
        if let Ok(mut gauges) = self.gauges.lock() {
            gauges.insert(name.to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_sink_accumulates() {
        let sink = InMemoryMetrics::new();
        sink.inc_counter(MESSAGES_ACKED, 2);
        sink.inc_counter(MESSAGES_ACKED, 3);
        sink.gauge(POOL_CONSUMER_COUNT, 4.0);
        sink.gauge(POOL_CONSUMER_COUNT, 2.0);
        assert_eq!(sink.counter(MESSAGES_ACKED), 5);
        assert_eq!(sink.counter(JOB_RETRIED), 0);
        assert_eq!(sink.gauge_value(POOL_CONSUMER_COUNT), Some(2.0));
    }
}
