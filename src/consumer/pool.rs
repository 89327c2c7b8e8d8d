//! A pool of [`QueueConsumer`]s that resizes itself from the queue depth the
//! consumers observe.
//!
//! Consumers push a depth sample after every poll. The pool's control task
//! feeds them to [`ScalingMetrics`]; every closed window triggers a scaling
//! evaluation, which is skipped while another one is in flight or while the
//! relevant cooldown (plus jitter) has not elapsed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::metrics::ScalingMetrics;
use super::queue_consumer::{ConsumerOptions, MessageHandler, MessageSource, QueueConsumer};
use super::scaling::ScalingStrategy;
use crate::error::{QueueError, Result};
use crate::metrics::{
    MetricsSink, NoopMetrics, POOL_CONSUMER_COUNT, POOL_SCALED_DOWN, POOL_SCALED_UP,
};

/// Upper bound of the random delay added to every cooldown.
const MAX_JITTER_MS: u64 = 3_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingOptions {
    pub strategy: ScalingStrategy,
    pub min_consumer_count: usize,
    pub max_consumer_count: usize,
    pub scale_up_cooldown_ms: u64,
    pub scale_down_cooldown_ms: u64,
    pub ewma_alpha: f64,
    pub batch_window_ms: u64,
    /// Queue items per consumer the pool aims for.
    pub target_ratio: f64,
    pub disable_jitter: bool,
}

impl Default for ScalingOptions {
    fn default() -> Self {
        Self {
            strategy: ScalingStrategy::Smooth,
            min_consumer_count: 1,
            max_consumer_count: 10,
            scale_up_cooldown_ms: 10_000,
            scale_down_cooldown_ms: 60_000,
            ewma_alpha: 0.3,
            batch_window_ms: 1_000,
            target_ratio: 1.0,
            disable_jitter: false,
        }
    }
}

impl ScalingOptions {
    pub fn validate(&self) -> Result<()> {
        if self.min_consumer_count == 0 {
            return Err(QueueError::Configuration(
                "min_consumer_count must be >= 1".into(),
            ));
        }
        if self.max_consumer_count < self.min_consumer_count {
            return Err(QueueError::Configuration(format!(
                "max_consumer_count ({}) is below min_consumer_count ({})",
                self.max_consumer_count, self.min_consumer_count
            )));
        }
        if !(self.target_ratio > 0.0) {
            return Err(QueueError::Configuration("target_ratio must be > 0".into()));
        }
        ScalingMetrics::new(self.ewma_alpha, Duration::from_millis(self.batch_window_ms))?;
        Ok(())
    }

    fn initial_count(&self) -> usize {
        if self.strategy.is_dynamic() {
            self.min_consumer_count
        } else {
            self.max_consumer_count
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerPoolOptions {
    pub scaling: ScalingOptions,
    pub consumer: ConsumerOptions,
    pub consumer_id_prefix: String,
}

impl Default for ConsumerPoolOptions {
    fn default() -> Self {
        Self {
            scaling: ScalingOptions::default(),
            consumer: ConsumerOptions::default(),
            consumer_id_prefix: "consumer".into(),
        }
    }
}

impl ConsumerPoolOptions {
    pub fn with_scaling(mut self, scaling: ScalingOptions) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn with_consumer(mut self, consumer: ConsumerOptions) -> Self {
        self.consumer = consumer;
        self
    }

    pub fn with_consumer_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_id_prefix = prefix.into();
        self
    }
}

/// Read-only view of the scaling state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerPoolMetrics {
    pub target_consumer_count: usize,
    pub queue_length: Option<u64>,
    pub smoothed_queue_length: Option<f64>,
    pub last_scale_time: Option<Instant>,
    pub last_queue_length_update: Option<Instant>,
}

struct ScalingState {
    signal: ScalingMetrics,
    target: usize,
    last_scale_time: Option<Instant>,
}

struct PoolInner {
    options: ConsumerPoolOptions,
    source: Arc<dyn MessageSource>,
    handler: Arc<dyn MessageHandler>,
    sink: Arc<dyn MetricsSink>,
    running: AtomicBool,
    is_scaling: AtomicBool,
    next_seq: AtomicU64,
    /// Most recently added last.
    consumers: Mutex<Vec<QueueConsumer>>,
    depth_tx: Mutex<Option<mpsc::UnboundedSender<u64>>>,
    scaling: std::sync::Mutex<ScalingState>,
}

pub struct ConsumerPool {
    inner: Arc<PoolInner>,
    control: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerPool {
    pub fn new(
        source: Arc<dyn MessageSource>,
        handler: Arc<dyn MessageHandler>,
        options: ConsumerPoolOptions,
    ) -> Result<Self> {
        options.scaling.validate()?;
        let signal = ScalingMetrics::new(
            options.scaling.ewma_alpha,
            Duration::from_millis(options.scaling.batch_window_ms),
        )?;
        let target = options.scaling.initial_count();
        Ok(Self {
            inner: Arc::new(PoolInner {
                options,
                source,
                handler,
                sink: Arc::new(NoopMetrics),
                running: AtomicBool::new(false),
                is_scaling: AtomicBool::new(false),
                next_seq: AtomicU64::new(0),
                consumers: Mutex::new(Vec::new()),
                depth_tx: Mutex::new(None),
                scaling: std::sync::Mutex::new(ScalingState {
                    signal,
                    target,
                    last_scale_time: None,
                }),
            }),
            control: Mutex::new(None),
        })
    }

    /// Must be called before `start`.
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.sink = sink;
        }
        self
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(QueueError::Internal("consumer pool already running".into()));
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.inner.depth_tx.lock().await = Some(tx);

        let initial = self.inner.options.scaling.initial_count();
        {
            let mut consumers = self.inner.consumers.lock().await;
            self.inner.add_consumers(&mut consumers, initial).await;
        }
        if let Ok(mut state) = self.inner.scaling.lock() {
            state.target = initial;
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            while let Some(sample) = rx.recv().await {
                inner.update_queue_length(sample).await;
            }
            debug!("consumer pool control loop ended");
        });
        *self.control.lock().await = Some(handle);

        info!(
            consumers = initial,
            strategy = ?self.inner.options.scaling.strategy,
            "consumer pool started"
        );
        Ok(())
    }

    /// Stop every consumer, waiting for in-flight iterations.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.depth_tx.lock().await.take();
        let drained: Vec<QueueConsumer> = {
            let mut consumers = self.inner.consumers.lock().await;
            consumers.drain(..).rev().collect()
        };
        for consumer in drained {
            consumer.stop().await;
        }
        if let Some(handle) = self.control.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "consumer pool control task panicked");
            }
        }
        self.inner.sink.gauge(POOL_CONSUMER_COUNT, 0.0);
        info!("consumer pool stopped");
    }

    /// Feed one queue-depth sample. Consumers of this pool already report
    /// theirs; this is for external signals.
    pub async fn update_queue_length(&self, sample: u64) {
        self.inner.update_queue_length(sample).await;
    }

    pub async fn consumer_count(&self) -> usize {
        self.inner.consumers.lock().await.len()
    }

    /// Ids of the live consumers, oldest first.
    pub async fn consumer_ids(&self) -> Vec<String> {
        self.inner
            .consumers
            .lock()
            .await
            .iter()
            .map(|c| c.id().to_string())
            .collect()
    }

    pub fn metrics(&self) -> ConsumerPoolMetrics {
        match self.inner.scaling.lock() {
            Ok(state) => ConsumerPoolMetrics {
                target_consumer_count: state.target,
                queue_length: state.signal.queue_length(),
                smoothed_queue_length: state.signal.smoothed_queue_length(),
                last_scale_time: state.last_scale_time,
                last_queue_length_update: state.signal.last_queue_length_update(),
            },
            Err(_) => ConsumerPoolMetrics {
                target_consumer_count: 0,
                queue_length: None,
                smoothed_queue_length: None,
                last_scale_time: None,
                last_queue_length_update: None,
            },
        }
    }
}

enum Decision {
    Hold,
    Scale { previous: usize, target: usize },
}

impl PoolInner {
    async fn update_queue_length(&self, sample: u64) {
        let closed = match self.scaling.lock() {
            Ok(mut state) => state.signal.record(sample, Instant::now()),
            Err(_) => None,
        };
        if let Some(smoothed) = closed {
            self.evaluate_scaling(smoothed).await;
        }
    }

    async fn evaluate_scaling(&self, smoothed: f64) {
        let scaling = &self.options.scaling;
        if !scaling.strategy.is_dynamic() || !self.running.load(Ordering::SeqCst) {
            return;
        }
        if self
            .is_scaling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("scaling already in progress");
            return;
        }

        let current = self.consumers.lock().await.len();
        match self.decide(smoothed, current) {
            Decision::Hold => {}
            Decision::Scale { previous, target } => {
                match self.scale_to(target).await {
                    Ok(actual) => {
                        if let Ok(mut state) = self.scaling.lock() {
                            state.last_scale_time = Some(Instant::now());
                        }
                        let counter = if target > current {
                            POOL_SCALED_UP
                        } else {
                            POOL_SCALED_DOWN
                        };
                        self.sink.inc_counter(counter, 1);
                        self.sink.gauge(POOL_CONSUMER_COUNT, actual as f64);
                        info!(from = current, to = actual, smoothed_queue_length = smoothed, "consumer pool scaled");
                    }
                    Err(e) => {
                        if let Ok(mut state) = self.scaling.lock() {
                            state.target = previous;
                        }
                        warn!(target, error = %e, "consumer pool scaling failed");
                    }
                }
            }
        }
        self.is_scaling.store(false, Ordering::SeqCst);
    }

    fn decide(&self, smoothed: f64, current: usize) -> Decision {
        let scaling = &self.options.scaling;
        let target = scaling.strategy.target_count(
            smoothed,
            current,
            scaling.target_ratio,
            scaling.min_consumer_count,
            scaling.max_consumer_count,
        );
        if target == current {
            return Decision::Hold;
        }
        let cooldown = if target > current {
            scaling.scale_up_cooldown_ms
        } else {
            scaling.scale_down_cooldown_ms
        };
        let wait = Duration::from_millis(cooldown + self.jitter_ms());

        let Ok(mut state) = self.scaling.lock() else {
            return Decision::Hold;
        };
        if let Some(last) = state.last_scale_time {
            if last.elapsed() < wait {
                debug!(current, target, "scaling held back by cooldown");
                return Decision::Hold;
            }
        }
        let previous = state.target;
        state.target = target;
        Decision::Scale { previous, target }
    }

    fn jitter_ms(&self) -> u64 {
        if self.options.scaling.disable_jitter {
            0
        } else {
            rand::rng().random_range(0..=MAX_JITTER_MS)
        }
    }

    /// Returns the consumer count after scaling.
    async fn scale_to(&self, target: usize) -> Result<usize> {
        let mut consumers = self.consumers.lock().await;
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Internal("consumer pool is not running".into()));
        }
        let current = consumers.len();
        if target > current {
            self.add_consumers(&mut consumers, target - current).await;
        } else {
            let keep = target;
            let removed: Vec<QueueConsumer> = consumers.drain(keep..).rev().collect();
            drop(consumers);
            for consumer in removed {
                consumer.stop().await;
            }
            return Ok(keep);
        }
        Ok(consumers.len())
    }

    async fn add_consumers(&self, consumers: &mut Vec<QueueConsumer>, n: usize) {
        let Some(tx) = self.depth_tx.lock().await.clone() else {
            return;
        };
        for _ in 0..n {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let id = format!("{}-{}", self.options.consumer_id_prefix, seq);
            let mut consumer = QueueConsumer::new(
                id,
                self.source.clone(),
                self.handler.clone(),
                self.options.consumer.clone(),
            )
            .with_depth_reporter(tx.clone())
            .with_metrics(self.sink.clone());
            consumer.start();
            consumers.push(consumer);
        }
    }
}
