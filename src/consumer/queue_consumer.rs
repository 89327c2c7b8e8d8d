use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::metrics::{MetricsSink, NoopMetrics, MESSAGES_DEQUEUED};
use crate::run_queue::{DequeueAttempt, RunQueue, RunQueueMessage};

/// Where consumers get work from.
#[async_trait]
pub trait MessageSource: Send + Sync + 'static {
    async fn poll(&self, consumer_id: &str) -> Result<DequeueAttempt>;
}

/// Processes one dequeued message. Errors are logged and the consumer moves
/// on; settling the message (ack/nack) is the handler's job.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, consumer_id: &str, message: RunQueueMessage) -> Result<()>;
}

/// Polls a run queue's shared parent queue, or a worker queue when one is
/// given.
pub struct RunQueueSource {
    queue: Arc<RunQueue>,
    parent_queue: String,
}

impl RunQueueSource {
    pub fn shared(queue: Arc<RunQueue>) -> Self {
        let parent_queue = queue.keys().shared_queue_key();
        Self {
            queue,
            parent_queue,
        }
    }

    pub fn worker_queue(queue: Arc<RunQueue>, worker_queue: &str) -> Self {
        let parent_queue = queue.keys().worker_queue_key(worker_queue);
        Self {
            queue,
            parent_queue,
        }
    }

    pub fn parent_queue(&self) -> &str {
        &self.parent_queue
    }
}

#[async_trait]
impl MessageSource for RunQueueSource {
    async fn poll(&self, consumer_id: &str) -> Result<DequeueAttempt> {
        self.queue
            .poll_parent_queue(consumer_id, &self.parent_queue)
            .await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerOptions {
    /// Sleep after an empty poll or a failed one.
    pub poll_interval_ms: u64,
    /// Sleep after a poll that returned a message.
    pub immediate_poll_interval_ms: u64,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            immediate_poll_interval_ms: 100,
        }
    }
}

impl ConsumerOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn immediate_poll_interval(&self) -> Duration {
        Duration::from_millis(self.immediate_poll_interval_ms)
    }
}

/// A single polling loop.
pub struct QueueConsumer {
    id: String,
    source: Arc<dyn MessageSource>,
    handler: Arc<dyn MessageHandler>,
    options: ConsumerOptions,
    depth_tx: Option<mpsc::UnboundedSender<u64>>,
    metrics: Arc<dyn MetricsSink>,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl QueueConsumer {
    pub fn new(
        id: impl Into<String>,
        source: Arc<dyn MessageSource>,
        handler: Arc<dyn MessageHandler>,
        options: ConsumerOptions,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        Self {
            id: id.into(),
            source,
            handler,
            options,
            depth_tx: None,
            metrics: Arc::new(NoopMetrics),
            shutdown_tx,
            handle: None,
        }
    }

    /// Send every poll's queue-depth sample to `tx`.
    pub fn with_depth_reporter(mut self, tx: mpsc::UnboundedSender<u64>) -> Self {
        self.depth_tx = Some(tx);
        self
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let id = self.id.clone();
        let source = self.source.clone();
        let handler = self.handler.clone();
        let metrics = self.metrics.clone();
        let depth_tx = self.depth_tx.take();
        let steady = self.options.poll_interval();
        let immediate = self.options.immediate_poll_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.handle = Some(tokio::spawn(async move {
            debug!(consumer_id = %id, "consumer started");
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                // neither the poll nor the handler is cancelled; shutdown is
                // only observed between iterations
                let sleep_for = match source.poll(&id).await {
                    Ok(attempt) => {
                        if let Some(tx) = &depth_tx {
                            let _ = tx.send(attempt.queue_depth);
                        }
                        match attempt.message {
                            Some(message) => {
                                metrics.inc_counter(MESSAGES_DEQUEUED, 1);
                                let run_id = message.run_id.clone();
                                if let Err(e) = handler.handle(&id, message).await {
                                    error!(consumer_id = %id, run_id = %run_id, error = %e, "message handler failed");
                                }
                                immediate
                            }
                            None => steady,
                        }
                    }
                    Err(e) => {
                        warn!(consumer_id = %id, error = %e, "dequeue failed");
                        steady
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {},
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!(consumer_id = %id, "consumer stopped");
        }));
    }

    /// Stop polling and wait for the current iteration to finish.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(consumer_id = %self.id, error = %e, "consumer task panicked");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use serde_json::json;

    /// Hands out `remaining` messages, then reports `depth` forever.
    pub(crate) struct FakeSource {
        pub remaining: AtomicU64,
        pub depth: AtomicU64,
        pub polls: AtomicU64,
    }

    impl FakeSource {
        pub(crate) fn new(messages: u64, depth: u64) -> Self {
            Self {
                remaining: AtomicU64::new(messages),
                depth: AtomicU64::new(depth),
                polls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl MessageSource for FakeSource {
        async fn poll(&self, _consumer_id: &str) -> Result<DequeueAttempt> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let take = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let message = take.then(|| RunQueueMessage {
                run_id: format!("run_{}", self.polls.load(Ordering::SeqCst)),
                task_identifier: "task".into(),
                org_id: "o".into(),
                project_id: "p".into(),
                environment_id: "e".into(),
                queue: "q".into(),
                parent_queue: "parent".into(),
                concurrency_key: None,
                rate_limit_key: None,
                priority: None,
                payload: json!({}),
                timestamp: 0,
                attempt: 0,
            });
            Ok(DequeueAttempt {
                message,
                queue_depth: self.depth.load(Ordering::SeqCst),
                throttled: 0,
            })
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingHandler {
        pub seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, consumer_id: &str, message: RunQueueMessage) -> Result<()> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push((consumer_id.to_string(), message.run_id));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drains_fast_then_polls_slowly() {
        let source = Arc::new(FakeSource::new(3, 7));
        let handler = Arc::new(RecordingHandler::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut consumer = QueueConsumer::new(
            "c1",
            source.clone(),
            handler.clone(),
            ConsumerOptions {
                poll_interval_ms: 1_000,
                immediate_poll_interval_ms: 10,
            },
        )
        .with_depth_reporter(tx);
        consumer.start();
        assert!(consumer.is_running());

        // three immediate polls with messages, one empty poll, then idle
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(handler.seen.lock().unwrap().len(), 3);
        assert_eq!(source.polls.load(Ordering::SeqCst), 4);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(source.polls.load(Ordering::SeqCst), 5);

        consumer.stop().await;
        let mut samples = Vec::new();
        while let Ok(sample) = rx.try_recv() {
            samples.push(sample);
        }
        assert_eq!(samples, vec![7; 5]);
    }
}
