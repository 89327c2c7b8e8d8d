use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a producer hands to [`RunQueue::enqueue_message`](super::RunQueue::enqueue_message).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueMessage {
    pub run_id: String,
    pub task_identifier: String,
    pub queue: String,
    pub payload: Value,
    pub concurrency_key: Option<String>,
    pub rate_limit_key: Option<String>,
    pub priority: Option<u32>,
    /// When the run becomes eligible. Defaults to now.
    pub available_at: Option<DateTime<Utc>>,
}

impl EnqueueMessage {
    pub fn new(
        run_id: impl Into<String>,
        task_identifier: impl Into<String>,
        queue: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            task_identifier: task_identifier.into(),
            queue: queue.into(),
            payload,
            concurrency_key: None,
            rate_limit_key: None,
            priority: None,
            available_at: None,
        }
    }

    pub fn with_concurrency_key(mut self, key: impl Into<String>) -> Self {
        self.concurrency_key = Some(key.into());
        self
    }

    pub fn with_rate_limit_key(mut self, key: impl Into<String>) -> Self {
        self.rate_limit_key = Some(key.into());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }
}

/// A run as stored in Redis and handed to consumers.
///
/// Field names are camelCase on the wire because the dequeue script reads
/// `taskIdentifier` and `rateLimitKey` straight out of the JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunQueueMessage {
    pub run_id: String,
    pub task_identifier: String,
    pub org_id: String,
    pub project_id: String,
    pub environment_id: String,
    /// Full queue key, priority segment included.
    pub queue: String,
    /// Parent queue the queue is registered in.
    pub parent_queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    pub payload: Value,
    /// Score in the queue, ms since epoch.
    pub timestamp: i64,
    /// Number of earlier deliveries that were nacked. Kept in its own hash
    /// field, not in the JSON.
    #[serde(skip)]
    pub attempt: u32,
}

/// Result of one atomic dequeue attempt against one queue.
///
/// Everything other than `Dequeued` is a capacity decision, not an error:
/// the queue was left untouched apart from rate-limit rescheduling and
/// orphan cleanup.
#[derive(Debug, Clone, PartialEq)]
pub enum DequeueOutcome {
    Dequeued {
        message: RunQueueMessage,
        /// Messages left in the queue after this one was taken.
        remaining: u64,
    },
    Empty,
    OrgDisabled,
    EnvAtCapacity,
    QueueAtCapacity,
    TaskAtCapacity,
    RateLimited,
}

impl DequeueOutcome {
    pub fn is_dequeued(&self) -> bool {
        matches!(self, DequeueOutcome::Dequeued { .. })
    }

    pub fn into_message(self) -> Option<RunQueueMessage> {
        match self {
            DequeueOutcome::Dequeued { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Result of polling a parent queue: at most one message, plus the latest
/// queue-depth sample for the consumer pool's autoscaler.
#[derive(Debug, Clone, Default)]
pub struct DequeueAttempt {
    pub message: Option<RunQueueMessage>,
    pub queue_depth: u64,
    /// Queues that were tried and refused for capacity reasons.
    pub throttled: usize,
}
