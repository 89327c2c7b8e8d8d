//! # fairq
//!
//! A multi-tenant, Redis-backed fair queue scheduler.
//!
//! Runs are enqueued into per-queue sorted sets grouped under parent queues.
//! Consumers poll a parent queue; a pluggable [`FairDequeueStrategy`]
//! decides the order in which tenants and their queues are tried, and a
//! single Lua script per attempt checks the concurrency limits of every
//! scope (queue, concurrency key, task, environment, organization), the
//! queue's token-bucket rate limit, and claims the run.
//!
//! Around that core:
//!
//! - [`SimpleQueue`]: a delay queue with visibility timeouts and a
//!   dead-letter queue, used by the [`Worker`] harness.
//! - [`batch`]: idempotent batch completion tracking and a deficit round
//!   robin scheduler that drains batch items fairly across environments.
//! - [`consumer`]: polling consumers and a pool that scales itself from
//!   EWMA-smoothed queue depth.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fairq::{
//!     EnqueueMessage, KeyStyle, NoopStrategy, RedisOptions, RedisStore, RunQueue,
//!     RunQueueOptions, RuntimeEnvironment,
//! };
//!
//! # async fn run() -> fairq::Result<()> {
//! let store = RedisStore::connect(&RedisOptions::default()).await?;
//! let options = RunQueueOptions::default().with_key_style(KeyStyle::Long);
//! let keys = fairq::KeyProducer::new(store.key_prefix(), options.key_style);
//! let strategy = Arc::new(NoopStrategy::new(store.clone(), keys, 100));
//! let queue = RunQueue::new(store, options, strategy)?;
//!
//! let env = RuntimeEnvironment::new("org_1", "proj_1", "env_1", 10);
//! queue
//!     .enqueue_message(
//!         &env,
//!         EnqueueMessage::new("run_1", "send-email", "emails", serde_json::json!({})),
//!         None,
//!     )
//!     .await?;
//!
//! if let Some(message) = queue.dequeue_message_in_shared_queue("consumer-1").await? {
//!     // ... run it ...
//!     queue.acknowledge_message(&message.org_id, &message.run_id).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod consumer;
pub mod error;
pub mod fair;
pub mod keys;
pub mod metrics;
pub mod run_queue;
pub mod simple_queue;
pub mod store;
pub mod worker;

pub use error::{QueueError, Result};
pub use fair::{
    EnvPriorityStrategy, EnvQueues, FairDequeueStrategy, NoopStrategy, PriorityStrategy,
    WeightedShuffleOptions, WeightedShuffleStrategy,
};
pub use keys::{KeyProducer, KeyStyle, QueueDescriptor, RuntimeEnvironment};
pub use metrics::{MetricsSink, NoopMetrics};
pub use run_queue::{
    DequeueOutcome, EnqueueMessage, RateLimitConfig, RunQueue, RunQueueMessage, RunQueueOptions,
};
pub use simple_queue::{EnqueueItem, QueueItem, SimpleQueue};
pub use store::{RedisOptions, RedisStore};
pub use worker::{JobCatalog, JobError, JobHandler, RetryOptions, Worker, WorkerOptions};
