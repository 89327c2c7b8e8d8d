//! Polling consumers and the autoscaling pool that manages them.

mod metrics;
mod pool;
mod queue_consumer;
mod scaling;

pub use metrics::{median, ScalingMetrics};
pub use pool::{ConsumerPool, ConsumerPoolMetrics, ConsumerPoolOptions, ScalingOptions};
pub use queue_consumer::{
    ConsumerOptions, MessageHandler, MessageSource, QueueConsumer, RunQueueSource,
};
pub use scaling::ScalingStrategy;
