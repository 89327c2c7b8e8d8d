//! Batches: completion bookkeeping, fair scheduling of batch items across
//! environments, and the processing loop tying the two together.

mod completion;
mod drr;
mod queue;
mod redis_drr;

pub use completion::{BatchCompletionTracker, BatchItemFailure, BatchMeta, BatchResult};
pub use drr::{
    BatchItem, DrrBackend, DrrOptions, DrrScheduler, InMemoryDrrBackend, PopResult, ScheduledItem,
};
pub use queue::{
    BatchCompletionHandler, BatchItemHandler, BatchQueue, BatchQueueOptions, ItemOutcome,
};
pub use redis_drr::RedisDrrBackend;
