//! Worker harness on top of [`SimpleQueue`](crate::simple_queue::SimpleQueue):
//! a typed job catalog, retries with exponential backoff, a dead-letter
//! queue and redrive requests over pub/sub.

mod catalog;
mod engine;
mod retry;

pub use catalog::{JobCatalog, JobContext, JobError, JobHandler};
pub use engine::{JobOutcome, RedriveRequest, Worker, WorkerOptions};
pub use retry::RetryOptions;
