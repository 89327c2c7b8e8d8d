use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::retry::RetryOptions;
use crate::error::{QueueError, Result};

/// How a job failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    /// Try again later, subject to the retry options.
    #[error("retryable: {0}")]
    Retryable(String),
    /// Never retried; the item goes straight to the dead-letter queue.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl JobError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        JobError::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        JobError::Fatal(msg.into())
    }

    pub fn message(&self) -> &str {
        match self {
            JobError::Retryable(m) | JobError::Fatal(m) => m,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: String,
    pub job: String,
    /// Earlier deliveries of this item.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// A job type: a name, a payload type and the code that runs it.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Payload: Serialize + DeserializeOwned + Send + 'static;

    /// Stored with every item; must be unique within a catalog.
    const NAME: &'static str;

    async fn handle(&self, payload: Self::Payload, ctx: JobContext) -> Result<(), JobError>;

    /// Overrides the worker's retry options for this job.
    fn retry_options(&self) -> Option<RetryOptions> {
        None
    }

    /// Overrides the worker's visibility timeout for this job.
    fn visibility_timeout(&self) -> Option<Duration> {
        None
    }
}

#[async_trait]
pub(crate) trait ErasedJob: Send + Sync {
    async fn run(&self, payload: Value, ctx: JobContext) -> Result<(), JobError>;
    fn retry_options(&self) -> Option<RetryOptions>;
    fn visibility_timeout(&self) -> Option<Duration>;
}

struct Typed<H>(H);

#[async_trait]
impl<H: JobHandler> ErasedJob for Typed<H> {
    async fn run(&self, payload: Value, ctx: JobContext) -> Result<(), JobError> {
        let payload: H::Payload = serde_json::from_value(payload)
            .map_err(|e| JobError::Fatal(format!("undecodable {} payload: {}", H::NAME, e)))?;
        self.0.handle(payload, ctx).await
    }

    fn retry_options(&self) -> Option<RetryOptions> {
        self.0.retry_options()
    }

    fn visibility_timeout(&self) -> Option<Duration> {
        self.0.visibility_timeout()
    }
}

/// Every job type a worker knows, fixed before the worker starts.
#[derive(Default, Clone)]
pub struct JobCatalog {
    jobs: HashMap<&'static str, Arc<dyn ErasedJob>>,
    duplicates: Vec<&'static str>,
}

impl JobCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job type. A second handler for a name that is already taken is
    /// not added, and [`validate`](Self::validate) reports it.
    pub fn register<H: JobHandler>(mut self, handler: H) -> Self {
        if self.jobs.contains_key(H::NAME) {
            self.duplicates.push(H::NAME);
        } else {
            self.jobs.insert(H::NAME, Arc::new(Typed(handler)));
        }
        self
    }

    /// Fails if a job name was registered more than once.
    pub fn validate(&self) -> Result<()> {
        if self.duplicates.is_empty() {
            return Ok(());
        }
        Err(QueueError::Configuration(format!(
            "job names registered more than once: {}",
            self.duplicates.join(", ")
        )))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.jobs.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn ErasedJob>> {
        self.jobs.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct Email {
        to: String,
    }

    struct SendEmail;

    #[async_trait]
    impl JobHandler for SendEmail {
        type Payload = Email;
        const NAME: &'static str = "send_email";

        async fn handle(&self, payload: Email, ctx: JobContext) -> Result<(), JobError> {
            if payload.to.is_empty() {
                return Err(JobError::fatal("no recipient"));
            }
            if ctx.attempt == 0 {
                return Err(JobError::retryable("smtp busy"));
            }
            Ok(())
        }

        fn retry_options(&self) -> Option<RetryOptions> {
            Some(RetryOptions::default().with_max_attempts(2))
        }
    }

    fn ctx(attempt: u32) -> JobContext {
        JobContext {
            id: "1".into(),
            job: SendEmail::NAME.into(),
            attempt,
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn dispatches_typed_payloads() {
        let catalog = JobCatalog::new().register(SendEmail);
        assert!(catalog.contains("send_email"));
        assert_eq!(catalog.names(), vec!["send_email"]);

        let job = catalog.get("send_email").unwrap();
        assert_eq!(job.retry_options().unwrap().max_attempts, 2);
        assert_eq!(
            job.run(json!({"to": "a@b.c"}), ctx(0)).await,
            Err(JobError::retryable("smtp busy"))
        );
        assert_eq!(job.run(json!({"to": "a@b.c"}), ctx(1)).await, Ok(()));
        assert_eq!(
            job.run(json!({"to": ""}), ctx(1)).await,
            Err(JobError::fatal("no recipient"))
        );
    }

    #[tokio::test]
    async fn duplicate_names_are_reported() {
        struct OtherEmail;

        #[async_trait]
        impl JobHandler for OtherEmail {
            type Payload = Email;
            const NAME: &'static str = "send_email";

            async fn handle(&self, _: Email, _: JobContext) -> Result<(), JobError> {
                Err(JobError::fatal("should never run"))
            }
        }

        assert!(JobCatalog::new().register(SendEmail).validate().is_ok());

        let catalog = JobCatalog::new().register(SendEmail).register(OtherEmail);
        assert!(matches!(catalog.validate(), Err(QueueError::Configuration(_))));
        assert_eq!(catalog.len(), 1);
        // the first registration stays in place
        let job = catalog.get("send_email").unwrap();
        assert_eq!(job.run(json!({"to": "a@b.c"}), ctx(1)).await, Ok(()));
    }

    #[tokio::test]
    async fn undecodable_payload_is_fatal() {
        let catalog = JobCatalog::new().register(SendEmail);
        let job = catalog.get("send_email").unwrap();
        let err = job.run(json!({"wrong": 1}), ctx(0)).await.unwrap_err();
        assert!(matches!(err, JobError::Fatal(_)));
        assert!(catalog.get("missing").is_none());
    }
}
