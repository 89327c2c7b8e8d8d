//! Error types shared by every fairq component.
//!
//! Capacity rejections (a queue at its concurrency limit, a rate-limited
//! message) are not errors; they surface as [`DequeueOutcome`] values.
//! Everything here is either an infrastructure problem, a bad input, or a
//! misconfiguration caught at construction time.
//!
//! [`DequeueOutcome`]: crate::run_queue::DequeueOutcome

use thiserror::Error;

/// Errors that can occur while talking to the queue store or configuring
/// a component.
///
/// # Examples
///
/// ```rust
/// use fairq::QueueError;
///
/// fn should_back_off(err: &QueueError) -> bool {
///     match err {
///         QueueError::Unavailable(_) | QueueError::Redis(_) => true,
///         QueueError::Configuration(msg) => {
///             eprintln!("refusing to start: {}", msg);
///             false
///         }
///         _ => false,
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum QueueError {
    /// Could not obtain a connection (pool exhausted, server down).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A Redis command or script failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization/deserialization of a stored payload failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid options; raised when a component is built, never mid-run.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The referenced message, batch or item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A key string does not follow the key grammar.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// No handler is registered for the job type.
    #[error("unknown job type: {0}")]
    UnknownJob(String),

    /// A script returned a shape we do not understand.
    #[error("internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Returns true if the failure is transient and the caller should back
    /// off and try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::Unavailable(_) => true,
            QueueError::Redis(err) => {
                err.is_io_error() || err.is_timeout() || err.is_connection_dropped()
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

impl From<bb8_redis::bb8::RunError<redis::RedisError>> for QueueError {
    fn from(err: bb8_redis::bb8::RunError<redis::RedisError>) -> Self {
        QueueError::Unavailable(format!("failed to get Redis connection: {}", err))
    }
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;
