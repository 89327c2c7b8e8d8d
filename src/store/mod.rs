//! Shared Redis access: a pooled connection handle plus the key prefix that
//! isolates one deployment (or one test) from another.

mod pool;

use bb8_redis::bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use chrono::Utc;

pub use pool::{create_redis_pool, RedisOptions};
pub(crate) use pool::redacted;

use crate::error::Result;

/// A cloneable handle to the Redis pool.
///
/// Every component receives one of these in its constructor; there is no
/// process-wide client.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool<RedisConnectionManager>,
    url: String,
    key_prefix: String,
}

impl RedisStore {
    /// Build a pool from `options` and verify connectivity.
    pub async fn connect(options: &RedisOptions) -> Result<Self> {
        let pool = create_redis_pool(options).await?;
        Ok(Self {
            pool,
            url: options.url.clone(),
            key_prefix: options.key_prefix.clone(),
        })
    }

    /// Wrap an existing pool. `url` is only needed for components that open
    /// dedicated connections (pub/sub).
    pub fn from_pool(
        pool: Pool<RedisConnectionManager>,
        url: impl Into<String>,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            url: url.into(),
            key_prefix: key_prefix.into(),
        }
    }

    pub fn pool(&self) -> &Pool<RedisConnectionManager> {
        &self.pool
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// `<prefix><key>`
    pub fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    pub async fn conn(&self) -> Result<PooledConnection<'_, RedisConnectionManager>> {
        Ok(self.pool.get().await?)
    }

    /// Open a dedicated (non-pooled) client, used for pub/sub.
    pub fn client(&self) -> Result<redis::Client> {
        Ok(redis::Client::open(self.url.as_str())?)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &redacted(&self.url))
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
