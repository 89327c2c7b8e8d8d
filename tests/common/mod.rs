#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fairq::{
    KeyProducer, NoopStrategy, RedisOptions, RedisStore, RunQueue, RunQueueOptions,
    RuntimeEnvironment,
};
use uuid::Uuid;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// A store with a fresh key prefix, or `None` when no Redis is reachable.
/// Every test gets its own prefix, so tests can run in parallel against
/// one server.
pub async fn store() -> Option<RedisStore> {
    init_tracing();
    let url = redis_url();
    let reachable = async {
        let client = redis::Client::open(url.as_str()).ok()?;
        let mut conn = client.get_multiplexed_async_connection().await.ok()?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await.ok()?;
        Some(pong)
    };
    if !matches!(
        tokio::time::timeout(Duration::from_secs(2), reachable).await,
        Ok(Some(_))
    ) {
        eprintln!("skipping: no redis at {}", url);
        return None;
    }

    let mut options = RedisOptions::new(url)
        .with_key_prefix(format!("fairq-test:{}:", Uuid::new_v4()))
        .with_max_size(16);
    options.min_idle = 1;
    options.connection_timeout_ms = 5_000;
    Some(RedisStore::connect(&options).await.expect("connect to redis"))
}

pub fn env(id: &str, limit: u32) -> RuntimeEnvironment {
    RuntimeEnvironment::new("org_1", "proj_1", id, limit)
}

pub fn run_queue(store: &RedisStore, options: RunQueueOptions) -> RunQueue {
    let keys = KeyProducer::new(store.key_prefix(), options.key_style);
    let strategy = Arc::new(NoopStrategy::new(store.clone(), keys, 100));
    RunQueue::new(store.clone(), options, strategy).expect("run queue")
}
