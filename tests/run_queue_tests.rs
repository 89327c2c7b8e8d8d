mod common;

use std::sync::Arc;

use fairq::run_queue::{ConcurrencyScope, RunQueueOptions};
use fairq::{EnqueueMessage, QueueError, RateLimitConfig};
use serde_json::json;

fn message(run_id: &str, queue: &str) -> EnqueueMessage {
    EnqueueMessage::new(run_id, "task-a", queue, json!({"run": run_id}))
}

#[tokio::test]
async fn enqueue_dequeue_ack_moves_counters() {
    let Some(store) = common::store().await else { return };
    let rq = common::run_queue(&store, RunQueueOptions::default());
    let env = common::env("env_1", 10);

    rq.enqueue_message(&env, message("run_1", "emails"), None)
        .await
        .unwrap();
    assert_eq!(rq.length_of_queue(&env, "emails", None, None).await.unwrap(), 1);

    let msg = rq
        .dequeue_message_in_shared_queue("c1")
        .await
        .unwrap()
        .expect("a message");
    assert_eq!(msg.run_id, "run_1");
    assert_eq!(msg.environment_id, "env_1");
    assert_eq!(msg.payload, json!({"run": "run_1"}));

    assert_eq!(rq.current_concurrency_of_queue(&env, "emails", None).await.unwrap(), 1);
    assert_eq!(rq.current_concurrency_of_env(&env).await.unwrap(), 1);
    assert_eq!(rq.current_concurrency_of_project(&env).await.unwrap(), 1);
    assert_eq!(rq.current_concurrency_of_task(&env, "task-a").await.unwrap(), 1);
    assert_eq!(rq.length_of_queue(&env, "emails", None, None).await.unwrap(), 0);

    assert!(rq.acknowledge_message("org_1", "run_1").await.unwrap());
    assert!(!rq.acknowledge_message("org_1", "run_1").await.unwrap());
    assert_eq!(rq.current_concurrency_of_queue(&env, "emails", None).await.unwrap(), 0);
    assert_eq!(rq.current_concurrency_of_env(&env).await.unwrap(), 0);
    assert!(rq.read_message("org_1", "run_1").await.unwrap().is_none());
    assert!(rq.dequeue_message_in_shared_queue("c1").await.unwrap().is_none());
}

#[tokio::test]
async fn queue_limit_blocks_until_ack() {
    let Some(store) = common::store().await else { return };
    let rq = common::run_queue(&store, RunQueueOptions::default());
    let env = common::env("env_1", 10);
    rq.update_queue_concurrency_limit(&env, "q", 1).await.unwrap();

    rq.enqueue_message(&env, message("r1", "q"), None).await.unwrap();
    rq.enqueue_message(&env, message("r2", "q"), None).await.unwrap();

    let first = rq.dequeue_message_in_shared_queue("c1").await.unwrap().unwrap();
    assert!(rq.dequeue_message_in_shared_queue("c2").await.unwrap().is_none());
    assert_eq!(rq.length_of_queue(&env, "q", None, None).await.unwrap(), 1);

    rq.acknowledge_message("org_1", &first.run_id).await.unwrap();
    let second = rq.dequeue_message_in_shared_queue("c2").await.unwrap().unwrap();
    assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn env_limit_applies_across_queues() {
    let Some(store) = common::store().await else { return };
    let rq = common::run_queue(&store, RunQueueOptions::default());
    let env = common::env("env_1", 1);
    rq.enqueue_message(&env, message("r1", "a"), None).await.unwrap();
    rq.enqueue_message(&env, message("r2", "b"), None).await.unwrap();

    assert!(rq.dequeue_message_in_shared_queue("c").await.unwrap().is_some());
    assert!(rq.dequeue_message_in_shared_queue("c").await.unwrap().is_none());
    assert_eq!(rq.current_concurrency_of_env(&env).await.unwrap(), 1);
}

#[tokio::test]
async fn nack_requeues_with_next_attempt() {
    let Some(store) = common::store().await else { return };
    let rq = common::run_queue(&store, RunQueueOptions::default());
    let env = common::env("env_1", 10);
    rq.enqueue_message(&env, message("r1", "q"), None).await.unwrap();

    let msg = rq.dequeue_message_in_shared_queue("c").await.unwrap().unwrap();
    assert_eq!(msg.attempt, 0);
    assert!(rq.nack_message("org_1", "r1", None).await.unwrap());
    assert_eq!(rq.current_concurrency_of_env(&env).await.unwrap(), 0);

    let again = rq.dequeue_message_in_shared_queue("c").await.unwrap().unwrap();
    assert_eq!(again.run_id, "r1");
    assert_eq!(again.attempt, 1);
}

#[tokio::test]
async fn release_frees_capacity_once() {
    let Some(store) = common::store().await else { return };
    let rq = common::run_queue(&store, RunQueueOptions::default());
    let env = common::env("env_1", 10);
    rq.enqueue_message(&env, message("r1", "q"), None).await.unwrap();
    rq.dequeue_message_in_shared_queue("c").await.unwrap().unwrap();

    assert!(rq.release_concurrency("org_1", "r1").await.unwrap());
    assert!(!rq.release_concurrency("org_1", "r1").await.unwrap());
    assert_eq!(rq.current_concurrency_of_env(&env).await.unwrap(), 0);

    // ack after release must not push counters below zero
    rq.acknowledge_message("org_1", "r1").await.unwrap();
    assert_eq!(rq.current_concurrency_of_env(&env).await.unwrap(), 0);
}

#[tokio::test]
async fn disabled_org_dequeues_nothing() {
    let Some(store) = common::store().await else { return };
    let rq = common::run_queue(&store, RunQueueOptions::default());
    let env = common::env("env_1", 10);
    rq.enqueue_message(&env, message("r1", "q"), None).await.unwrap();

    rq.disable_org_concurrency("org_1").await.unwrap();
    assert!(rq.dequeue_message_in_shared_queue("c").await.unwrap().is_none());
    rq.enable_org_concurrency("org_1").await.unwrap();
    assert!(rq.dequeue_message_in_shared_queue("c").await.unwrap().is_some());
}

#[tokio::test]
async fn rate_limit_caps_dequeues_without_touching_counters() {
    let Some(store) = common::store().await else { return };
    let rq = common::run_queue(&store, RunQueueOptions::default());
    let env = common::env("env_1", 100);
    rq.set_queue_rate_limit(&env, "limited", RateLimitConfig::new(2, 60_000, 2).unwrap())
        .await
        .unwrap();
    for i in 0..5 {
        rq.enqueue_message(&env, message(&format!("r{}", i), "limited"), None)
            .await
            .unwrap();
    }

    let mut dequeued = 0;
    for _ in 0..10 {
        if let Some(msg) = rq.dequeue_message_in_shared_queue("c").await.unwrap() {
            dequeued += 1;
            rq.acknowledge_message("org_1", &msg.run_id).await.unwrap();
        }
    }
    assert_eq!(dequeued, 2);
    assert_eq!(rq.length_of_queue(&env, "limited", None, None).await.unwrap(), 3);
    assert_eq!(rq.current_concurrency_of_env(&env).await.unwrap(), 0);
    assert_eq!(
        rq.get_queue_rate_limit(&env, "limited").await.unwrap(),
        Some(RateLimitConfig::new(2, 60_000, 2).unwrap())
    );
}

#[tokio::test]
async fn rate_limit_keys_are_isolated() {
    let Some(store) = common::store().await else { return };
    let rq = common::run_queue(&store, RunQueueOptions::default());
    let env = common::env("env_1", 100);
    rq.set_queue_rate_limit(&env, "shared", RateLimitConfig::new(1, 60_000, 1).unwrap())
        .await
        .unwrap();
    for (run, key) in [("a1", "tenant-a"), ("a2", "tenant-a"), ("b1", "tenant-b"), ("b2", "tenant-b")] {
        rq.enqueue_message(&env, message(run, "shared").with_rate_limit_key(key), None)
            .await
            .unwrap();
    }

    let mut keys = Vec::new();
    for _ in 0..8 {
        if let Some(msg) = rq.dequeue_message_in_shared_queue("c").await.unwrap() {
            keys.push(msg.rate_limit_key.clone().unwrap_or_default());
            rq.acknowledge_message("org_1", &msg.run_id).await.unwrap();
        }
    }
    keys.sort();
    assert_eq!(keys, vec!["tenant-a", "tenant-b"]);
}

#[tokio::test]
async fn disabled_rate_limits_are_ignored() {
    let Some(store) = common::store().await else { return };
    let rq = common::run_queue(
        &store,
        RunQueueOptions::default().with_rate_limits_enabled(false),
    );
    let env = common::env("env_1", 100);
    rq.set_queue_rate_limit(&env, "q", RateLimitConfig::new(1, 60_000, 1).unwrap())
        .await
        .unwrap();
    for i in 0..3 {
        rq.enqueue_message(&env, message(&format!("r{}", i), "q"), None)
            .await
            .unwrap();
    }
    let mut n = 0;
    while rq.dequeue_message_in_shared_queue("c").await.unwrap().is_some() {
        n += 1;
    }
    assert_eq!(n, 3);
}

#[tokio::test]
async fn worker_queues_are_separate_parents() {
    let Some(store) = common::store().await else { return };
    let rq = common::run_queue(&store, RunQueueOptions::default());
    let env = common::env("env_1", 10);
    rq.enqueue_message(&env, message("r1", "q"), Some("wq-1"))
        .await
        .unwrap();

    assert!(rq.dequeue_message_in_shared_queue("c").await.unwrap().is_none());
    assert!(rq
        .dequeue_message_from_worker_queue("c", "wq-2")
        .await
        .unwrap()
        .is_none());
    let msg = rq
        .dequeue_message_from_worker_queue("c", "wq-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.run_id, "r1");
}

#[tokio::test]
async fn batch_enqueue_reports_per_item() {
    let Some(store) = common::store().await else { return };
    let rq = common::run_queue(&store, RunQueueOptions::default());
    let env = common::env("env_1", 10);
    let results = rq
        .batch_enqueue(
            &env,
            vec![message("ok", "q"), message("", "q"), message("ok2", "q")],
            None,
        )
        .await;
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
    assert!(results[2].is_ok());
    assert_eq!(rq.length_of_queue(&env, "q", None, None).await.unwrap(), 2);
}

#[tokio::test]
async fn concurrent_reservations_never_exceed_limit() {
    let Some(store) = common::store().await else { return };
    let rq = Arc::new(common::run_queue(&store, RunQueueOptions::default()));
    let scope = ConcurrencyScope::fixed(store.key("capacity:current"), 3);

    let mut handles = Vec::new();
    for _ in 0..20 {
        let rq = rq.clone();
        let scope = scope.clone();
        handles.push(tokio::spawn(async move {
            rq.limiter().try_reserve(&[scope]).await.unwrap()
        }));
    }
    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 3);
    assert_eq!(rq.limiter().current(&scope).await.unwrap(), 3);

    for _ in 0..5 {
        rq.limiter().release(&[scope.clone()]).await.unwrap();
    }
    assert_eq!(rq.limiter().current(&scope).await.unwrap(), 0);
}

#[tokio::test]
async fn reservation_is_all_or_nothing() {
    let Some(store) = common::store().await else { return };
    let rq = common::run_queue(&store, RunQueueOptions::default());
    let limiter = rq.limiter();
    let roomy = ConcurrencyScope::fixed(store.key("roomy"), 10);
    let tight = ConcurrencyScope::fixed(store.key("tight"), 1);
    let flag = ConcurrencyScope::disabled_flag(store.key("flag"));

    assert!(limiter.try_reserve(&[roomy.clone(), tight.clone()]).await.unwrap());
    assert!(!limiter.try_reserve(&[roomy.clone(), tight.clone()]).await.unwrap());
    assert_eq!(limiter.current(&roomy).await.unwrap(), 1);

    let mut conn = store.conn().await.unwrap();
    let _: () = redis::AsyncCommands::set(&mut *conn, store.key("flag"), 1).await.unwrap();
    drop(conn);
    assert!(!limiter.try_reserve(&[roomy.clone(), flag]).await.unwrap());
    assert_eq!(limiter.current(&roomy).await.unwrap(), 1);
}

#[tokio::test]
async fn scripts_load() {
    let Some(store) = common::store().await else { return };
    let mut conn = store.conn().await.unwrap();
    let mut sources: Vec<String> = fairq::RunQueue::script_sources();
    sources.extend(fairq::SimpleQueue::script_sources().iter().map(|s| s.to_string()));
    sources.push(fairq::batch::BatchCompletionTracker::script_source().to_string());
    sources.extend(
        fairq::batch::RedisDrrBackend::script_sources()
            .iter()
            .map(|s| s.to_string()),
    );
    for source in sources {
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(&source)
            .query_async(&mut *conn)
            .await
            .unwrap();
        assert_eq!(sha.len(), 40);
    }
}

#[tokio::test]
async fn reenqueue_moves_a_queued_run() {
    let Some(store) = common::store().await else { return };
    let rq = common::run_queue(&store, RunQueueOptions::default());
    let env = common::env("env_1", 10);

    rq.enqueue_message(&env, message("r1", "q"), None).await.unwrap();
    rq.enqueue_message(&env, message("r1", "q").with_priority(2), None)
        .await
        .unwrap();
    assert_eq!(rq.length_of_queue(&env, "q", None, None).await.unwrap(), 0);
    assert_eq!(rq.length_of_queue(&env, "q", None, Some(2)).await.unwrap(), 1);

    rq.enqueue_message(&env, message("r2", "a"), None).await.unwrap();
    rq.enqueue_message(&env, message("r2", "b").with_concurrency_key("t1"), None)
        .await
        .unwrap();
    assert_eq!(rq.length_of_queue(&env, "a", None, None).await.unwrap(), 0);
    assert_eq!(rq.length_of_queue(&env, "b", Some("t1"), None).await.unwrap(), 1);

    let mut delivered = Vec::new();
    while let Some(msg) = rq.dequeue_message_in_shared_queue("c").await.unwrap() {
        delivered.push(msg);
    }
    let mut ids: Vec<&str> = delivered.iter().map(|m| m.run_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["r1", "r2"]);
    assert_eq!(rq.current_concurrency_of_env(&env).await.unwrap(), 2);

    for msg in &delivered {
        assert!(rq.acknowledge_message("org_1", &msg.run_id).await.unwrap());
    }
    assert_eq!(rq.current_concurrency_of_env(&env).await.unwrap(), 0);
    assert_eq!(rq.current_concurrency_of_queue(&env, "q", None).await.unwrap(), 0);
    assert_eq!(rq.current_concurrency_of_queue(&env, "b", Some("t1")).await.unwrap(), 0);
    assert_eq!(rq.current_concurrency_of_task(&env, "task-a").await.unwrap(), 0);
}

#[tokio::test]
async fn reenqueue_of_inflight_run_keeps_its_scope() {
    let Some(store) = common::store().await else { return };
    let rq = common::run_queue(&store, RunQueueOptions::default());
    let env = common::env("env_1", 10);
    rq.enqueue_message(&env, message("r1", "a"), None).await.unwrap();
    rq.dequeue_message_in_shared_queue("c").await.unwrap().unwrap();

    let moved = EnqueueMessage::new("r1", "task-b", "b", json!({"v": 2}));
    rq.enqueue_message(&env, moved, None).await.unwrap();
    assert_eq!(rq.length_of_queue(&env, "b", None, None).await.unwrap(), 0);
    assert!(rq.dequeue_message_in_shared_queue("c").await.unwrap().is_none());

    let stored = rq.read_message("org_1", "r1").await.unwrap().unwrap();
    assert_eq!(stored.queue, rq.keys().queue_key(&env, "a", None));
    assert_eq!(stored.task_identifier, "task-a");
    assert_eq!(stored.payload, json!({"v": 2}));

    // a stale entry left in another queue is dropped, not delivered again
    let stale = rq.keys().queue_key(&env, "c", None);
    let mut conn = store.conn().await.unwrap();
    let _: () = redis::AsyncCommands::zadd(&mut *conn, &stale, "r1", 0).await.unwrap();
    let _: () = redis::AsyncCommands::zadd(&mut *conn, rq.keys().shared_queue_key(), &stale, 0)
        .await
        .unwrap();
    drop(conn);
    assert!(rq.dequeue_message_in_shared_queue("c").await.unwrap().is_none());
    assert_eq!(rq.length_of_queue(&env, "c", None, None).await.unwrap(), 0);
    assert_eq!(rq.current_concurrency_of_env(&env).await.unwrap(), 1);

    assert!(rq.acknowledge_message("org_1", "r1").await.unwrap());
    assert_eq!(rq.current_concurrency_of_env(&env).await.unwrap(), 0);
    assert_eq!(rq.current_concurrency_of_queue(&env, "a", None).await.unwrap(), 0);
    assert_eq!(rq.current_concurrency_of_task(&env, "task-a").await.unwrap(), 0);
}

#[tokio::test]
async fn names_that_break_the_key_grammar_are_rejected() {
    let Some(store) = common::store().await else { return };
    let rq = common::run_queue(&store, RunQueueOptions::default());
    let env = common::env("env_1", 10);

    let bad = [
        message("r1", "jobs:priority:3"),
        message("r2", "q").with_concurrency_key("tenant:priority:7"),
        message("r3", "jobs:ck:x"),
    ];
    for msg in bad {
        assert!(matches!(
            rq.enqueue_message(&env, msg, None).await,
            Err(QueueError::InvalidKey(_))
        ));
    }
    let colon_project = fairq::RuntimeEnvironment::new("org_1", "p:1", "env_1", 10);
    assert!(matches!(
        rq.enqueue_message(&colon_project, message("r4", "q"), None).await,
        Err(QueueError::InvalidKey(_))
    ));
    assert!(rq
        .set_queue_rate_limit(&env, "q:priority:1", RateLimitConfig::new(1, 1000, 1).unwrap())
        .await
        .is_err());
    assert!(rq.dequeue_message_in_shared_queue("c").await.unwrap().is_none());
}
