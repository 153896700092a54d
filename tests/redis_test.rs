//! Tests against a live Redis.
//!
//! Requires REDIS_URL or a local Redis on the default port. Run with:
//! ```sh
//! cargo test --test redis_test -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use streamq::{Lock, LockConfig, Queue, QueueConfig, RedisStore, StreamStore};
use uuid::Uuid;

async fn test_store() -> Arc<RedisStore> {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let store = RedisStore::connect(&SecretString::from(url)).await.unwrap();
    store.ping().await.unwrap();
    Arc::new(store)
}

/// Unique prefix so runs never see each other's streams.
fn unique_prefix() -> String {
    format!("streamq-test-{}", Uuid::new_v4())
}

#[tokio::test]
#[ignore] // Requires running Redis
async fn group_creation_reports_existing_group() {
    let store = test_store().await;
    let stream = format!("{}:groups", unique_prefix());
    store.create_group(&stream, &stream).await.unwrap();
    let err = store.create_group(&stream, &stream).await.unwrap_err();
    assert!(matches!(err, streamq::Error::AlreadyExists(_)));
}

#[tokio::test]
#[ignore] // Requires running Redis
async fn put_get_and_acknowledge() {
    let store = test_store().await;
    let config = QueueConfig {
        prefix: unique_prefix(),
        ..QueueConfig::default()
    };
    let queue = Queue::open(Arc::clone(&store), "jobs", config.clone())
        .await
        .unwrap();
    // Reopening must not fail on the existing group.
    Queue::open(Arc::clone(&store), "jobs", config).await.unwrap();

    queue.put(b"a").await.unwrap();
    queue.put(b"b").await.unwrap();

    let mut worker = queue.consumer();
    let a = queue.get(&mut worker, false, None).await.unwrap().unwrap();
    assert_eq!(a.payload, b"a");
    let b = queue.get(&mut worker, false, None).await.unwrap().unwrap();
    assert_eq!(b.payload, b"b");
    assert!(a.id < b.id);

    queue.task_done(&mut worker).await.unwrap();
    let pending = store
        .pending_range(
            queue.stream_name(),
            queue.stream_name(),
            streamq::MessageId::MIN,
            streamq::MessageId::MAX,
            10,
        )
        .await
        .unwrap();
    assert!(pending.is_empty());
}

#[tokio::test]
#[ignore] // Requires running Redis
async fn blocking_get_times_out_empty() {
    let store = test_store().await;
    let config = QueueConfig {
        prefix: unique_prefix(),
        ..QueueConfig::default()
    };
    let queue = Queue::open(store, "empty", config).await.unwrap();
    let mut worker = queue.consumer();
    let got = queue
        .get(&mut worker, true, Some(Duration::from_millis(300)))
        .await
        .unwrap();
    assert!(got.is_none());
}

#[tokio::test]
#[ignore] // Requires running Redis
async fn blocking_get_outlasts_client_response_timeout() {
    let store = test_store().await;
    let config = QueueConfig {
        prefix: unique_prefix(),
        ..QueueConfig::default()
    };
    let queue = Queue::open(store, "slow", config).await.unwrap();
    let mut worker = queue.consumer();

    let started = std::time::Instant::now();
    let got = queue
        .get(&mut worker, true, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert!(got.is_none());
    assert!(started.elapsed() >= Duration::from_millis(1900));
}

#[tokio::test]
#[ignore] // Requires running Redis
async fn blocking_get_receives_late_put() {
    let store = test_store().await;
    let config = QueueConfig {
        prefix: unique_prefix(),
        ..QueueConfig::default()
    };
    let queue = Queue::open(store, "late", config).await.unwrap();

    let producer = queue.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        producer.put(b"late").await.unwrap();
    });

    // Default stuck_check_interval, so the read is issued with a long BLOCK.
    let mut worker = queue.consumer();
    let msg = queue
        .get(&mut worker, true, Some(Duration::from_secs(5)))
        .await
        .unwrap()
        .expect("message put after one second should arrive");
    assert_eq!(msg.payload, b"late");
    queue.task_done(&mut worker).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis
async fn abandoned_message_is_reclaimed() {
    let store = test_store().await;
    let config = QueueConfig {
        prefix: unique_prefix(),
        stuck_timeout: Duration::from_millis(500),
        stuck_check_interval: Duration::from_millis(100),
        stuck_batch_size: 10,
    };
    let queue = Queue::open(store, "jobs", config).await.unwrap();
    queue.put(b"M").await.unwrap();

    let mut crashed = queue.consumer();
    let delivered = queue.get(&mut crashed, false, None).await.unwrap().unwrap();
    drop(crashed);

    let mut survivor = queue.consumer();
    let reclaimed = queue
        .get(&mut survivor, true, Some(Duration::from_secs(5)))
        .await
        .unwrap()
        .expect("stuck message should be reclaimed");
    assert_eq!(reclaimed.id, delivered.id);
    queue.task_done(&mut survivor).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis
async fn lock_excludes_and_releases_safely() {
    let store = test_store().await;
    let config = LockConfig {
        prefix: unique_prefix(),
        ttl: Duration::from_millis(500),
        retry_wait: Duration::from_millis(50),
    };
    let mut first = Lock::new(Arc::clone(&store), "x", config.clone());
    let mut second = Lock::new(Arc::clone(&store), "x", config);

    assert!(first.acquire(false, None).await.unwrap());
    assert!(!second.acquire(false, None).await.unwrap());
    assert!(
        second
            .acquire(true, Some(Duration::from_secs(2)))
            .await
            .unwrap()
    );

    // First lock expired and was taken over; its release must not delete.
    assert!(!first.release().await.unwrap());
    assert!(second.release().await.unwrap());
}
