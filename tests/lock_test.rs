//! Integration tests for the distributed lock against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use streamq::store::memory::StoreCall;
use streamq::{Lock, LockConfig, MemoryStore};
use tokio::time::Instant;

fn config(ttl: Duration) -> LockConfig {
    LockConfig {
        prefix: "lock".to_string(),
        ttl,
        retry_wait: Duration::from_millis(100),
    }
}

fn lock(store: &Arc<MemoryStore>, ttl: Duration) -> Lock<MemoryStore> {
    Lock::new(Arc::clone(store), "x", config(ttl))
}

#[tokio::test]
async fn second_holder_cannot_acquire_while_held() {
    let store = Arc::new(MemoryStore::new());
    let mut first = lock(&store, Duration::from_secs(60));
    let mut second = lock(&store, Duration::from_secs(60));

    assert_eq!(first.key(), "lock:x");
    assert!(first.acquire(false, None).await.unwrap());
    assert!(!second.acquire(false, None).await.unwrap());
    assert_eq!(store.value("lock:x").as_deref(), first.token());
}

#[tokio::test]
async fn concurrent_nonblocking_acquires_admit_exactly_one() {
    let store = Arc::new(MemoryStore::new());
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let mut l = lock(&store, Duration::from_secs(60));
            tokio::spawn(async move { l.acquire(false, None).await.unwrap() })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test(start_paused = true)]
async fn blocked_holder_gets_lock_once_ttl_expires() {
    let store = Arc::new(MemoryStore::new());
    let mut first = lock(&store, Duration::from_secs(2));
    let mut second = lock(&store, Duration::from_secs(2));

    assert!(first.acquire(false, None).await.unwrap());
    assert!(!second.acquire(false, None).await.unwrap());

    let started = Instant::now();
    assert!(
        second
            .acquire(true, Some(Duration::from_secs(5)))
            .await
            .unwrap()
    );
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(store.value("lock:x").as_deref(), second.token());
}

#[tokio::test(start_paused = true)]
async fn blocking_acquire_gives_up_after_timeout() {
    let store = Arc::new(MemoryStore::new());
    let mut holder = lock(&store, Duration::from_secs(60));
    let mut waiter = lock(&store, Duration::from_secs(60));
    assert!(holder.acquire(false, None).await.unwrap());

    let started = Instant::now();
    let acquired = waiter
        .acquire(true, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert!(!acquired);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn every_attempt_uses_a_fresh_token() {
    let store = Arc::new(MemoryStore::new());
    let mut holder = lock(&store, Duration::from_secs(60));
    let mut other = lock(&store, Duration::from_secs(60));
    assert!(holder.acquire(false, None).await.unwrap());

    other.acquire(false, None).await.unwrap();
    let t1 = other.token().map(str::to_string);
    other.acquire(false, None).await.unwrap();
    let t2 = other.token().map(str::to_string);
    assert!(t1.is_some() && t2.is_some());
    assert_ne!(t1, t2);
}

#[tokio::test]
async fn release_frees_the_key_for_others() {
    let store = Arc::new(MemoryStore::new());
    let mut first = lock(&store, Duration::from_secs(60));
    let mut second = lock(&store, Duration::from_secs(60));

    assert!(first.acquire(false, None).await.unwrap());
    assert!(first.release().await.unwrap());
    assert!(first.token().is_none());
    assert!(second.acquire(false, None).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn stale_release_does_not_delete_new_owners_key() {
    let store = Arc::new(MemoryStore::new());
    let mut first = lock(&store, Duration::from_secs(1));
    let mut second = lock(&store, Duration::from_secs(60));

    assert!(first.acquire(false, None).await.unwrap());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(second.acquire(false, None).await.unwrap());

    assert!(!first.release().await.unwrap());
    assert_eq!(store.value("lock:x").as_deref(), second.token());
}

#[tokio::test]
async fn release_without_acquire_is_a_silent_noop() {
    let store = Arc::new(MemoryStore::new());
    let mut never = lock(&store, Duration::from_secs(60));
    assert!(!never.release().await.unwrap());
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn store_errors_propagate_from_acquire() {
    let store = Arc::new(MemoryStore::new());
    store.set_unavailable(true);
    let mut l = lock(&store, Duration::from_secs(60));
    assert!(l.acquire(true, Some(Duration::from_secs(1))).await.is_err());
    assert_eq!(store.calls(), vec![StoreCall::SetIfAbsent]);
}

// ---------------------------------------------------------------------------
// Scoped acquisition
// ---------------------------------------------------------------------------

#[tokio::test]
async fn guard_release_frees_the_key() {
    let store = Arc::new(MemoryStore::new());
    let mut l = lock(&store, Duration::from_secs(60));

    let guard = l.lock(false, None).await.unwrap().expect("lock is free");
    assert_eq!(guard.key(), "lock:x");
    assert!(store.value("lock:x").is_some());
    assert!(guard.release().await.unwrap());
    assert!(store.value("lock:x").is_none());
}

#[tokio::test]
async fn dropped_guard_releases_in_the_background() {
    let store = Arc::new(MemoryStore::new());
    let mut l = lock(&store, Duration::from_secs(60));

    {
        let _guard = l.lock(false, None).await.unwrap().expect("lock is free");
    }
    assert!(l.token().is_none());

    for _ in 0..10 {
        if store.value("lock:x").is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(store.value("lock:x").is_none());
    assert!(store.calls().contains(&StoreCall::CompareAndDelete));
}

#[tokio::test]
async fn with_lock_runs_the_future_and_releases() {
    let store = Arc::new(MemoryStore::new());
    let mut l = lock(&store, Duration::from_secs(60));

    let out = l
        .with_lock(false, None, async { 6 * 7 })
        .await
        .unwrap();
    assert_eq!(out, Some(42));
    assert!(store.value("lock:x").is_none());
}

#[tokio::test]
async fn with_lock_skips_the_future_when_contended() {
    let store = Arc::new(MemoryStore::new());
    let mut holder = lock(&store, Duration::from_secs(60));
    assert!(holder.acquire(false, None).await.unwrap());

    let mut l = lock(&store, Duration::from_secs(60));
    let mut ran = false;
    let out = l
        .with_lock(false, None, async {
            ran = true;
        })
        .await
        .unwrap();
    assert!(out.is_none());
    assert!(!ran);
}
