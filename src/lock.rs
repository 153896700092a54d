//! Distributed mutual exclusion over a single store key.
//!
//! A holder proves ownership with a random token. Acquisition is an atomic
//! set-if-absent with a TTL, so a crashed holder's lock expires on its own.
//! Release is an atomic compare-and-delete, so a holder whose lock already
//! expired (and was taken by someone else) cannot delete the new owner's key.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::time::Instant;
use tracing::{Instrument, debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::store::StreamStore;
use crate::telemetry::metrics;
use crate::telemetry::queue::start_acquire_span;

/// Lock tunables.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lock keys are `"{prefix}:{name}"`.
    pub prefix: String,
    /// How long the lock lives in the store if never released.
    pub ttl: Duration,
    /// Pause between attempts while blocking in [`Lock::acquire`].
    pub retry_wait: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            prefix: "lock".to_string(),
            ttl: Duration::from_secs(60),
            retry_wait: Duration::from_millis(100),
        }
    }
}

/// One holder's handle on a named lock.
///
/// Each worker creates its own `Lock`; the token it generates is what
/// distinguishes it from every other holder of the same name.
pub struct Lock<S> {
    store: Arc<S>,
    name: String,
    key: String,
    config: LockConfig,
    token: Option<String>,
}

impl<S: StreamStore + 'static> Lock<S> {
    pub fn new(store: Arc<S>, name: impl Into<String>, config: LockConfig) -> Self {
        let name = name.into();
        let key = format!("{}:{}", config.prefix, name);
        Self {
            store,
            name,
            key,
            config,
            token: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The last token generated by [`acquire`](Lock::acquire), if not yet
    /// released.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Try to take the lock.
    ///
    /// Every attempt uses a fresh token. With `block = false` a single
    /// attempt is made. With `block = true`, attempts repeat every
    /// `retry_wait` until `timeout` runs out (forever when `None`). Not
    /// getting the lock is `Ok(false)`, not an error.
    pub async fn acquire(&mut self, block: bool, timeout: Option<Duration>) -> Result<bool> {
        let span = start_acquire_span(&self.key);
        let acquired = self
            .try_acquire(block, timeout)
            .instrument(span.clone())
            .await?;
        span.record("lock.acquired", acquired);
        Ok(acquired)
    }

    async fn try_acquire(&mut self, block: bool, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let token = Uuid::new_v4().to_string();
            let acquired = self
                .store
                .set_if_absent(&self.key, &token, self.config.ttl)
                .await?;
            self.token = Some(token);

            if acquired {
                self.count("acquired");
                debug!(key = %self.key, "lock acquired");
                return Ok(true);
            }
            if !block {
                self.count("contended");
                return Ok(false);
            }

            let pause = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        self.count("timed_out");
                        debug!(key = %self.key, "lock acquisition timed out");
                        return Ok(false);
                    }
                    self.config.retry_wait.min(left)
                }
                None => self.config.retry_wait,
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// Release the lock if this holder still owns it.
    ///
    /// Returns `Ok(false)` without touching the key when the stored token is
    /// someone else's (ours expired) or when nothing was acquired.
    pub async fn release(&mut self) -> Result<bool> {
        let Some(token) = self.token.as_deref() else {
            return Ok(false);
        };
        let released = self.store.compare_and_delete(&self.key, token).await?;
        self.token = None;

        if released {
            self.count("released");
            debug!(key = %self.key, "lock released");
        } else {
            self.count("release_noop");
            debug!(key = %self.key, "lock no longer ours, release skipped");
        }
        Ok(released)
    }

    /// Acquire and wrap the lock in a guard that releases it on drop.
    ///
    /// `Ok(None)` when the lock was not obtained.
    pub async fn lock(
        &mut self,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<LockGuard<'_, S>>> {
        if self.acquire(block, timeout).await? {
            Ok(Some(LockGuard { lock: self }))
        } else {
            Ok(None)
        }
    }

    /// Run `fut` while holding the lock, then release it.
    ///
    /// `Ok(None)` when the lock was not obtained and `fut` never ran.
    pub async fn with_lock<F>(
        &mut self,
        block: bool,
        timeout: Option<Duration>,
        fut: F,
    ) -> Result<Option<F::Output>>
    where
        F: Future,
    {
        let Some(guard) = self.lock(block, timeout).await? else {
            return Ok(None);
        };
        let output = fut.await;
        guard.release().await?;
        Ok(Some(output))
    }

    fn count(&self, operation: &'static str) {
        metrics::lock_operations().add(
            1,
            &[
                KeyValue::new("lock", self.name.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

/// Scoped ownership of a [`Lock`].
///
/// Prefer [`LockGuard::release`]. A guard dropped while still holding the
/// lock (early return, panic) hands the release to the current tokio
/// runtime; without a runtime the lock is left to expire.
pub struct LockGuard<'a, S: StreamStore + 'static> {
    lock: &'a mut Lock<S>,
}

impl<S: StreamStore + 'static> LockGuard<'_, S> {
    pub fn key(&self) -> &str {
        self.lock.key()
    }

    pub fn token(&self) -> Option<&str> {
        self.lock.token()
    }

    /// Release now and report whether the key was still ours.
    pub async fn release(self) -> Result<bool> {
        self.lock.release().await
    }
}

impl<S: StreamStore + 'static> Drop for LockGuard<'_, S> {
    fn drop(&mut self) {
        let Some(token) = self.lock.token.take() else {
            return;
        };
        let key = self.lock.key.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = Arc::clone(&self.lock.store);
                handle.spawn(async move {
                    if let Err(e) = store.compare_and_delete(&key, &token).await {
                        warn!(key = %key, "deferred lock release failed: {e}");
                    }
                });
            }
            Err(_) => warn!(key = %key, "no runtime to release lock, leaving it to expire"),
        }
    }
}
