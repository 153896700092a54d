//! Stream store abstraction.
//!
//! The queue and the lock only ever talk to the backing log store through
//! [`StreamStore`]. Every method is a single round trip and must be atomic on
//! the store side; callers never hold store state locally.
//!
//! [`redis::RedisStore`] is the production adapter. [`memory::MemoryStore`]
//! is an in-process fake with the same semantics, used by tests.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{MessageId, PendingEntry, StreamEntry};

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Entry field the payload is stored under.
pub const PAYLOAD_FIELD: &str = "data";

#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Create a consumer group starting at the beginning of the stream,
    /// creating the stream if needed.
    ///
    /// Fails with [`Error::AlreadyExists`](crate::error::Error::AlreadyExists)
    /// when the group is already there.
    async fn create_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Append a payload. Returns the id assigned by the store.
    async fn append(&self, stream: &str, payload: &[u8]) -> Result<MessageId>;

    /// Read up to `count` never-delivered entries for `consumer`.
    ///
    /// `block = None` returns immediately; `Some(d)` waits up to `d` for new
    /// data. Exactly one stream must be given, anything else is
    /// [`Error::MultiStreamUnsupported`](crate::error::Error::MultiStreamUnsupported).
    async fn read_group(
        &self,
        streams: &[&str],
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge an entry, removing it from the PEL.
    async fn ack(&self, stream: &str, group: &str, id: MessageId) -> Result<()>;

    /// PEL rows with `start <= id <= end`, in id order, at most `count`.
    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        start: MessageId,
        end: MessageId,
        count: usize,
    ) -> Result<Vec<PendingEntry>>;

    /// Reassign pending entries idle for at least `min_idle` to `consumer`.
    ///
    /// Entries that are not idle long enough (someone else just claimed them)
    /// are left alone. The delivery counter carries over and the claim counts
    /// as one more delivery.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[MessageId],
    ) -> Result<Vec<StreamEntry>>;

    /// Set `key` to `value` with an expiry, only if it is absent.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Atomically delete `key` if its value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;
}
