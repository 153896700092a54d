//! # streamq
//!
//! Reliable work queue and distributed lock on top of an append-only log
//! store with consumer groups (Redis Streams).
//!
//! Provides at-least-once task delivery with stuck-message reclamation
//! ([`queue`]), token-guarded mutual exclusion ([`lock`]), a store
//! abstraction with Redis and in-memory backends ([`store`]), and
//! OpenTelemetry observability ([`telemetry`]).

pub mod config;
pub mod error;
pub mod lock;
pub mod model;
pub mod queue;
pub mod store;
pub mod telemetry;

pub use error::{Error, Result};
pub use lock::{Lock, LockConfig, LockGuard};
pub use model::{Message, MessageId, PendingEntry, StreamEntry};
pub use queue::{Consumer, Queue, QueueConfig};
pub use store::{MemoryStore, RedisStore, StreamStore};
