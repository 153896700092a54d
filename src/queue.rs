//! Work queue over one stream and one consumer group.
//!
//! Producers [`put`](Queue::put) opaque payloads; competing consumers
//! [`get`](Queue::get) them with at-least-once semantics. Each worker carries
//! its own [`Consumer`] session, which holds at most one delivered but
//! unacknowledged message. Fetching the next message acknowledges the
//! previous one first.
//!
//! Crash recovery happens inside the read path: every `stuck_check_interval`
//! a consumer scans the pending entries list and claims one entry that has
//! been idle for at least `stuck_timeout`. There is no heartbeat and no
//! background reclaimer.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{Instrument, debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Message, MessageId, StreamEntry};
use crate::store::StreamStore;
use crate::telemetry::metrics;
use crate::telemetry::queue::{record_state_transition, start_get_span};

/// Queue tunables.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Stream names are `"{prefix}:{name}"`.
    pub prefix: String,
    /// Minimum idle time before a pending entry counts as abandoned.
    pub stuck_timeout: Duration,
    /// How often a consumer scans for abandoned entries.
    pub stuck_check_interval: Duration,
    /// PEL page size used by the scan.
    pub stuck_batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prefix: "queue".to_string(),
            stuck_timeout: Duration::from_secs(60),
            stuck_check_interval: Duration::from_secs(10),
            stuck_batch_size: 100,
        }
    }
}

/// Per-worker session state.
///
/// One per logical worker; not shared. The name identifies the worker to the
/// store's consumer group and stays fixed for the session's lifetime.
#[derive(Debug)]
pub struct Consumer {
    name: String,
    current: Option<MessageId>,
    last_stuck_check: Option<Instant>,
}

impl Consumer {
    /// A consumer with a fresh random identity.
    pub fn new() -> Self {
        Self::with_name(Uuid::new_v4().to_string())
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current: None,
            last_stuck_check: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the delivered-but-unacknowledged message, if any.
    pub fn current(&self) -> Option<MessageId> {
        self.current
    }

    fn stuck_check_due(&self, now: Instant, interval: Duration) -> bool {
        self.last_stuck_check
            .is_none_or(|last| now.saturating_duration_since(last) >= interval)
    }
}

impl Default for Consumer {
    fn default() -> Self {
        Self::new()
    }
}

/// A named work queue.
pub struct Queue<S> {
    store: Arc<S>,
    name: String,
    stream: String,
    group: String,
    config: QueueConfig,
}

impl<S> Clone for Queue<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            name: self.name.clone(),
            stream: self.stream.clone(),
            group: self.group.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: StreamStore> Queue<S> {
    /// Open the queue, creating its stream and consumer group if needed.
    pub async fn open(store: Arc<S>, name: impl Into<String>, config: QueueConfig) -> Result<Self> {
        let name = name.into();
        let stream = format!("{}:{}", config.prefix, name);
        let group = stream.clone();

        match store.create_group(&stream, &group).await {
            Ok(()) => info!(stream = %stream, "consumer group created"),
            Err(Error::AlreadyExists(_)) => debug!(stream = %stream, "consumer group exists"),
            Err(e) => return Err(e),
        }

        Ok(Self {
            store,
            name,
            stream,
            group,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream_name(&self) -> &str {
        &self.stream
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// A new consumer session for this queue.
    pub fn consumer(&self) -> Consumer {
        Consumer::new()
    }

    /// Append a payload. Never waits on consumers.
    pub async fn put(&self, data: &[u8]) -> Result<MessageId> {
        let id = self.store.append(&self.stream, data).await?;
        self.count("put");
        debug!(stream = %self.stream, id = %id, "put");
        Ok(id)
    }

    /// Serialize `value` as JSON and [`put`](Queue::put) it.
    pub async fn put_json<T: Serialize>(&self, value: &T) -> Result<MessageId> {
        let data = serde_json::to_vec(value)?;
        self.put(&data).await
    }

    /// Fetch the next message for `consumer`.
    ///
    /// Any message the consumer still holds is acknowledged first. When the
    /// scan interval has elapsed, one abandoned entry may be reclaimed
    /// instead of reading a new one.
    ///
    /// With `block = false` this never waits. With `block = true` it waits up
    /// to `timeout` (forever when `None`), waking at least once per
    /// `stuck_check_interval` to rescan. `Ok(None)` means nothing arrived.
    pub async fn get(
        &self,
        consumer: &mut Consumer,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>> {
        let span = start_get_span(&self.stream, &consumer.name);
        self.next_message(consumer, block, timeout)
            .instrument(span)
            .await
    }

    async fn next_message(
        &self,
        consumer: &mut Consumer,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>> {
        self.task_done(consumer).await?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let now = Instant::now();
            if consumer.stuck_check_due(now, self.config.stuck_check_interval) {
                consumer.last_stuck_check = Some(now);
                if let Some(message) = self.reclaim(consumer, self.config.stuck_batch_size).await? {
                    return Ok(Some(message));
                }
            }

            let wait = block.then(|| self.next_wait(consumer, deadline));
            let entries = self
                .store
                .read_group(&[self.stream.as_str()], &self.group, &consumer.name, 1, wait)
                .await?;
            if let Some(entry) = entries.into_iter().next() {
                return Ok(Some(self.deliver(consumer, entry)));
            }

            if !block || deadline.is_some_and(|d| Instant::now() >= d) {
                self.count("get_empty");
                return Ok(None);
            }
        }
    }

    /// [`get`](Queue::get) and decode the payload as JSON.
    ///
    /// A payload that fails to decode is still held by the consumer and is
    /// acknowledged by the next `get` or `task_done`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        consumer: &mut Consumer,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<T>> {
        match self.get(consumer, block, timeout).await? {
            Some(message) => Ok(Some(message.json()?)),
            None => Ok(None),
        }
    }

    /// Acknowledge the consumer's current message. No-op when it holds none.
    ///
    /// If the acknowledgment fails the handle is kept, so the call can be
    /// retried.
    pub async fn task_done(&self, consumer: &mut Consumer) -> Result<()> {
        let Some(id) = consumer.current else {
            return Ok(());
        };
        self.store.ack(&self.stream, &self.group, id).await?;
        consumer.current = None;
        self.count("ack");
        record_state_transition(&tracing::Span::current(), "delivered", "idle");
        debug!(stream = %self.stream, id = %id, consumer = %consumer.name, "acknowledged");
        Ok(())
    }

    /// Scan the pending entries list for one abandoned entry and claim it.
    ///
    /// Acknowledges the consumer's current message first. Returns `Ok(None)`
    /// when nothing is stuck, or when another consumer won the claim.
    pub async fn get_stuck(
        &self,
        consumer: &mut Consumer,
        batch_size: usize,
    ) -> Result<Option<Message>> {
        self.task_done(consumer).await?;
        self.reclaim(consumer, batch_size).await
    }

    async fn reclaim(&self, consumer: &mut Consumer, batch_size: usize) -> Result<Option<Message>> {
        let batch_size = batch_size.max(1);
        let stuck_timeout = self.config.stuck_timeout;
        let mut cursor = Some(MessageId::MIN);

        while let Some(start) = cursor {
            let batch = self
                .store
                .pending_range(&self.stream, &self.group, start, MessageId::MAX, batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };

            if let Some(stuck) = batch.iter().find(|p| p.idle >= stuck_timeout) {
                let claimed = self
                    .store
                    .claim(
                        &self.stream,
                        &self.group,
                        &consumer.name,
                        stuck_timeout,
                        &[stuck.id],
                    )
                    .await?;
                let Some(entry) = claimed.into_iter().next() else {
                    debug!(stream = %self.stream, id = %stuck.id, "lost reclaim race");
                    return Ok(None);
                };
                info!(
                    stream = %self.stream,
                    id = %entry.id,
                    from = %stuck.consumer,
                    to = %consumer.name,
                    idle_ms = u64::try_from(stuck.idle.as_millis()).unwrap_or(u64::MAX),
                    deliveries = stuck.delivery_count,
                    "reclaimed stuck entry"
                );
                metrics::queue_reclaimed().add(1, &[KeyValue::new("queue", self.name.clone())]);
                return Ok(Some(self.deliver(consumer, entry)));
            }

            cursor = last.id.next();
        }
        Ok(None)
    }

    /// Wait for the next blocking read: until the deadline or the next
    /// scheduled stuck check, whichever comes first.
    fn next_wait(&self, consumer: &Consumer, deadline: Option<Instant>) -> Duration {
        let now = Instant::now();
        let until_check = consumer
            .last_stuck_check
            .map_or(Duration::ZERO, |last| {
                (last + self.config.stuck_check_interval).saturating_duration_since(now)
            });
        let wait = match deadline {
            Some(d) => until_check.min(d.saturating_duration_since(now)),
            None => until_check,
        };
        wait.max(Duration::from_millis(1))
    }

    fn deliver(&self, consumer: &mut Consumer, entry: StreamEntry) -> Message {
        debug_assert!(consumer.current.is_none(), "consumer already holds a message");
        consumer.current = Some(entry.id);
        self.count("get");

        let span = tracing::Span::current();
        span.record("message.id", tracing::field::display(entry.id));
        record_state_transition(&span, "idle", "delivered");
        Message::from(entry)
    }

    fn count(&self, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}
