//! In-process [`StreamStore`] with Redis Streams semantics.
//!
//! Used by the test suite and for local development. It keeps:
//! - per-stream entry logs with store-assigned ids;
//! - consumer groups, each with its own pending entries list;
//! - expiring string keys for locks.
//!
//! Time is read from `tokio::time`, so idle times and key expiry follow a
//! paused test clock. Every call is also appended to a call log so tests can
//! assert on ordering.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::StreamStore;
use crate::error::{Error, Result};
use crate::model::{MessageId, PendingEntry, StreamEntry};

/// A store method invocation, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreCall {
    CreateGroup,
    Append,
    ReadGroup,
    Ack,
    PendingRange,
    Claim,
    SetIfAbsent,
    CompareAndDelete,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, Stream>,
    keys: HashMap<String, KeyEntry>,
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<MessageId, Vec<u8>>,
    last_id: MessageId,
    groups: HashMap<String, Group>,
}

struct Group {
    last_delivered: MessageId,
    pending: BTreeMap<MessageId, Pending>,
}

struct Pending {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

struct KeyEntry {
    value: String,
    expires_at: Instant,
}

impl KeyEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-memory stream store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    appended: Notify,
    calls: Mutex<Vec<StoreCall>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All store calls made so far, oldest first.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Make every subsequent call fail with [`Error::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current value of a live (unexpired) key.
    pub fn value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let state = self.state.lock();
        state
            .keys
            .get(key)
            .filter(|k| k.is_live(now))
            .map(|k| k.value.clone())
    }

    /// Number of entries ever appended to a stream and still stored.
    pub fn len(&self, stream: &str) -> usize {
        let state = self.state.lock();
        state.streams.get(stream).map_or(0, |s| s.entries.len())
    }

    /// Whole pending entries list of a group.
    pub fn pending(&self, stream: &str, group: &str) -> Vec<PendingEntry> {
        let now = Instant::now();
        let state = self.state.lock();
        state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| {
                g.pending
                    .iter()
                    .map(|(id, p)| pending_entry(*id, p, now))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn enter(&self, call: StoreCall) -> Result<()> {
        self.calls.lock().push(call);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable(format!("{call:?} refused")));
        }
        Ok(())
    }

    fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let s = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let g = s
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream, group))?;

        let fresh: Vec<StreamEntry> = match g.last_delivered.next() {
            Some(from) => s
                .entries
                .range(from..)
                .take(count)
                .map(|(id, payload)| StreamEntry {
                    id: *id,
                    payload: payload.clone(),
                })
                .collect(),
            None => Vec::new(),
        };

        for entry in &fresh {
            g.last_delivered = entry.id;
            g.pending.insert(
                entry.id,
                Pending {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
        }
        Ok(fresh)
    }
}

fn no_group(stream: &str, group: &str) -> Error {
    Error::Other(format!("NOGROUP no consumer group '{group}' for stream '{stream}'"))
}

fn pending_entry(id: MessageId, p: &Pending, now: Instant) -> PendingEntry {
    PendingEntry {
        id,
        consumer: p.consumer.clone(),
        idle: now.saturating_duration_since(p.delivered_at),
        delivery_count: p.delivery_count,
    }
}

fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        self.enter(StoreCall::CreateGroup)?;
        let mut state = self.state.lock();
        let s = state.streams.entry(stream.to_string()).or_default();
        if s.groups.contains_key(group) {
            return Err(Error::AlreadyExists(format!("{stream}/{group}")));
        }
        s.groups.insert(
            group.to_string(),
            Group {
                last_delivered: MessageId::MIN,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &[u8]) -> Result<MessageId> {
        self.enter(StoreCall::Append)?;
        let id = {
            let mut state = self.state.lock();
            let s = state.streams.entry(stream.to_string()).or_default();
            let millis = wall_clock_millis();
            let id = if millis > s.last_id.millis {
                MessageId::new(millis, 0)
            } else {
                s.last_id
                    .next()
                    .ok_or_else(|| Error::Other(format!("stream '{stream}' id space exhausted")))?
            };
            s.last_id = id;
            s.entries.insert(id, payload.to_vec());
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        streams: &[&str],
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>> {
        self.enter(StoreCall::ReadGroup)?;
        let [stream] = streams else {
            return Err(Error::MultiStreamUnsupported {
                requested: streams.len(),
            });
        };
        let deadline = block.map(|d| Instant::now() + d);

        loop {
            // Register interest before looking, so an append between the
            // check and the wait is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.read_new(stream, group, consumer, count)?;
            if !entries.is_empty() {
                return Ok(entries);
            }
            let Some(deadline) = deadline else {
                return Ok(entries);
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: MessageId) -> Result<()> {
        self.enter(StoreCall::Ack)?;
        let mut state = self.state.lock();
        if let Some(g) = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            g.pending.remove(&id);
        }
        Ok(())
    }

    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        start: MessageId,
        end: MessageId,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        self.enter(StoreCall::PendingRange)?;
        if start > end {
            return Ok(Vec::new());
        }
        let now = Instant::now();
        let state = self.state.lock();
        let g = state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_group(stream, group))?;
        Ok(g.pending
            .range(start..=end)
            .take(count)
            .map(|(id, p)| pending_entry(*id, p, now))
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[MessageId],
    ) -> Result<Vec<StreamEntry>> {
        self.enter(StoreCall::Claim)?;
        let now = Instant::now();
        let mut state = self.state.lock();
        let s = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let g = s
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream, group))?;

        let mut claimed = Vec::new();
        for id in ids {
            let Some(p) = g.pending.get_mut(id) else {
                continue;
            };
            if now.saturating_duration_since(p.delivered_at) < min_idle {
                continue;
            }
            match s.entries.get(id) {
                Some(payload) => {
                    p.consumer = consumer.to_string();
                    p.delivered_at = now;
                    p.delivery_count += 1;
                    claimed.push(StreamEntry {
                        id: *id,
                        payload: payload.clone(),
                    });
                }
                // Entry deleted from the stream while pending.
                None => {
                    g.pending.remove(id);
                }
            }
        }
        Ok(claimed)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.enter(StoreCall::SetIfAbsent)?;
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.keys.get(key).is_some_and(|k| k.is_live(now)) {
            return Ok(false);
        }
        state.keys.insert(
            key.to_string(),
            KeyEntry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.enter(StoreCall::CompareAndDelete)?;
        let now = Instant::now();
        let mut state = self.state.lock();
        let owned = state
            .keys
            .get(key)
            .is_some_and(|k| k.is_live(now) && k.value == expected);
        if owned {
            state.keys.remove(key);
        }
        Ok(owned)
    }
}
