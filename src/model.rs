//! Core data model.
//!
//! Stream entries are addressed by a store-assigned `"<millis>-<sequence>"`
//! id. Consumers see entries as [`Message`]s and the pending entries list
//! (PEL) as [`PendingEntry`] rows.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Message id
// ---------------------------------------------------------------------------

/// Stream entry id. Ordering is numeric on `(millis, seq)`; the default is
/// [`MessageId::MIN`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId {
    pub millis: u64,
    pub seq: u64,
}

impl MessageId {
    /// Smallest id a stream can hold; the start of a full PEL range.
    pub const MIN: MessageId = MessageId { millis: 0, seq: 0 };

    /// Largest representable id; the end of a full PEL range.
    pub const MAX: MessageId = MessageId {
        millis: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// The id immediately after this one.
    ///
    /// Range queries against the store are inclusive, so a pagination cursor
    /// resumes from `last.next()`. Returns `None` only for [`MessageId::MAX`].
    pub fn next(&self) -> Option<MessageId> {
        match self.seq.checked_add(1) {
            Some(seq) => Some(MessageId::new(self.millis, seq)),
            None => self.millis.checked_add(1).map(|millis| MessageId::new(millis, 0)),
        }
    }

    /// Wall-clock time the store assigned to this entry.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let millis = i64::try_from(self.millis).ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (millis, seq) = s
            .split_once('-')
            .ok_or_else(|| Error::InvalidMessageId(s.to_string()))?;
        let millis = millis
            .parse()
            .map_err(|_| Error::InvalidMessageId(s.to_string()))?;
        let seq = seq
            .parse()
            .map_err(|_| Error::InvalidMessageId(s.to_string()))?;
        Ok(Self { millis, seq })
    }
}

impl TryFrom<String> for MessageId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> Self {
        id.to_string()
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// A raw stream entry as returned by `read_group` and `claim`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

/// One row of a consumer group's pending entries list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: MessageId,
    /// Consumer the entry is currently assigned to.
    pub consumer: String,
    /// Time since the entry was last delivered.
    pub idle: Duration,
    pub delivery_count: u64,
}

/// A delivered message. The payload is opaque to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

impl Message {
    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

impl From<StreamEntry> for Message {
    fn from(entry: StreamEntry) -> Self {
        Self {
            id: entry.id,
            payload: entry.payload,
        }
    }
}
