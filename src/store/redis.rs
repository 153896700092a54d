//! Redis Streams adapter.
//!
//! Each trait method is one Redis command: XGROUP CREATE, XADD, XREADGROUP,
//! XACK, XPENDING, XCLAIM, SET NX PX, and an EVAL script for the atomic
//! compare-and-delete. Replies are decoded from raw [`Value`]s so both RESP2
//! arrays and RESP3 maps are accepted.

use std::time::{Duration, Instant};

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncConnectionConfig, Client, Cmd, Value, cmd};
use async_trait::async_trait;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use super::{PAYLOAD_FIELD, StreamStore};
use crate::config::secrets::redacted_url;
use crate::error::{Error, Result};
use crate::model::{MessageId, PendingEntry, StreamEntry};
use crate::telemetry::metrics;

/// Deletes KEYS[1] only while it still holds ARGV[1].
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed [`StreamStore`].
///
/// Non-blocking commands share one multiplexed connection. A blocked
/// XREADGROUP holds up everything queued behind it on its connection, so
/// blocking reads check out a connection of their own from `idle_blocking`
/// and return it afterwards.
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
    idle_blocking: Mutex<Vec<MultiplexedConnection>>,
}

impl RedisStore {
    /// Connect to Redis. The URL may carry credentials, hence the secret.
    pub async fn connect(url: &SecretString) -> Result<Self> {
        let client = Client::open(url.expose_secret())?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = %redacted_url(url), "connected to redis");
        Ok(Self {
            client,
            conn,
            idle_blocking: Mutex::new(Vec::new()),
        })
    }

    /// Simple health check: PING.
    pub async fn ping(&self) -> Result<()> {
        self.run("PING", &cmd("PING")).await?;
        Ok(())
    }

    async fn run(&self, command: &'static str, c: &Cmd) -> Result<Value> {
        let mut conn = self.conn.clone();
        timed(command, c.query_async::<Value>(&mut conn)).await
    }

    /// Run a blocking command on a connection without a response timeout.
    ///
    /// The client's default response timeout is shorter than most BLOCK
    /// values; giving up early would leave the server delivering into a
    /// read nobody is waiting on.
    async fn run_blocking(&self, command: &'static str, c: &Cmd) -> Result<Value> {
        let idle = self.idle_blocking.lock().pop();
        let mut conn = match idle {
            Some(conn) => conn,
            None => {
                let config = AsyncConnectionConfig::new().set_response_timeout(None);
                debug!("opening blocking connection");
                self.client
                    .get_multiplexed_async_connection_with_config(&config)
                    .await?
            }
        };
        // A failed connection is dropped instead of being returned.
        let reply = timed(command, c.query_async::<Value>(&mut conn)).await?;
        self.idle_blocking.lock().push(conn);
        Ok(reply)
    }
}

async fn timed<F>(command: &'static str, fut: F) -> Result<Value>
where
    F: std::future::Future<Output = ::redis::RedisResult<Value>>,
{
    let started = Instant::now();
    let reply = fut.await;
    metrics::store_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("command", command)],
    );
    Ok(reply?)
}

/// Milliseconds for a BLOCK / PX argument. Zero means "forever" to Redis,
/// so never send it.
fn millis_arg(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl StreamStore for RedisStore {
    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut c = cmd("XGROUP");
        c.arg("CREATE").arg(stream).arg(group).arg("0").arg("MKSTREAM");
        match self.run("XGROUP", &c).await {
            Ok(_) => Ok(()),
            Err(Error::Store(e)) if e.code() == Some("BUSYGROUP") => {
                Err(Error::AlreadyExists(format!("{stream}/{group}")))
            }
            Err(e) => Err(e),
        }
    }

    async fn append(&self, stream: &str, payload: &[u8]) -> Result<MessageId> {
        let mut c = cmd("XADD");
        c.arg(stream).arg("*").arg(PAYLOAD_FIELD).arg(payload);
        let reply = self.run("XADD", &c).await?;
        parse_id(&reply)
    }

    async fn read_group(
        &self,
        streams: &[&str],
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>> {
        let [stream] = streams else {
            return Err(Error::MultiStreamUnsupported {
                requested: streams.len(),
            });
        };

        let mut c = cmd("XREADGROUP");
        c.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count);
        if let Some(block) = block {
            c.arg("BLOCK").arg(millis_arg(block));
        }
        c.arg("STREAMS").arg(*stream).arg(">");

        let reply = match block {
            Some(_) => self.run_blocking("XREADGROUP", &c).await?,
            None => self.run("XREADGROUP", &c).await?,
        };
        parse_read_reply(reply)
    }

    async fn ack(&self, stream: &str, group: &str, id: MessageId) -> Result<()> {
        let mut c = cmd("XACK");
        c.arg(stream).arg(group).arg(id.to_string());
        self.run("XACK", &c).await?;
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
        let mut c = cmd("XPENDING");
        c.arg(stream)
            .arg(group)
            .arg(start.to_string())
            .arg(end.to_string())
            .arg(count);
        let reply = self.run("XPENDING", &c).await?;
        let Value::Array(rows) = reply else {
            return Ok(Vec::new());
        };
        rows.iter().map(parse_pending_row).collect()
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[MessageId],
    ) -> Result<Vec<StreamEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut c = cmd("XCLAIM");
        c.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX));
        for id in ids {
            c.arg(id.to_string());
        }
        let reply = self.run("XCLAIM", &c).await?;
        let entries = parse_entries(&reply)?;
        debug!(stream, consumer, claimed = entries.len(), "xclaim");
        Ok(entries)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut c = cmd("SET");
        c.arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis_arg(ttl));
        let reply = self.run("SET", &c).await?;
        Ok(!matches!(reply, Value::Nil))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut c = cmd("EVAL");
        c.arg(COMPARE_AND_DELETE).arg(1).arg(key).arg(expected);
        let reply = self.run("EVAL", &c).await?;
        Ok(parse_u64(&reply)? > 0)
    }
}

// ---------------------------------------------------------------------------
// Reply decoding
// ---------------------------------------------------------------------------

fn protocol(what: &str, v: &Value) -> Error {
    Error::Other(format!("unexpected redis reply for {what}: {v:?}"))
}

fn parse_text(v: &Value) -> Result<String> {
    match v {
        Value::BulkString(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Ok(s.clone()),
        other => Err(protocol("string", other)),
    }
}

fn parse_id(v: &Value) -> Result<MessageId> {
    parse_text(v)?.parse()
}

fn parse_u64(v: &Value) -> Result<u64> {
    match v {
        Value::Int(i) => u64::try_from(*i).map_err(|_| protocol("integer", v)),
        Value::BulkString(_) | Value::SimpleString(_) => parse_text(v)?
            .parse()
            .map_err(|_| protocol("integer", v)),
        other => Err(protocol("integer", other)),
    }
}

/// `[[stream, [entry...]]...]` (RESP2) or `{stream: [entry...]}` (RESP3);
/// nil on timeout.
fn parse_read_reply(reply: Value) -> Result<Vec<StreamEntry>> {
    match reply {
        Value::Nil => Ok(Vec::new()),
        Value::Array(streams) => {
            let mut out = Vec::new();
            for s in &streams {
                match s {
                    Value::Array(pair) if pair.len() == 2 => out.extend(parse_entries(&pair[1])?),
                    other => return Err(protocol("XREADGROUP stream", other)),
                }
            }
            Ok(out)
        }
        Value::Map(streams) => {
            let mut out = Vec::new();
            for (_, entries) in &streams {
                out.extend(parse_entries(entries)?);
            }
            Ok(out)
        }
        other => Err(protocol("XREADGROUP", &other)),
    }
}

/// `[[id, fields]...]`. Nil slots (entries deleted while pending) are skipped.
fn parse_entries(v: &Value) -> Result<Vec<StreamEntry>> {
    let items = match v {
        Value::Nil => return Ok(Vec::new()),
        Value::Array(items) => items,
        other => return Err(protocol("entry list", other)),
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Nil => continue,
            Value::Array(pair) if pair.len() == 2 => {
                if matches!(pair[1], Value::Nil) {
                    continue;
                }
                out.push(StreamEntry {
                    id: parse_id(&pair[0])?,
                    payload: payload_field(&pair[1])?,
                });
            }
            other => return Err(protocol("entry", other)),
        }
    }
    Ok(out)
}

fn payload_field(fields: &Value) -> Result<Vec<u8>> {
    let pairs: Vec<(&Value, &Value)> = match fields {
        Value::Array(flat) => flat.chunks_exact(2).map(|kv| (&kv[0], &kv[1])).collect(),
        Value::Map(map) => map.iter().map(|(k, v)| (k, v)).collect(),
        other => return Err(protocol("entry fields", other)),
    };
    for (k, v) in pairs {
        if parse_text(k)? == PAYLOAD_FIELD {
            return match v {
                Value::BulkString(bytes) => Ok(bytes.clone()),
                Value::SimpleString(s) => Ok(s.clone().into_bytes()),
                other => Err(protocol("payload", other)),
            };
        }
    }
    Err(Error::Other(format!(
        "stream entry has no '{PAYLOAD_FIELD}' field"
    )))
}

/// `[id, consumer, idle_ms, delivery_count]`.
fn parse_pending_row(row: &Value) -> Result<PendingEntry> {
    match row {
        Value::Array(cols) if cols.len() == 4 => Ok(PendingEntry {
            id: parse_id(&cols[0])?,
            consumer: parse_text(&cols[1])?,
            idle: Duration::from_millis(parse_u64(&cols[2])?),
            delivery_count: parse_u64(&cols[3])?,
        }),
        other => Err(protocol("XPENDING row", other)),
    }
}
