//! Redis Streams-backed transport (durable, at-least-once delivery).
//!
//! - **Topic** = stream key; each message carries one `payload` field.
//! - **Consumer group** = `XGROUP CREATE <topic> <group> 0 MKSTREAM`, so a new
//!   group starts from the beginning of the stream.
//! - **Ack** = `XACK`. **Nack** leaves the entry in the consumer's pending
//!   list; the reader re-reads its own pending history (`XREADGROUP ... 0`)
//!   before asking for new entries (`>`), which redelivers it.
//! - **Dead consumers**: entries idle in another consumer's pending list for
//!   longer than `claim_idle` are taken over with `XAUTOCLAIM`.
//!
//! All calls are synchronous; one reader per worker thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use redis::Value;
use tracing::{debug, instrument, warn};

use courier_events::{
    Acknowledger, Delivery, DeliverySource, MessageId, StreamError, StreamSubscription,
    StreamTransport,
};

/// Stream entry field holding the message body.
pub const PAYLOAD_FIELD: &str = "payload";

/// Default idle time before another consumer's pending entry is claimed.
pub const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(60);

/// Upper bound on entries taken over per `XAUTOCLAIM`.
const CLAIM_BATCH: usize = 100;

fn command_error(command: &'static str) -> impl FnOnce(redis::RedisError) -> StreamError {
    move |e| StreamError::Transport(format!("{command} failed: {e}"))
}

#[derive(Debug, Clone)]
pub struct RedisStreamTransport {
    client: redis::Client,
    claim_idle: Duration,
}

impl RedisStreamTransport {
    /// `addr` may be a bare `host:port` (as in `REDIS_ADDR`) or a full URL.
    pub fn new(addr: &str) -> Result<Self, StreamError> {
        let addr = addr.trim();
        let url = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("redis://{addr}")
        };
        let client = redis::Client::open(url)
            .map_err(|e| StreamError::Transport(format!("invalid redis address {addr:?}: {e}")))?;
        Ok(Self {
            client,
            claim_idle: DEFAULT_CLAIM_IDLE,
        })
    }

    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        self.claim_idle = claim_idle;
        self
    }

    fn connection(&self) -> Result<redis::Connection, StreamError> {
        self.client
            .get_connection()
            .map_err(|e| StreamError::Transport(format!("redis connection error: {e}")))
    }

    /// Ensure `group` exists on `topic` (idempotent).
    pub fn ensure_group(&self, topic: &str, group: &str) -> Result<(), StreamError> {
        let mut conn = self.connection()?;
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(StreamError::ConsumerGroup(format!(
                "XGROUP CREATE {topic} {group} failed: {e}"
            ))),
        }
    }
}

impl StreamTransport for RedisStreamTransport {
    #[instrument(skip(self, payload), fields(payload_len = payload.len()), err)]
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<MessageId, StreamError> {
        let mut conn = self.connection()?;
        let id: String = redis::cmd("XADD")
            .arg(topic)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query(&mut conn)
            .map_err(command_error("XADD"))?;
        Ok(MessageId::new(id))
    }

    #[instrument(skip(self), err)]
    fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<StreamSubscription, StreamError> {
        self.ensure_group(topic, group)?;

        let acker = Arc::new(RedisAcker {
            client: self.client.clone(),
            // Pick up whatever this consumer left pending in a previous run.
            history_dirty: AtomicBool::new(true),
        });
        let source = RedisSource {
            client: self.client.clone(),
            conn: None,
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            acker,
            counts: DeliveryCounts::default(),
            claim_idle: self.claim_idle,
            last_claim: None,
        };
        Ok(StreamSubscription::new(topic, group, consumer, Box::new(source)))
    }
}

struct RedisAcker {
    client: redis::Client,
    /// Set when this consumer's pending list holds entries worth re-reading.
    history_dirty: AtomicBool,
}

impl Acknowledger for RedisAcker {
    #[instrument(skip(self), err)]
    fn ack(&self, topic: &str, group: &str, id: &MessageId) -> Result<(), StreamError> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| StreamError::Transport(format!("redis connection error: {e}")))?;
        let acked: u64 = redis::cmd("XACK")
            .arg(topic)
            .arg(group)
            .arg(id.as_str())
            .query(&mut conn)
            .map_err(command_error("XACK"))?;

        if acked == 0 {
            return Err(StreamError::UnknownMessage {
                group: group.to_string(),
                id: id.clone(),
            });
        }
        Ok(())
    }

    fn nack(&self, topic: &str, group: &str, id: &MessageId) -> Result<(), StreamError> {
        debug!(%topic, %group, message_id = %id, "leaving message pending for redelivery");
        self.history_dirty.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One entry read from a stream: id and payload (`None` for a deleted entry).
type RawEntry = (String, Option<Vec<u8>>);

/// Delivery counts for entries pending on one reader.
///
/// Holds only entries that can still come back: once history is clean every
/// earlier delivery was acked, so a fresh read starts the map over.
#[derive(Debug, Default)]
struct DeliveryCounts(HashMap<String, u32>);

impl DeliveryCounts {
    /// An entry re-read from this consumer's pending history.
    fn redelivered(&mut self, id: &str) -> u32 {
        let count = self.0.entry(id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// An entry read with `>`; nothing older is pending any more.
    fn fresh(&mut self, id: &str) -> u32 {
        self.0.clear();
        self.0.insert(id.to_string(), 1);
        1
    }

    fn forget(&mut self, id: &str) {
        self.0.remove(id);
    }

    fn clear(&mut self) {
        self.0.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.len()
    }
}

struct RedisSource {
    client: redis::Client,
    conn: Option<redis::Connection>,
    topic: String,
    group: String,
    consumer: String,
    acker: Arc<RedisAcker>,
    counts: DeliveryCounts,
    claim_idle: Duration,
    last_claim: Option<Instant>,
}

impl RedisSource {
    fn conn(&mut self) -> Result<&mut redis::Connection, StreamError> {
        if self.conn.is_none() {
            let conn = self
                .client
                .get_connection()
                .map_err(|e| StreamError::Transport(format!("redis connection error: {e}")))?;
            self.conn = Some(conn);
        }
        self.conn
            .as_mut()
            .ok_or_else(|| StreamError::Transport("redis connection unavailable".to_string()))
    }

    /// `XREADGROUP` one entry starting after `id` (`0` = own pending, `>` = new).
    fn read(&mut self, id: &str, block: Option<Duration>) -> Result<Option<RawEntry>, StreamError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1);
        if let Some(block) = block {
            // BLOCK 0 waits forever.
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(&self.topic).arg(id);

        let reply: redis::RedisResult<Value> = cmd.query(self.conn()?);
        match reply {
            Ok(value) => Ok(first_entry(value)),
            Err(e) => {
                self.conn = None;
                Err(command_error("XREADGROUP")(e))
            }
        }
    }

    /// Take over entries other consumers of the group left idle.
    fn reclaim_idle(&mut self) -> Result<(), StreamError> {
        let mut cmd = redis::cmd("XAUTOCLAIM");
        cmd.arg(&self.topic)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(CLAIM_BATCH)
            .arg("JUSTID");

        let reply: redis::RedisResult<Value> = cmd.query(self.conn()?);
        match reply {
            Ok(Value::Bulk(parts)) => {
                if let Some(Value::Bulk(claimed)) = parts.get(1) {
                    if !claimed.is_empty() {
                        debug!(topic = %self.topic, group = %self.group, count = claimed.len(), "claimed idle messages");
                        self.acker.history_dirty.store(true, Ordering::SeqCst);
                    }
                }
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                self.conn = None;
                Err(command_error("XAUTOCLAIM")(e))
            }
        }
    }

    fn deliver(
        &mut self,
        (id, payload): RawEntry,
        from_history: bool,
    ) -> Result<Option<Delivery>, StreamError> {
        let Some(payload) = payload else {
            // Trimmed from the stream while pending; nothing left to deliver.
            warn!(topic = %self.topic, message_id = %id, "pending entry no longer exists; acking");
            self.counts.forget(&id);
            self.acker
                .ack(&self.topic, &self.group, &MessageId::new(id))?;
            return Ok(None);
        };

        let count = if from_history {
            self.counts.redelivered(&id)
        } else {
            self.counts.fresh(&id)
        };
        let acker: Arc<dyn Acknowledger> = self.acker.clone();
        Ok(Some(Delivery::new(
            MessageId::new(id),
            self.topic.as_str(),
            self.group.as_str(),
            payload,
            count,
            acker,
        )))
    }
}

impl DeliverySource for RedisSource {
    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, StreamError> {
        if self.last_claim.is_none_or(|t| t.elapsed() >= self.claim_idle) {
            self.last_claim = Some(Instant::now());
            if let Err(e) = self.reclaim_idle() {
                warn!(topic = %self.topic, group = %self.group, error = %e, "idle reclaim failed");
            }
        }

        if self.acker.history_dirty.load(Ordering::SeqCst) {
            match self.read("0", None)? {
                Some(entry) => return self.deliver(entry, true),
                None => {
                    self.acker.history_dirty.store(false, Ordering::SeqCst);
                    self.counts.clear();
                }
            }
        }

        match self.read(">", Some(timeout))? {
            Some(entry) => self.deliver(entry, false),
            None => Ok(None),
        }
    }
}

/// Pull the first entry out of an `XREADGROUP` reply.
///
/// Shape: `[[topic, [[id, [field, value, ...]], ...]]]`, or nil on timeout.
fn first_entry(reply: Value) -> Option<RawEntry> {
    let Value::Bulk(streams) = reply else {
        return None;
    };
    let Some(Value::Bulk(stream)) = streams.into_iter().next() else {
        return None;
    };
    let Some(Value::Bulk(entries)) = stream.into_iter().nth(1) else {
        return None;
    };
    let Some(Value::Bulk(entry)) = entries.into_iter().next() else {
        return None;
    };

    let mut parts = entry.into_iter();
    let id = match parts.next()? {
        Value::Data(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Value::Status(s) => s,
        _ => return None,
    };
    let payload = match parts.next() {
        Some(Value::Bulk(fields)) => Some(payload_field(fields)),
        _ => None,
    };
    Some((id, payload))
}

fn payload_field(fields: Vec<Value>) -> Vec<u8> {
    let mut it = fields.into_iter();
    while let (Some(key), Some(value)) = (it.next(), it.next()) {
        if let (Value::Data(key), Value::Data(value)) = (key, value) {
            if key == PAYLOAD_FIELD.as_bytes() {
                return value;
            }
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use courier_core::TaskId;

    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_first_entry_of_a_read_reply() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("issue-receipt"),
            Value::Bulk(vec![Value::Bulk(vec![
                data("1718000000000-0"),
                Value::Bulk(vec![data("other"), data("x"), data(PAYLOAD_FIELD), data("TCK-1")]),
            ])]),
        ])]);

        assert_eq!(
            first_entry(reply),
            Some(("1718000000000-0".to_string(), Some(b"TCK-1".to_vec())))
        );
    }

    #[test]
    fn timeout_and_empty_history_yield_nothing() {
        assert_eq!(first_entry(Value::Nil), None);
        let empty_history = Value::Bulk(vec![Value::Bulk(vec![data("t"), Value::Bulk(vec![])])]);
        assert_eq!(first_entry(empty_history), None);
    }

    #[test]
    fn deleted_pending_entry_has_no_payload() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("t"),
            Value::Bulk(vec![Value::Bulk(vec![data("5-0"), Value::Nil])]),
        ])]);
        assert_eq!(first_entry(reply), Some(("5-0".to_string(), None)));
    }

    #[test]
    fn counts_stay_bounded_on_a_healthy_stream() {
        let mut counts = DeliveryCounts::default();
        for n in 0..1_000 {
            assert_eq!(counts.fresh(&format!("{n}-0")), 1);
        }
        assert_eq!(counts.len(), 1);
    }

    #[test]
    fn counts_grow_across_history_rereads() {
        let mut counts = DeliveryCounts::default();
        assert_eq!(counts.fresh("1-0"), 1);
        // nacked, then re-read from pending history twice
        assert_eq!(counts.redelivered("1-0"), 2);
        assert_eq!(counts.redelivered("1-0"), 3);
        // a claimed entry first seen through history
        assert_eq!(counts.redelivered("7-0"), 1);
        assert_eq!(counts.len(), 2);

        counts.forget("7-0");
        counts.clear();
        assert_eq!(counts.len(), 0);
    }

    #[test]
    fn bare_address_gets_redis_scheme() {
        assert!(RedisStreamTransport::new("localhost:6379").is_ok());
        assert!(RedisStreamTransport::new("redis://localhost:6379/0").is_ok());
        assert!(RedisStreamTransport::new("http://localhost:6379").is_err());
    }

    fn redis_addr() -> String {
        std::env::var("REDIS_ADDR").unwrap_or_else(|_| "127.0.0.1:6379".to_string())
    }

    fn unique(prefix: &str) -> String {
        format!("{prefix}-{}", TaskId::new())
    }

    #[test]
    #[ignore = "requires running Redis instance"]
    fn publish_read_ack_roundtrip() {
        let transport = RedisStreamTransport::new(&redis_addr()).unwrap();
        let topic = unique("issue-receipt");
        let mut sub = transport.subscribe(&topic, "receivers", "r1").unwrap();

        let id = transport.publish(&topic, b"TCK-1").unwrap();
        let delivery = sub.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(delivery.id(), &id);
        assert_eq!(delivery.payload(), b"TCK-1");
        assert_eq!(delivery.delivery_count(), 1);
        delivery.ack().unwrap();

        assert!(sub.recv_timeout(Duration::from_millis(100)).unwrap().is_none());
    }

    #[test]
    #[ignore = "requires running Redis instance"]
    fn nack_redelivers_to_the_same_group_only() {
        let transport = RedisStreamTransport::new(&redis_addr()).unwrap();
        let topic = unique("tickets");
        let mut trackers = transport.subscribe(&topic, "trackers", "t1").unwrap();
        let mut receivers = transport.subscribe(&topic, "receivers", "r1").unwrap();
        transport.publish(&topic, b"TCK-1").unwrap();

        trackers
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .unwrap()
            .ack()
            .unwrap();
        receivers
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .unwrap()
            .nack()
            .unwrap();

        let again = receivers.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(again.payload(), b"TCK-1");
        assert_eq!(again.delivery_count(), 2);
        again.ack().unwrap();

        assert!(trackers.recv_timeout(Duration::from_millis(100)).unwrap().is_none());
    }

    #[test]
    #[ignore = "requires running Redis instance"]
    fn idle_entries_of_a_dead_consumer_are_claimed() {
        let transport = RedisStreamTransport::new(&redis_addr())
            .unwrap()
            .with_claim_idle(Duration::from_millis(50));
        let topic = unique("append-to-tracker");
        let mut dead = transport.subscribe(&topic, "trackers", "dead").unwrap();
        let mut alive = transport.subscribe(&topic, "trackers", "alive").unwrap();
        transport.publish(&topic, b"TCK-2").unwrap();

        drop(dead.recv_timeout(Duration::from_secs(2)).unwrap().unwrap());
        std::thread::sleep(Duration::from_millis(100));

        let claimed = alive.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(claimed.payload(), b"TCK-2");
        claimed.ack().unwrap();
    }
}
