//! Consumer-group streams (mechanics only).
//!
//! A stream is a durable, ordered log per **topic**. Readers join a **consumer
//! group**; every group has its own cursor over the log, and the consumers
//! inside one group share that cursor (each message goes to one of them).
//!
//! ## Delivery Semantics
//!
//! - **At-least-once**: a message counts as consumed by a group only once it
//!   is acked. A nacked message, or one whose consumer died holding it, is
//!   handed to the same group again.
//! - **Fan-out**: every group on a topic sees every message; settling in one
//!   group never affects another.
//! - **Ordering**: best-effort FIFO per topic. Redeliveries may overtake or
//!   trail newer messages.
//!
//! Settling ([`Delivery::ack`] / [`Delivery::nack`]) consumes the delivery,
//! so a handle cannot be settled twice.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How long a subscription iterator blocks per poll.
const ITER_POLL: Duration = Duration::from_secs(1);

/// Transport-assigned message identifier (e.g. `1718000000000-0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream transport error: {0}")]
    Transport(String),

    #[error("consumer group error: {0}")]
    ConsumerGroup(String),

    #[error("message {id} is not pending in group {group}")]
    UnknownMessage { group: String, id: MessageId },

    #[error("stream closed")]
    Closed,
}

/// Settles deliveries on behalf of a transport.
pub trait Acknowledger: Send + Sync {
    /// Mark `id` as consumed by `group`.
    fn ack(&self, topic: &str, group: &str, id: &MessageId) -> Result<(), StreamError>;

    /// Make `id` eligible for redelivery to `group`.
    fn nack(&self, topic: &str, group: &str, id: &MessageId) -> Result<(), StreamError>;
}

/// One message handed to one consumer of a group.
///
/// Dropping a delivery without settling it leaves it pending; the transport
/// reclaims it once it has been idle long enough.
pub struct Delivery {
    id: MessageId,
    topic: String,
    group: String,
    payload: Vec<u8>,
    delivery_count: u32,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        id: MessageId,
        topic: impl Into<String>,
        group: impl Into<String>,
        payload: Vec<u8>,
        delivery_count: u32,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            id,
            topic: topic.into(),
            group: group.into(),
            payload,
            delivery_count,
            acker,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// 1 on first delivery, incremented on every redelivery to this group.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn ack(self) -> Result<(), StreamError> {
        self.acker.ack(&self.topic, &self.group, &self.id)
    }

    pub fn nack(self) -> Result<(), StreamError> {
        self.acker.nack(&self.topic, &self.group, &self.id)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("group", &self.group)
            .field("payload_len", &self.payload.len())
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

/// Transport-specific reader behind a [`StreamSubscription`].
pub trait DeliverySource: Send {
    /// Wait up to `timeout` for the next delivery. `Ok(None)` means nothing
    /// arrived; `Err(StreamError::Closed)` means nothing ever will.
    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, StreamError>;
}

/// A consumer's handle on one topic/group.
pub struct StreamSubscription {
    topic: String,
    group: String,
    consumer: String,
    source: Box<dyn DeliverySource>,
}

impl StreamSubscription {
    pub fn new(
        topic: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        source: Box<dyn DeliverySource>,
    ) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            consumer: consumer.into(),
            source,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Delivery>, StreamError> {
        self.source.next_delivery(timeout)
    }
}

impl fmt::Debug for StreamSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSubscription")
            .field("topic", &self.topic)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

/// Lazy, blocking sequence of deliveries. Ends when the stream is closed.
impl Iterator for StreamSubscription {
    type Item = Result<Delivery, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.source.next_delivery(ITER_POLL) {
                Ok(Some(delivery)) => return Some(Ok(delivery)),
                Ok(None) => continue,
                Err(StreamError::Closed) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Durable pub/sub with consumer groups.
pub trait StreamTransport: Send + Sync {
    /// Append `payload` to `topic`, creating the topic if needed.
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<MessageId, StreamError>;

    /// Join `group` on `topic` as `consumer`, creating the group if needed.
    ///
    /// A newly created group starts from the beginning of the topic.
    fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<StreamSubscription, StreamError>;
}

impl<T> StreamTransport for Arc<T>
where
    T: StreamTransport + ?Sized,
{
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<MessageId, StreamError> {
        (**self).publish(topic, payload)
    }

    fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<StreamSubscription, StreamError> {
        (**self).subscribe(topic, group, consumer)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingAcker {
        calls: Mutex<Vec<(&'static str, String, String, MessageId)>>,
    }

    impl Acknowledger for RecordingAcker {
        fn ack(&self, topic: &str, group: &str, id: &MessageId) -> Result<(), StreamError> {
            self.calls
                .lock()
                .unwrap()
                .push(("ack", topic.to_string(), group.to_string(), id.clone()));
            Ok(())
        }

        fn nack(&self, topic: &str, group: &str, id: &MessageId) -> Result<(), StreamError> {
            self.calls
                .lock()
                .unwrap()
                .push(("nack", topic.to_string(), group.to_string(), id.clone()));
            Ok(())
        }
    }

    struct Scripted(Vec<Result<Option<Delivery>, StreamError>>);

    impl DeliverySource for Scripted {
        fn next_delivery(&mut self, _timeout: Duration) -> Result<Option<Delivery>, StreamError> {
            if self.0.is_empty() {
                Err(StreamError::Closed)
            } else {
                self.0.remove(0)
            }
        }
    }

    fn delivery(acker: &Arc<RecordingAcker>, id: &str) -> Delivery {
        Delivery::new(MessageId::from(id), "issue-receipt", "receivers", b"x".to_vec(), 1, acker.clone())
    }

    #[test]
    fn settling_routes_to_the_acknowledger_with_coordinates() {
        let acker = Arc::new(RecordingAcker::default());
        delivery(&acker, "1-0").ack().unwrap();
        delivery(&acker, "2-0").nack().unwrap();

        let calls = acker.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], ("ack", "issue-receipt".into(), "receivers".into(), MessageId::from("1-0")));
        assert_eq!(calls[1].0, "nack");
        assert_eq!(calls[1].3.as_str(), "2-0");
    }

    #[test]
    fn iterator_skips_empty_polls_and_ends_on_close() {
        let acker = Arc::new(RecordingAcker::default());
        let source = Scripted(vec![
            Ok(None),
            Ok(Some(delivery(&acker, "1-0"))),
            Err(StreamError::Transport("boom".into())),
            Ok(Some(delivery(&acker, "2-0"))),
        ]);
        let sub = StreamSubscription::new("issue-receipt", "receivers", "c1", Box::new(source));

        let items: Vec<_> = sub.collect();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap().id().as_str(), "1-0");
        assert!(matches!(items[1], Err(StreamError::Transport(_))));
        assert_eq!(items[2].as_ref().unwrap().id().as_str(), "2-0");
    }
}
