//! In-memory consumer-group stream for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::stream::{
    Acknowledger, Delivery, DeliverySource, MessageId, StreamError, StreamSubscription,
    StreamTransport,
};

/// Pending messages idle for this long are handed to another consumer.
pub const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Entry {
    id: MessageId,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct Pending {
    index: usize,
    consumer: String,
    since: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct Group {
    /// Next log index never handed to this group.
    cursor: usize,
    /// Nacked or reclaimed messages: (log index, deliveries so far).
    redeliver: VecDeque<(usize, u32)>,
    pending: HashMap<MessageId, Pending>,
    acked: usize,
}

#[derive(Debug, Default)]
struct Topic {
    log: Vec<Entry>,
    groups: HashMap<String, Group>,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Topic>,
    closed: bool,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    available: Condvar,
    claim_idle: Duration,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the next message for `group` to `consumer`, if any.
    fn take_next(
        &self,
        state: &mut State,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Option<(MessageId, Vec<u8>, u32)> {
        let t = state.topics.get_mut(topic)?;
        let g = t.groups.get_mut(group)?;

        let now = Instant::now();
        let mut idle: Vec<MessageId> = g
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.since) >= self.claim_idle)
            .map(|(id, _)| id.clone())
            .collect();
        idle.sort();
        for id in idle {
            if let Some(p) = g.pending.remove(&id) {
                debug!(%id, from = %p.consumer, "reclaiming idle message");
                g.redeliver.push_back((p.index, p.delivery_count));
            }
        }

        let (index, previous) = match g.redeliver.pop_front() {
            Some(next) => next,
            None if g.cursor < t.log.len() => {
                g.cursor += 1;
                (g.cursor - 1, 0)
            }
            None => return None,
        };

        let entry = &t.log[index];
        let delivery_count = previous + 1;
        g.pending.insert(
            entry.id.clone(),
            Pending {
                index,
                consumer: consumer.to_string(),
                since: now,
                delivery_count,
            },
        );
        Some((entry.id.clone(), entry.payload.clone(), delivery_count))
    }

    fn group_mut<'a>(
        state: &'a mut State,
        topic: &str,
        group: &str,
        id: &MessageId,
    ) -> Result<&'a mut Group, StreamError> {
        state
            .topics
            .get_mut(topic)
            .and_then(|t| t.groups.get_mut(group))
            .ok_or_else(|| StreamError::UnknownMessage {
                group: group.to_string(),
                id: id.clone(),
            })
    }
}

impl Acknowledger for Inner {
    fn ack(&self, topic: &str, group: &str, id: &MessageId) -> Result<(), StreamError> {
        let mut state = self.lock();
        let g = Self::group_mut(&mut state, topic, group, id)?;
        match g.pending.remove(id) {
            Some(_) => {
                g.acked += 1;
                Ok(())
            }
            None => Err(StreamError::UnknownMessage {
                group: group.to_string(),
                id: id.clone(),
            }),
        }
    }

    fn nack(&self, topic: &str, group: &str, id: &MessageId) -> Result<(), StreamError> {
        let mut state = self.lock();
        let g = Self::group_mut(&mut state, topic, group, id)?;
        let Some(p) = g.pending.remove(id) else {
            return Err(StreamError::UnknownMessage {
                group: group.to_string(),
                id: id.clone(),
            });
        };
        g.redeliver.push_back((p.index, p.delivery_count));
        drop(state);
        self.available.notify_all();
        Ok(())
    }
}

/// In-memory stream broker.
///
/// - No IO
/// - Topics and groups are created on first use
/// - A new group starts from the beginning of the topic
/// - Cloning yields another handle to the same broker
#[derive(Debug, Clone)]
pub struct InMemoryStream {
    inner: Arc<Inner>,
}

impl InMemoryStream {
    pub fn new() -> Self {
        Self::with_claim_idle(DEFAULT_CLAIM_IDLE)
    }

    /// Broker that reclaims pending messages idle for at least `claim_idle`.
    pub fn with_claim_idle(claim_idle: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                available: Condvar::new(),
                claim_idle,
            }),
        }
    }

    /// Stop the broker: publishes fail and every reader observes `Closed`.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.inner.available.notify_all();
    }

    pub fn published_count(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map_or(0, |t| t.log.len())
    }

    /// Messages handed out to `group` and not yet settled.
    pub fn pending_count(&self, topic: &str, group: &str) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    pub fn acked_count(&self, topic: &str, group: &str) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map_or(0, |g| g.acked)
    }
}

impl Default for InMemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Acknowledger for InMemoryStream {
    fn ack(&self, topic: &str, group: &str, id: &MessageId) -> Result<(), StreamError> {
        self.inner.ack(topic, group, id)
    }

    fn nack(&self, topic: &str, group: &str, id: &MessageId) -> Result<(), StreamError> {
        self.inner.nack(topic, group, id)
    }
}

impl StreamTransport for InMemoryStream {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<MessageId, StreamError> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(StreamError::Closed);
        }
        let t = state.topics.entry(topic.to_string()).or_default();
        let id = MessageId::new(format!("{}-0", t.log.len() + 1));
        t.log.push(Entry {
            id: id.clone(),
            payload: payload.to_vec(),
        });
        drop(state);
        self.inner.available.notify_all();
        Ok(id)
    }

    fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<StreamSubscription, StreamError> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(StreamError::Closed);
        }
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        drop(state);

        let source = MemorySource {
            inner: self.inner.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
        };
        Ok(StreamSubscription::new(topic, group, consumer, Box::new(source)))
    }
}

struct MemorySource {
    inner: Arc<Inner>,
    topic: String,
    group: String,
    consumer: String,
}

impl DeliverySource for MemorySource {
    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, StreamError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        loop {
            if state.closed {
                return Err(StreamError::Closed);
            }
            if let Some((id, payload, count)) =
                self.inner
                    .take_next(&mut state, &self.topic, &self.group, &self.consumer)
            {
                let acker: Arc<dyn Acknowledger> = self.inner.clone();
                return Ok(Some(Delivery::new(
                    id,
                    self.topic.as_str(),
                    self.group.as_str(),
                    payload,
                    count,
                    acker,
                )));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Bounded by claim_idle so idle pending messages are noticed
            // even when nothing is published.
            let wait = (deadline - now).min(self.inner.claim_idle.max(Duration::from_millis(1)));
            state = self
                .inner
                .available
                .wait_timeout(state, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
