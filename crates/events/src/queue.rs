//! Bounded in-process queue (Mutex + Condvar).

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::channel::{DeliveryChannel, RecvError, SendError};

/// Default capacity used by the ticketing service.
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug)]
struct QueueState<M> {
    items: VecDeque<M>,
    closed: bool,
}

/// Bounded FIFO queue with blocking backpressure.
///
/// - `send` blocks while `len() >= capacity` (never drops, never errors on
///   capacity)
/// - `recv` blocks while empty
/// - producers and consumers wait on separate condition variables, so a
///   freed slot wakes a producer and a new item wakes a consumer
///
/// Lock poisoning is recovered from: no operation leaves the state half
/// updated, so the inner guard is always consistent.
#[derive(Debug)]
pub struct BoundedQueue<M> {
    state: Mutex<QueueState<M>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<M> BoundedQueue<M> {
    /// A capacity of zero is rounded up to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    pub fn arc(capacity: usize) -> Arc<Self> {
        Arc::new(Self::new(capacity))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<M>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue, blocking until a slot frees up or the queue is closed.
    pub fn send(&self, message: M) -> Result<(), SendError<M>> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(SendError::Closed(message));
            }
            if state.items.len() < self.capacity {
                state.items.push_back(message);
                drop(state);
                self.not_empty.notify_one();
                return Ok(());
            }
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`send`](Self::send) but gives up with `Full` after `timeout`.
    pub fn send_timeout(&self, message: M, timeout: Duration) -> Result<(), SendError<M>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(SendError::Closed(message));
            }
            if state.items.len() < self.capacity {
                state.items.push_back(message);
                drop(state);
                self.not_empty.notify_one();
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SendError::Full(message));
            }
            state = self
                .not_full
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn try_send(&self, message: M) -> Result<(), SendError<M>> {
        self.send_timeout(message, Duration::ZERO)
    }

    /// Put a message back at the tail regardless of capacity.
    ///
    /// Accepted even after `close`: a message already taken from the queue is
    /// still owed a delivery, and the drain picks it up.
    pub fn requeue(&self, message: M) -> Result<(), SendError<M>> {
        let mut state = self.lock();
        state.items.push_back(message);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Block until a message is available or the queue is closed and drained.
    pub fn recv(&self) -> Result<M, RecvError> {
        let mut state = self.lock();
        loop {
            if let Some(message) = self.pop_front(&mut state) {
                return Ok(message);
            }
            if state.closed {
                return Err(RecvError::Closed);
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(message) = self.pop_front(&mut state) {
                return Ok(message);
            }
            if state.closed {
                return Err(RecvError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RecvError::Timeout);
            }
            state = self
                .not_empty
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn try_recv(&self) -> Result<M, RecvError> {
        self.recv_timeout(Duration::ZERO)
    }

    fn pop_front(&self, state: &mut QueueState<M>) -> Option<M> {
        let message = state.items.pop_front()?;
        if state.items.len() < self.capacity {
            self.not_full.notify_one();
        }
        Some(message)
    }

    /// Close the queue. Pending messages stay receivable; new sends fail.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Blocking iterator that ends once the queue is closed and drained.
    pub fn iter(&self) -> Iter<'_, M> {
        Iter { queue: self }
    }
}

impl<M> Default for BoundedQueue<M> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// See [`BoundedQueue::iter`].
#[derive(Debug)]
pub struct Iter<'a, M> {
    queue: &'a BoundedQueue<M>,
}

impl<M> Iterator for Iter<'_, M> {
    type Item = M;

    fn next(&mut self) -> Option<M> {
        self.queue.recv().ok()
    }
}

impl<M: Send> DeliveryChannel<M> for BoundedQueue<M> {
    fn send(&self, message: M) -> Result<(), SendError<M>> {
        BoundedQueue::send(self, message)
    }

    fn requeue(&self, message: M) -> Result<(), SendError<M>> {
        BoundedQueue::requeue(self, message)
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvError> {
        BoundedQueue::recv_timeout(self, timeout)
    }

    fn close(&self) {
        BoundedQueue::close(self)
    }

    fn is_closed(&self) -> bool {
        BoundedQueue::is_closed(self)
    }
}
