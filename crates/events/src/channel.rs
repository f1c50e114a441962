//! In-process delivery channel abstraction (mechanics only).
//!
//! A delivery channel hands messages from producers to consumers **with
//! backpressure**: a full channel blocks the sender instead of dropping.
//!
//! ## Delivery Semantics
//!
//! - **No acknowledgement**: once `recv` yields a message it counts as
//!   delivered. Reliability is the consumer's job: on failure it puts the
//!   message back with [`DeliveryChannel::requeue`].
//! - **FIFO per channel**: messages come out in the order they went in.
//!   A requeued message goes to the tail, behind anything already waiting.
//! - **Close is final**: after [`DeliveryChannel::close`] sends fail, while
//!   receivers drain what is left (including requeued messages) and then
//!   observe [`RecvError::Closed`].
//!
//! ## Why `requeue` is separate from `send`
//!
//! A consumer that re-submits into its own full channel with a blocking
//! `send` waits for itself to make room and never returns. `requeue` admits
//! the message regardless of capacity, so the buffer overshoots by at most one
//! message per consumer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Failed send; carries the message back to the caller.
#[derive(Clone, PartialEq, Eq)]
pub enum SendError<M> {
    /// The channel was closed; the message was not enqueued.
    Closed(M),
    /// The channel stayed full for the whole wait (`try_send` / `send_timeout`).
    Full(M),
}

impl<M> SendError<M> {
    pub fn into_inner(self) -> M {
        match self {
            SendError::Closed(m) | SendError::Full(m) => m,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SendError::Closed(_))
    }
}

impl<M> fmt::Debug for SendError<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed(_) => f.write_str("Closed(..)"),
            SendError::Full(_) => f.write_str("Full(..)"),
        }
    }
}

impl<M> fmt::Display for SendError<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed(_) => f.write_str("channel closed"),
            SendError::Full(_) => f.write_str("channel full"),
        }
    }
}

impl<M> std::error::Error for SendError<M> {}

/// Failed receive.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    /// Nothing arrived before the deadline.
    #[error("timed out waiting for a message")]
    Timeout,
    /// The channel is closed and fully drained.
    #[error("channel closed")]
    Closed,
}

/// Domain-agnostic bounded delivery channel.
///
/// Implementations must be safe for concurrent `send` / `recv` from many
/// threads without external locking.
pub trait DeliveryChannel<M>: Send + Sync {
    /// Enqueue at the tail, blocking while the channel is full.
    fn send(&self, message: M) -> Result<(), SendError<M>>;

    /// Re-submit a message taken from this channel (tail, ignores capacity).
    fn requeue(&self, message: M) -> Result<(), SendError<M>>;

    /// Block for up to `timeout` waiting for the head message.
    fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvError>;

    /// Refuse further sends and wake every blocked party.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

impl<M, C> DeliveryChannel<M> for Arc<C>
where
    C: DeliveryChannel<M> + ?Sized,
{
    fn send(&self, message: M) -> Result<(), SendError<M>> {
        (**self).send(message)
    }

    fn requeue(&self, message: M) -> Result<(), SendError<M>> {
        (**self).requeue(message)
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvError> {
        (**self).recv_timeout(timeout)
    }

    fn close(&self) {
        (**self).close()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}
