//! Delivery channel mechanics.
//!
//! Two shapes of "a sequence of pending messages" live here, both free of IO:
//!
//! - [`BoundedQueue`]: in-process FIFO with blocking backpressure.
//! - [`stream`]: consumer-group streams with explicit ack / nack, plus the
//!   [`InMemoryStream`] broker used for tests and local development.

pub mod channel;
pub mod memory_stream;
pub mod queue;
pub mod stream;

pub use channel::{DeliveryChannel, RecvError, SendError};
pub use memory_stream::InMemoryStream;
pub use queue::BoundedQueue;
pub use stream::{
    Acknowledger, Delivery, DeliverySource, MessageId, StreamError, StreamSubscription,
    StreamTransport,
};
