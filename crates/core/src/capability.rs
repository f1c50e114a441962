//! Processing capabilities (downstream collaborators invoked by workers).
//!
//! Each capability is a single synchronous call. Implementations are expected
//! to be idempotent from the worker's point of view: a task may be handed to
//! the same capability many times when earlier attempts failed. Nothing here
//! enforces that; true exactly-once side effects are out of reach for an
//! at-least-once delivery layer.

use thiserror::Error;

use crate::id::TicketId;
use crate::task::User;

/// Failure reported by a capability.
///
/// Every variant is treated as transient by workers: the task is retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    /// The call never produced a response (connect/timeout/IO).
    #[error("transport error: {0}")]
    Transport(String),

    /// The downstream service answered with a non-success status.
    #[error("unexpected status code: {0}")]
    Status(u16),

    /// The downstream refused the request for another reason.
    #[error("rejected: {0}")]
    Rejected(String),
}

pub type CapabilityResult = Result<(), CapabilityError>;

pub trait ReceiptIssuer: Send + Sync {
    fn issue_receipt(&self, ticket_id: &TicketId) -> CapabilityResult;
}

pub trait SheetAppender: Send + Sync {
    fn append_row(&self, sheet: &str, row: &[String]) -> CapabilityResult;
}

pub trait NewsletterClient: Send + Sync {
    fn add_to_newsletter(&self, user: &User) -> CapabilityResult;
}

pub trait NotificationClient: Send + Sync {
    fn send_notification(&self, user: &User) -> CapabilityResult;
}

/// Alarm control (smoke sensor consumer).
pub trait AlarmClient: Send + Sync {
    fn start_alarm(&self) -> CapabilityResult;

    fn stop_alarm(&self) -> CapabilityResult;

    fn set_alarm_state(&self, on: bool) -> CapabilityResult {
        if on { self.start_alarm() } else { self.stop_alarm() }
    }
}
