//! `courier-core`: task model and processing capability contracts.
//!
//! This crate contains **pure** primitives (no IO): what a unit of work is,
//! and the shape of the downstream collaborators that fulfil it.

pub mod capability;
pub mod error;
pub mod id;
pub mod task;

pub use capability::{
    AlarmClient, CapabilityError, CapabilityResult, NewsletterClient, NotificationClient,
    ReceiptIssuer, SheetAppender,
};
pub use error::{CoreError, CoreResult};
pub use id::{TaskId, TicketId};
pub use task::{AlarmCommand, Payload, SheetRow, TICKETS_TO_PRINT_SHEET, Task, TaskKind, User};
