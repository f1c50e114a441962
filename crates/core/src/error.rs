//! Core error model.

use thiserror::Error;

use crate::task::TaskKind;

/// Result type used across the core layer.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core-level error.
///
/// Keep this focused on deterministic failures (validation, malformed
/// encodings). Transport and downstream failures belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A value failed validation (e.g. an empty ticket id).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A serialized task or raw payload could not be decoded.
    #[error("malformed task encoding: {0}")]
    Encoding(String),

    /// A raw payload was not meaningful for the task kind it was decoded as.
    #[error("unexpected payload for {kind}: {reason}")]
    UnexpectedPayload { kind: TaskKind, reason: String },
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }
}
