//! Errors for frames that cannot be normalized.

use thiserror::Error;

/// A malformed upstream event. These are dropped and logged by the caller.
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// The frame is not a valid envelope.
    #[error("Unparseable envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    /// Dispatch frame without an event name.
    #[error("Dispatch frame without event type")]
    MissingEventType,

    /// Event name that cannot be used as a routing key.
    #[error("Invalid event type: {0:?}")]
    InvalidEventType(String),

    /// Dispatch frame without a data body.
    #[error("Dispatch frame without data")]
    MissingData,

    /// Only dispatch frames become events.
    #[error("Not a dispatch frame (op {0})")]
    NotDispatch(u8),
}

pub type Result<T> = std::result::Result<T, NormalizeError>;
