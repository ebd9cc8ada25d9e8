//! Transport error types.

use thiserror::Error;

/// Failures surfaced by sessions and transport handlers.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The session or handler no longer accepts outbound messages.
    #[error("session is closed")]
    Closed,

    /// The peer broke the session protocol.
    #[error("protocol violation: {reason}")]
    Protocol {
        /// What was violated.
        reason: String,
    },

    /// Input that does not decode as frames.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Why decoding stopped.
        reason: String,
    },

    /// The outbound queue stayed full for the whole wait.
    #[error("outbound buffer still full after {waited_ms}ms")]
    BackpressureTimeout {
        /// How long the producer waited.
        waited_ms: u64,
    },

    /// The physical connection went away.
    #[error("physical connection is gone")]
    ChannelClosed,

    /// A message could not be serialized.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl TransportError {
    /// True when the physical connection itself was lost.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TransportError::ChannelClosed)
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::SerializationError(err.to_string())
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
