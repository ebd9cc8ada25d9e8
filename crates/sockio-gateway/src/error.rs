//! Error types for the sockio gateway

use thiserror::Error;

/// Failures while configuring or starting the gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration value rejected
    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
    /// Listener could not be bound or the server loop failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
