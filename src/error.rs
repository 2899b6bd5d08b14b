//! Stack Error Types
//!
//! Errors surfaced through the request and configuration APIs. Wire-level
//! faults never appear here; they are reported through the engine outcomes.

use thiserror::Error;

/// Result type for modbus_rtu operations
pub type Result<T> = std::result::Result<T, RtuError>;

/// Protocol stack errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RtuError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A transaction is already in flight
    #[error("Engine busy: {0}")]
    Busy(String),

    /// Request parameters out of range
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Frame assembly or framing violations
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Driver-level faults reported by the link callbacks
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RtuError {
    fn from(err: std::io::Error) -> Self {
        RtuError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RtuError {
    fn from(err: serde_json::Error) -> Self {
        RtuError::Config(format!("JSON error: {}", err))
    }
}

// Helper methods for creating errors
impl RtuError {
    pub fn config(msg: impl Into<String>) -> Self {
        RtuError::Config(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        RtuError::Busy(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        RtuError::InvalidRequest(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        RtuError::Protocol(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        RtuError::Io(msg.into())
    }
}
