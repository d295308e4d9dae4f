//! Protocol errors

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while talking to the receiver
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Failed to open serial port {path}: {reason}")]
    ConnectionFailed { path: String, reason: String },

    #[error("Write to serial port failed: {0}")]
    WriteFailed(String),

    #[error("{command} timed out after {}ms", .elapsed.as_millis())]
    Timeout { command: String, elapsed: Duration },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unexpected response to {command}: '{response}'")]
    UnexpectedResponse { command: String, response: String },

    #[error("Could not find matching input. Make sure you have a '{0}' input defined")]
    UnknownInput(String),

    #[error("No input configured at index {0}")]
    InvalidInput(usize),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
