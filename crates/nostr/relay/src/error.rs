//! Relay error types

use crate::filter::FilterError;
use crate::protocol::MessageError;
use crate::session::{TransportError, TransportHandle};
use crate::validation::ValidationError;
use thiserror::Error;

/// Relay error type
#[derive(Error, Debug)]
pub enum RelayError {
    /// Malformed REQ filter
    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    /// Event or subscription id failed validation
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Wire message did not have the expected structure
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// Transport refused a frame
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A session already exists for this transport handle
    #[error("duplicate session for transport {0}")]
    DuplicateSession(TransportHandle),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The kernel thread is gone
    #[error("relay kernel stopped")]
    KernelStopped,
}

/// Relay result type
pub type Result<T> = std::result::Result<T, RelayError>;
