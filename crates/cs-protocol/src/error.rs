//! Protocol error types

use thiserror::Error;

/// Errors that can occur while framing or parsing sub-channel traffic
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown message type
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Frame body too short to hold its kind and call id
    #[error("Frame body of {0} bytes is shorter than its prefix")]
    Truncated(usize),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Kind byte does not match the payload
    #[error("Frame kind says {header:?} but payload is {payload:?}")]
    TypeMismatch {
        header: crate::message::MessageType,
        payload: crate::message::MessageType,
    },

    /// A control message could not be parsed
    #[error("Malformed control message: {0}")]
    MalformedControl(String),

    /// A control message carried a tag this peer does not know
    #[error("Unknown control tag: {0}")]
    UnknownControlTag(String),

    /// A sub-channel was requested for a service outside the allow-list
    #[error("Service not allowed: {0}")]
    DisallowedService(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
