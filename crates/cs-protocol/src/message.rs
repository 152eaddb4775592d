//! Message types for the remote-call sub-channel
//!
//! A remote-call channel is a persistent, bidirectional request/response
//! stream. Either peer may issue calls; each call carries a per-channel
//! [`CallId`](crate::CallId) and is answered by exactly one `Answer` or
//! `Error` frame with the same id. Answers may arrive in any order.
//!
//! # Message Flow
//!
//! 1. Caller sends `Call { operation, args }` under a fresh call id
//! 2. Callee looks the operation up in its registered table
//! 3. Callee replies with `Answer { result }` or `Error(..)` under the same id
//! 4. `Notify` frames are one-way and are never answered
//!
//! Arguments and results are opaque byte strings here; the typed layer in
//! `cs-core` encodes them with bincode.

use serde::{Deserialize, Serialize};

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Request expecting an answer
    Call = 0x01,
    /// Successful result of a call
    Answer = 0x02,
    /// Failed result of a call
    Error = 0x03,
    /// One-way notification
    Notify = 0x04,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Call),
            0x02 => Some(Self::Answer),
            0x03 => Some(Self::Error),
            0x04 => Some(Self::Notify),
            _ => None,
        }
    }
}

/// Error reported back to a caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcErrorBody {
    /// The call could not be carried out (unknown operation, handler crash, bad arguments)
    Failure { reason: String },
    /// An expected business outcome listed in the operation's error table
    Declared { code: String, message: String },
}

impl RpcErrorBody {
    /// Reason used when the operation name is not registered
    pub const NO_SUCH_OPERATION: &'static str = "no such operation";

    /// Reason used when a handler fails without a declared error
    pub const INTERNAL_ERROR: &'static str = "internal error";

    /// Build a failure body
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }
}

/// Remote-call messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcMessage {
    /// Invoke a named operation
    Call {
        /// Registered operation name
        operation: String,
        /// Encoded arguments
        args: Vec<u8>,
    },

    /// Successful result
    Answer {
        /// Encoded result
        result: Vec<u8>,
    },

    /// Failed result
    Error(RpcErrorBody),

    /// Invoke a named operation without expecting an answer
    Notify {
        /// Registered operation name
        operation: String,
        /// Encoded arguments
        args: Vec<u8>,
    },
}

impl RpcMessage {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            RpcMessage::Call { .. } => MessageType::Call,
            RpcMessage::Answer { .. } => MessageType::Answer,
            RpcMessage::Error(_) => MessageType::Error,
            RpcMessage::Notify { .. } => MessageType::Notify,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for msg_type in [
            MessageType::Call,
            MessageType::Answer,
            MessageType::Error,
            MessageType::Notify,
        ] {
            let byte = msg_type.as_u8();
            let recovered = MessageType::from_u8(byte).unwrap();
            assert_eq!(recovered, msg_type);
        }
        assert_eq!(MessageType::from_u8(0x00), None);
    }

    #[test]
    fn test_message_type_matches_variant() {
        let call = RpcMessage::Call {
            operation: "ping".to_string(),
            args: vec![],
        };
        assert_eq!(call.message_type(), MessageType::Call);
        assert_eq!(
            RpcMessage::Error(RpcErrorBody::failure("boom")).message_type(),
            MessageType::Error
        );
    }
}
