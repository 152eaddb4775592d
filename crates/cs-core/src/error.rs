//! Core error types for ConSys

use cs_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

use crate::automaton::Event;
use crate::types::{ConnectionState, SessionHandle, TerminalId};

/// Top-level error type for the ConSys crates
#[derive(Error, Debug)]
pub enum ConsysError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// State machine violation
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of one transport attempt
///
/// None of these is fatal to a reconnect automaton; they are fed back as
/// `connectionFailed` and retried.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer presented a host key other than the pinned one
    #[error("Invalid host key: presented {presented}, expected {expected}")]
    InvalidHostKey { presented: String, expected: String },

    /// Every applicable authentication strategy was rejected
    #[error("Authentication rejected")]
    Unauthorized,

    /// Private key could not be loaded
    #[error("Private key not found at {path}: {reason}")]
    KeyNotFound { path: PathBuf, reason: String },

    /// TCP or SSH handshake failure
    #[error("Failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    /// The peer refused a sub-channel
    #[error("Channel {service} rejected: {reason}")]
    ChannelRejected { service: String, reason: String },

    /// The session is gone
    #[error("Session closed")]
    SessionClosed,
}

/// Logic bugs or protocol violations in a state machine
///
/// The offending operation is rejected; the process keeps running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// Event fired in a state that has no transition for it
    #[error("No transition from {state} on {event}")]
    InvalidTransition {
        state: ConnectionState,
        event: Event,
    },

    /// A second session claimed a terminal that is already online
    #[error("Terminal {0} is already online")]
    AlreadyOnline(TerminalId),

    /// One session tried to bind a second terminal
    #[error("{0} is already bound to terminal {1}")]
    SessionAlreadyBound(SessionHandle, TerminalId),

    /// A session was unbound but no terminal holds it
    #[error("{0} is not bound to any terminal")]
    NotBound(SessionHandle),

    /// Administrative action that requires an offline terminal
    #[error("Terminal {0} is online")]
    TerminalOnline(TerminalId),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
