//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable identifier of a terminal, allocated by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TerminalId(pub u32);

impl TerminalId {
    /// Create a new terminal ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Name given to a freshly allocated terminal
    pub fn default_name(&self) -> String {
        format!("PC#{}", self.0)
    }
}

impl fmt::Display for TerminalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for TerminalId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Identifier of a workstation (a team seat)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkstationId(pub u32);

impl fmt::Display for WorkstationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle of one live transport session
///
/// Handles are process-local and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

static NEXT_SESSION_HANDLE: AtomicU64 = AtomicU64::new(1);

impl SessionHandle {
    /// Allocate a fresh handle
    pub fn next() -> Self {
        Self(NEXT_SESSION_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// A terminal known to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terminal {
    pub id: TerminalId,
    pub name: String,
    #[serde(default)]
    pub workstation_id: Option<WorkstationId>,
    /// Bound while the terminal is online; never persisted
    #[serde(skip)]
    pub session: Option<SessionHandle>,
}

impl Terminal {
    /// Create an offline terminal with the generated name
    pub fn new(id: TerminalId) -> Self {
        Self {
            id,
            name: id.default_name(),
            workstation_id: None,
            session: None,
        }
    }

    /// Whether a live session is bound
    pub fn is_online(&self) -> bool {
        self.session.is_some()
    }
}

/// A logical seat, bound to at most one terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workstation {
    pub id: WorkstationId,
    pub name: String,
    #[serde(default)]
    pub terminal_id: Option<TerminalId>,
}

/// Lifecycle state of one reconnect automaton
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Idle, no session and no pending attempt
    Disconnected,
    /// A connection attempt is in flight
    Connecting,
    /// Waiting for the backoff timer before the next attempt
    Cooldown,
    /// A live session exists
    Connected,
    /// Disconnect requested while an attempt was in flight
    Cancelled,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Cooldown => write!(f, "cooldown"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Cancelled => write!(f, "cancelled"),
        }
    }
}
