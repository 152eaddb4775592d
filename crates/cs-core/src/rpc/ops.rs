//! Operations exchanged between terminals, the server and admins
//!
//! Client relationship (server calls the terminal): [`Ping`],
//! [`GetIdentity`], [`AssignIdentity`], [`Shutdown`].
//!
//! Admin relationship (admin calls the server): [`Ping`],
//! [`ListTerminals`], [`GetTerminalInfo`], [`ShutdownTerminal`], plus the
//! server-pushed notifications [`TerminalAdded`], [`TerminalRemoved`] and
//! [`TerminalStatusChanged`].

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use thiserror::Error;

use super::operation::{DeclaredError, Notification, Operation};
use crate::types::TerminalId;

/// Liveness check, answered with `()`
pub struct Ping;

impl Operation for Ping {
    const NAME: &'static str = "ping";
    type Args = ();
    type Output = ();
    type Error = Infallible;
}

/// Ask a terminal for its stored identity
pub struct GetIdentity;

impl Operation for GetIdentity {
    const NAME: &'static str = "getIdentity";
    type Args = ();
    type Output = Option<TerminalId>;
    type Error = Infallible;
}

/// Tell a terminal which identity to store
pub struct AssignIdentity;

impl Operation for AssignIdentity {
    const NAME: &'static str = "assignIdentity";
    type Args = TerminalId;
    type Output = ();
    type Error = Infallible;
}

/// Ask a terminal daemon to stop
pub struct Shutdown;

impl Operation for Shutdown {
    const NAME: &'static str = "shutdown";
    type Args = ();
    type Output = ();
    type Error = Infallible;
}

/// All known terminal ids
pub struct ListTerminals;

impl Operation for ListTerminals {
    const NAME: &'static str = "listTerminals";
    type Args = ();
    type Output = Vec<TerminalId>;
    type Error = Infallible;
}

/// Name and online flag of one terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInfo {
    pub name: String,
    pub online: bool,
}

pub struct GetTerminalInfo;

impl Operation for GetTerminalInfo {
    const NAME: &'static str = "getTerminalInfo";
    type Args = TerminalId;
    type Output = TerminalInfo;
    type Error = AdminError;
}

/// Forward `shutdown` to an online terminal
pub struct ShutdownTerminal;

impl Operation for ShutdownTerminal {
    const NAME: &'static str = "shutdownTerminal";
    type Args = TerminalId;
    type Output = ();
    type Error = AdminError;
}

/// Declared errors of the admin relationship
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminError {
    #[error("No such terminal")]
    NoSuchObject,
    #[error("Terminal is offline")]
    TerminalOffline,
}

impl DeclaredError for AdminError {
    fn code(&self) -> &'static str {
        match self {
            AdminError::NoSuchObject => "NO_SUCH_OBJECT",
            AdminError::TerminalOffline => "TERMINAL_OFFLINE",
        }
    }

    fn from_wire(code: &str, _message: &str) -> Option<Self> {
        match code {
            "NO_SUCH_OBJECT" => Some(AdminError::NoSuchObject),
            "TERMINAL_OFFLINE" => Some(AdminError::TerminalOffline),
            _ => None,
        }
    }
}

pub struct TerminalAdded;

impl Notification for TerminalAdded {
    const NAME: &'static str = "terminalAdded";
    type Args = TerminalId;
}

pub struct TerminalRemoved;

impl Notification for TerminalRemoved {
    const NAME: &'static str = "terminalRemoved";
    type Args = TerminalId;
}

pub struct TerminalStatusChanged;

impl Notification for TerminalStatusChanged {
    const NAME: &'static str = "terminalStatusChanged";
    type Args = (TerminalId, bool);
}
