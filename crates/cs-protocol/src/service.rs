//! Sub-channel service names
//!
//! Every sub-channel is an SSH `session` channel followed by a subsystem
//! request naming one of the fixed services below. Anything else is
//! rejected by the accepting side.

use std::fmt;

use crate::error::ProtocolError;

const CONTROL: &str = "control@consys";
const RPC: &str = "rpc-c2s@consys";
const ADMIN_RPC: &str = "admin-rpc@consys";
const REVERSE_PREFIX: &str = "rpc-s2c-";
const REVERSE_SUFFIX: &str = "@consys";

/// Fixed service kinds, without per-channel parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Control,
    Rpc,
    ReverseRpc,
    AdminRpc,
}

/// A service name as carried in a subsystem request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceName {
    /// Long-lived signaling channel (client opens, one per session)
    Control,
    /// Client-to-server remote calls
    Rpc,
    /// Server-to-client remote calls, opened by the client on request
    ReverseRpc(u64),
    /// Admin-to-server remote calls
    AdminRpc,
}

impl ServiceName {
    /// Parse a subsystem name, rejecting anything outside the allow-list
    pub fn parse(name: &str) -> Result<Self, ProtocolError> {
        match name {
            CONTROL => Ok(ServiceName::Control),
            RPC => Ok(ServiceName::Rpc),
            ADMIN_RPC => Ok(ServiceName::AdminRpc),
            other => other
                .strip_prefix(REVERSE_PREFIX)
                .and_then(|rest| rest.strip_suffix(REVERSE_SUFFIX))
                .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|digits| digits.parse::<u64>().ok())
                .map(ServiceName::ReverseRpc)
                .ok_or_else(|| ProtocolError::DisallowedService(other.to_string())),
        }
    }

    /// Wire form of this name
    pub fn as_str(&self) -> String {
        match self {
            ServiceName::Control => CONTROL.to_string(),
            ServiceName::Rpc => RPC.to_string(),
            ServiceName::AdminRpc => ADMIN_RPC.to_string(),
            ServiceName::ReverseRpc(n) => format!("{}{}{}", REVERSE_PREFIX, n, REVERSE_SUFFIX),
        }
    }

    /// Kind of this service
    pub fn kind(&self) -> ServiceKind {
        match self {
            ServiceName::Control => ServiceKind::Control,
            ServiceName::Rpc => ServiceKind::Rpc,
            ServiceName::ReverseRpc(_) => ServiceKind::ReverseRpc,
            ServiceName::AdminRpc => ServiceKind::AdminRpc,
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}
