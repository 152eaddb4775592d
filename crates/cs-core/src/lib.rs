//! cs-core: Connection resilience and remote calls for ConSys
//!
//! This crate provides the pieces shared by the terminal daemon, the server
//! and admin consoles: domain types, configuration, the error taxonomy, the
//! reconnect automaton, sub-channel multiplexing, the control and
//! remote-call channel runtimes, the client side of the SSH transport, and a
//! background worker pool.

pub mod automaton;
pub mod config;
pub mod control;
pub mod error;
pub mod mux;
pub mod pool;
pub mod rpc;
pub mod transport;
pub mod types;

pub use automaton::{AutomatonHandle, ConnectError, ReconnectAutomaton};
pub use error::{ConsysError, StateError, TransportError};
pub use types::{ConnectionState, SessionHandle, Terminal, TerminalId, Workstation, WorkstationId};
