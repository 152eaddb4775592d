//! cs-server: ConSys server daemon
//!
//! The server accepts SSH connections from terminal daemons and admin
//! consoles. Terminals are identified over their remote-call channel and
//! tracked in the [`TerminalRegistry`]; admins query the registry through
//! the admin control service and receive its events as notifications.

pub mod admin;
pub mod auth;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;
pub mod store;
pub mod tracker;

pub use registry::{RegistryEvent, TerminalRegistry};
pub use session::{Role, ServerSession};
pub use state::ServerState;
