//! Connection to the server

mod connector;

pub use connector::{TerminalConnector, TerminalSession};
