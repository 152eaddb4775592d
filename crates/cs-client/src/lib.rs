//! cs-client: ConSys terminal daemon
//!
//! The daemon runs on every contest workstation and keeps one
//! authenticated connection to the server alive through the reconnect
//! automaton. It answers the server's identity handshake from a small
//! persisted identity file and opens reverse channels on request.

pub mod daemon;
pub mod identity;
pub mod root;
pub mod tunnel;

pub use daemon::{load_or_generate_client_key, ClientDaemon};
pub use identity::IdentityStore;
