//! SSH server implementation

mod handler;
mod listener;

pub use handler::{ssh_config, ConnectionHandler};
pub use listener::{load_or_generate_host_key, SshServer};
