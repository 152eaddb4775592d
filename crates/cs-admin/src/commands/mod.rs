//! Console command implementations

mod info;
mod list;
mod shutdown;
mod watch;

pub use info::info_command;
pub use list::list_command;
pub use shutdown::shutdown_command;
pub use watch::watch_command;
