//! Remote-call channel runtime
//!
//! Typed operations ([`operation`]), registered handler tables
//! ([`table`]), the persistent channel itself ([`channel`]), and the
//! operations this system exchanges ([`ops`]).

pub mod channel;
pub mod operation;
pub mod ops;
pub mod table;

pub use channel::RpcChannel;
pub use operation::{DeclaredError, HandlerError, Notification, Operation, RpcError};
pub use ops::{AdminError, TerminalInfo};
pub use table::{OperationTable, RegistrationError};
