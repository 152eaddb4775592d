//! cs-protocol: Wire formats for ConSys sub-channels
//!
//! This crate defines the byte-level protocols carried over the sub-channels
//! of an authenticated SSH session between a terminal daemon, the server and
//! admin consoles: the length-prefixed remote-call frames, the NUL-terminated
//! control messages, and the allow-listed service names.

pub mod call;
pub mod codec;
pub mod control;
pub mod error;
pub mod message;
pub mod service;

pub use call::CallId;
pub use codec::{RpcCodec, RpcFrame, MAX_FRAME_SIZE};
pub use control::{ControlCodec, ControlMessage};
pub use error::ProtocolError;
pub use message::{MessageType, RpcErrorBody, RpcMessage};
pub use service::{ServiceKind, ServiceName};
