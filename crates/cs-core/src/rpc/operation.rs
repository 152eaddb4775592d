//! Typed operation descriptors
//!
//! Every remote operation is a zero-sized marker type implementing
//! [`Operation`]. The marker fixes the wire name, argument and result types
//! and the table of declared errors, so both the caller and the registered
//! handler agree on them at compile time.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use thiserror::Error;

/// An expected business outcome an operation may report instead of a result
pub trait DeclaredError: std::error::Error + Send + Sync + Sized + 'static {
    /// Stable code carried on the wire
    fn code(&self) -> &'static str;

    /// Rebuild from a wire code; `None` if the code is not in the table
    fn from_wire(code: &str, message: &str) -> Option<Self>;
}

impl DeclaredError for Infallible {
    fn code(&self) -> &'static str {
        match *self {}
    }

    fn from_wire(_code: &str, _message: &str) -> Option<Self> {
        None
    }
}

/// A named request/response operation
pub trait Operation: Send + Sync + 'static {
    /// Name used for dispatch
    const NAME: &'static str;
    /// Arguments
    type Args: Serialize + DeserializeOwned + Send + 'static;
    /// Successful result
    type Output: Serialize + DeserializeOwned + Send + 'static;
    /// Declared errors
    type Error: DeclaredError;
}

/// A named one-way notification
pub trait Notification: Send + Sync + 'static {
    /// Name used for dispatch
    const NAME: &'static str;
    /// Payload
    type Args: Serialize + DeserializeOwned + Send + 'static;
}

/// What a handler may return instead of a result
#[derive(Debug)]
pub enum HandlerError<E> {
    /// A declared error, reported to the caller by code
    Declared(E),
    /// Anything else; the caller only sees "internal error"
    Internal(anyhow::Error),
}

impl<E> From<anyhow::Error> for HandlerError<E> {
    fn from(e: anyhow::Error) -> Self {
        HandlerError::Internal(e)
    }
}

/// Failure of a remote call as seen by the caller
#[derive(Error, Debug)]
pub enum RpcError<E> {
    /// The callee reported a declared error
    #[error("{0}")]
    Declared(E),

    /// The call could not be carried out
    #[error("Remote call failed: {reason}")]
    Failure { reason: String },

    /// The channel closed before an answer arrived
    #[error("Remote call channel closed")]
    Closed,
}

impl<E> RpcError<E> {
    /// Build a failure
    pub fn failure(reason: impl Into<String>) -> Self {
        RpcError::Failure {
            reason: reason.into(),
        }
    }
}
