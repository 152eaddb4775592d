//! Registered operation tables
//!
//! The receiving side of a remote-call channel dispatches by name through an
//! [`OperationTable`]. Names are checked for uniqueness at registration time;
//! an unknown name at dispatch time is answered with
//! `Failure { reason: "no such operation" }`.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;

use cs_protocol::RpcErrorBody;

use super::operation::{DeclaredError, HandlerError, Notification, Operation};

type CallHandler =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, RpcErrorBody>> + Send + Sync>;
type NotifyHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Registration failures
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("Operation {0} registered twice")]
    Duplicate(&'static str),
}

/// Name-to-handler table for one side of a remote-call relationship
#[derive(Default, Clone)]
pub struct OperationTable {
    calls: HashMap<&'static str, CallHandler>,
    notifications: HashMap<&'static str, NotifyHandler>,
}

impl OperationTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for an operation
    pub fn register<O, F, Fut>(&mut self, handler: F) -> Result<(), RegistrationError>
    where
        O: Operation,
        F: Fn(O::Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O::Output, HandlerError<O::Error>>> + Send + 'static,
    {
        if self.calls.contains_key(O::NAME) || self.notifications.contains_key(O::NAME) {
            return Err(RegistrationError::Duplicate(O::NAME));
        }

        let handler = Arc::new(handler);
        let wrapped: CallHandler =
            Arc::new(move |raw: Vec<u8>| run_call::<O, F, Fut>(Arc::clone(&handler), raw).boxed());

        self.calls.insert(O::NAME, wrapped);
        Ok(())
    }

    /// Register the handler for a notification
    pub fn register_notification<N, F, Fut>(&mut self, handler: F) -> Result<(), RegistrationError>
    where
        N: Notification,
        F: Fn(N::Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.calls.contains_key(N::NAME) || self.notifications.contains_key(N::NAME) {
            return Err(RegistrationError::Duplicate(N::NAME));
        }

        let handler = Arc::new(handler);
        let wrapped: NotifyHandler = Arc::new(move |raw: Vec<u8>| {
            run_notification::<N, F, Fut>(Arc::clone(&handler), raw).boxed()
        });

        self.notifications.insert(N::NAME, wrapped);
        Ok(())
    }

    /// Whether a call handler exists for `name`
    pub fn contains(&self, name: &str) -> bool {
        self.calls.contains_key(name)
    }

    /// Run the handler for an incoming call
    pub fn dispatch(
        &self,
        name: &str,
        args: Vec<u8>,
    ) -> BoxFuture<'static, Result<Vec<u8>, RpcErrorBody>> {
        match self.calls.get(name) {
            Some(handler) => handler(args),
            None => {
                tracing::warn!("Call to unknown operation {:?}", name);
                futures::future::ready(Err(RpcErrorBody::failure(
                    RpcErrorBody::NO_SUCH_OPERATION,
                )))
                .boxed()
            }
        }
    }

    /// Run the handler for an incoming notification, if any
    pub fn dispatch_notification(&self, name: &str, args: Vec<u8>) -> Option<BoxFuture<'static, ()>> {
        match self.notifications.get(name) {
            Some(handler) => Some(handler(args)),
            None => {
                tracing::debug!("Dropping unhandled notification {:?}", name);
                None
            }
        }
    }
}

async fn run_call<O, F, Fut>(handler: Arc<F>, raw: Vec<u8>) -> Result<Vec<u8>, RpcErrorBody>
where
    O: Operation,
    F: Fn(O::Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O::Output, HandlerError<O::Error>>> + Send + 'static,
{
    let args: O::Args = match bincode::deserialize(&raw) {
        Ok(args) => args,
        Err(e) => {
            tracing::warn!("Bad arguments for {}: {}", O::NAME, e);
            return Err(RpcErrorBody::failure(format!("invalid arguments: {}", e)));
        }
    };

    match AssertUnwindSafe(handler(args)).catch_unwind().await {
        Ok(Ok(output)) => bincode::serialize(&output).map_err(|e| {
            tracing::error!("Failed to encode result of {}: {}", O::NAME, e);
            RpcErrorBody::failure(RpcErrorBody::INTERNAL_ERROR)
        }),
        Ok(Err(HandlerError::Declared(e))) => Err(RpcErrorBody::Declared {
            code: e.code().to_string(),
            message: e.to_string(),
        }),
        Ok(Err(HandlerError::Internal(e))) => {
            tracing::error!("Handler for {} failed: {:#}", O::NAME, e);
            Err(RpcErrorBody::failure(RpcErrorBody::INTERNAL_ERROR))
        }
        Err(_) => {
            tracing::error!("Handler for {} panicked", O::NAME);
            Err(RpcErrorBody::failure(RpcErrorBody::INTERNAL_ERROR))
        }
    }
}

async fn run_notification<N, F, Fut>(handler: Arc<F>, raw: Vec<u8>)
where
    N: Notification,
    F: Fn(N::Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    match bincode::deserialize::<N::Args>(&raw) {
        Ok(args) => {
            if AssertUnwindSafe(handler(args)).catch_unwind().await.is_err() {
                tracing::error!("Notification handler for {} panicked", N::NAME);
            }
        }
        Err(e) => tracing::warn!("Bad payload for {}: {}", N::NAME, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::ops::{GetTerminalInfo, Ping, TerminalAdded};
    use crate::rpc::{AdminError, TerminalInfo};
    use crate::types::TerminalId;

    fn table() -> OperationTable {
        let mut table = OperationTable::new();
        table.register::<Ping, _, _>(|()| async { Ok(()) }).unwrap();
        table
            .register::<GetTerminalInfo, _, _>(|id: TerminalId| async move {
                match id.as_u32() {
                    1 => Ok(TerminalInfo {
                        name: "PC#1".to_string(),
                        online: true,
                    }),
                    2 => Err(HandlerError::Internal(anyhow::anyhow!("disk on fire"))),
                    3 => panic!("handler bug"),
                    _ => Err(HandlerError::Declared(AdminError::NoSuchObject)),
                }
            })
            .unwrap();
        table
    }

    async fn call_info(table: &OperationTable, id: u32) -> Result<Vec<u8>, RpcErrorBody> {
        table
            .dispatch(
                GetTerminalInfo::NAME,
                bincode::serialize(&TerminalId::new(id)).unwrap(),
            )
            .await
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut table = table();
        let result = table.register::<Ping, _, _>(|()| async { Ok(()) });
        assert_eq!(result, Err(RegistrationError::Duplicate("ping")));
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let result = table().dispatch("reboot", vec![]).await;
        assert_eq!(result, Err(RpcErrorBody::failure("no such operation")));
    }

    #[tokio::test]
    async fn test_success_and_declared_error() {
        let table = table();

        let raw = call_info(&table, 1).await.unwrap();
        let info: TerminalInfo = bincode::deserialize(&raw).unwrap();
        assert!(info.online);

        let err = call_info(&table, 99).await.unwrap_err();
        assert!(matches!(err, RpcErrorBody::Declared { ref code, .. } if code == "NO_SUCH_OBJECT"));
    }

    #[tokio::test]
    async fn test_internal_errors_are_opaque() {
        let table = table();
        assert_eq!(
            call_info(&table, 2).await,
            Err(RpcErrorBody::failure("internal error"))
        );
        assert_eq!(
            call_info(&table, 3).await,
            Err(RpcErrorBody::failure("internal error"))
        );
    }

    #[tokio::test]
    async fn test_bad_arguments() {
        let result = table().dispatch(GetTerminalInfo::NAME, vec![1]).await;
        assert!(matches!(result, Err(RpcErrorBody::Failure { .. })));
    }

    #[tokio::test]
    async fn test_notification_dispatch() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut table = OperationTable::new();
        table
            .register_notification::<TerminalAdded, _, _>(move |id| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(id);
                }
            })
            .unwrap();

        let raw = bincode::serialize(&TerminalId::new(5)).unwrap();
        table
            .dispatch_notification(TerminalAdded::NAME, raw)
            .unwrap()
            .await;
        assert_eq!(rx.recv().await, Some(TerminalId::new(5)));
        assert!(table.dispatch_notification("unknown", vec![]).is_none());
    }
}
