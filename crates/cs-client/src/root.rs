//! Operations the server may call on a terminal

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cs_core::rpc::ops::{AssignIdentity, GetIdentity, Ping, Shutdown};
use cs_core::rpc::{HandlerError, OperationTable, RegistrationError};

use crate::identity::IdentityStore;

/// Time left for the `shutdown` answer to reach the server
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Build the terminal's root operation table
///
/// `shutdown` is cancelled (after [`SHUTDOWN_GRACE`]) when the server asks
/// the daemon to stop.
pub fn root_table(
    identity: Arc<IdentityStore>,
    shutdown: CancellationToken,
) -> Result<OperationTable, RegistrationError> {
    let mut table = OperationTable::new();

    table.register::<Ping, _, _>(|()| async { Ok(()) })?;

    let store = Arc::clone(&identity);
    table.register::<GetIdentity, _, _>(move |()| {
        let store = Arc::clone(&store);
        async move {
            let id = store.load().await.map_err(anyhow::Error::from)?;
            tracing::debug!("Reporting identity {:?}", id);
            Ok::<_, HandlerError<Infallible>>(id)
        }
    })?;

    table.register::<AssignIdentity, _, _>(move |id| {
        let store = Arc::clone(&identity);
        async move {
            store
                .assign(id)
                .await
                .map_err(|e| HandlerError::Internal(e.into()))
        }
    })?;

    table.register::<Shutdown, _, _>(move |()| {
        let shutdown = shutdown.clone();
        async move {
            tracing::info!("Server requested shutdown");
            tokio::spawn(async move {
                tokio::time::sleep(SHUTDOWN_GRACE).await;
                shutdown.cancel();
            });
            Ok(())
        }
    })?;

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cs_core::rpc::RpcChannel;
    use cs_core::types::TerminalId;

    fn connect(table: OperationTable) -> RpcChannel {
        let (server_side, client_side) = tokio::io::duplex(4096);
        let _ = RpcChannel::spawn(client_side, Arc::new(table), "terminal");
        RpcChannel::spawn(server_side, Arc::new(OperationTable::new()), "server")
    }

    #[tokio::test]
    async fn test_identity_is_reported_and_assigned() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(IdentityStore::new(dir.path().join("identity.json")));
        let server = connect(root_table(Arc::clone(&identity), CancellationToken::new()).unwrap());

        assert_eq!(server.call::<GetIdentity>(()).await.unwrap(), None);
        server.call::<AssignIdentity>(TerminalId::new(3)).await.unwrap();
        assert_eq!(
            server.call::<GetIdentity>(()).await.unwrap(),
            Some(TerminalId::new(3))
        );
        assert_eq!(identity.load().await.unwrap(), Some(TerminalId::new(3)));
        server.call::<Ping>(()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreadable_identity_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, b"garbage").unwrap();
        let server = connect(
            root_table(Arc::new(IdentityStore::new(&path)), CancellationToken::new()).unwrap(),
        );

        assert!(matches!(
            server.call::<GetIdentity>(()).await,
            Err(cs_core::rpc::RpcError::Failure { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_answers_before_stopping() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(IdentityStore::new(dir.path().join("identity.json")));
        let token = CancellationToken::new();
        let server = connect(root_table(identity, token.clone()).unwrap());

        server.call::<Shutdown>(()).await.unwrap();
        assert!(!token.is_cancelled());

        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .unwrap();
    }
}
