//! Admin control service
//!
//! Operations answered on the admin remote-call channel, and the task that
//! pushes registry events to a connected admin as notifications.

use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;

use cs_core::rpc::ops::{
    GetTerminalInfo, ListTerminals, Ping, Shutdown, ShutdownTerminal, TerminalAdded,
    TerminalRemoved, TerminalStatusChanged,
};
use cs_core::rpc::{HandlerError, OperationTable, RegistrationError, RpcChannel, RpcError};

use crate::registry::{RegistryEvent, TerminalRegistry};

/// Build the table of operations an admin may call
pub fn service_table(registry: Arc<TerminalRegistry>) -> Result<OperationTable, RegistrationError> {
    let mut table = OperationTable::new();

    table.register::<Ping, _, _>(|()| async { Ok(()) })?;

    let list = Arc::clone(&registry);
    table.register::<ListTerminals, _, _>(move |()| {
        let registry = Arc::clone(&list);
        async move { Ok(registry.terminal_ids().await) }
    })?;

    let info = Arc::clone(&registry);
    table.register::<GetTerminalInfo, _, _>(move |id| {
        let registry = Arc::clone(&info);
        async move {
            registry
                .terminal_info(id)
                .await
                .map_err(HandlerError::Declared)
        }
    })?;

    let shutdown = registry;
    table.register::<ShutdownTerminal, _, _>(move |id| {
        let registry = Arc::clone(&shutdown);
        async move {
            let link = registry
                .client_link(id)
                .await
                .map_err(HandlerError::Declared)?;
            tracing::info!("Shutting down terminal {}", id);
            match link.call::<Shutdown>(()).await {
                Ok(()) => Ok(()),
                // The terminal may go away before its answer is flushed
                Err(RpcError::Closed) => {
                    tracing::debug!("Terminal {} closed its link while shutting down", id);
                    Ok(())
                }
                Err(e) => Err(HandlerError::Internal(anyhow::anyhow!(
                    "terminal {} refused shutdown: {}",
                    id,
                    e
                ))),
            }
        }
    })?;

    Ok(table)
}

/// Build the table answered on a terminal's client-to-server channel
pub fn terminal_table() -> Result<OperationTable, RegistrationError> {
    let mut table = OperationTable::new();
    table.register::<Ping, _, _>(|()| async { Ok::<_, HandlerError<Infallible>>(()) })?;
    Ok(table)
}

/// Forward registry events to one admin until its channel closes
pub async fn forward_events(mut events: broadcast::Receiver<RegistryEvent>, admin: RpcChannel) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = admin.closed() => break,
        };

        let sent = match event {
            Ok(RegistryEvent::TerminalAdded(id)) => admin.notify::<TerminalAdded>(id),
            Ok(RegistryEvent::TerminalRemoved(id)) => admin.notify::<TerminalRemoved>(id),
            Ok(RegistryEvent::TerminalStatusChanged { id, online }) => {
                admin.notify::<TerminalStatusChanged>((id, online))
            }
            Ok(RegistryEvent::WorkstationAdded(_) | RegistryEvent::WorkstationRemoved(_)) => Ok(()),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("Admin notifications lagged, {} events dropped", missed);
                Ok(())
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if sent.is_err() {
            break;
        }
    }
    tracing::debug!("Stopped forwarding registry events");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Snapshot};
    use cs_core::rpc::AdminError;
    use cs_core::types::{Terminal, TerminalId};
    use tokio::sync::mpsc;

    async fn registry_with(ids: &[u32]) -> Arc<TerminalRegistry> {
        let store = MemoryStore::with_snapshot(Snapshot {
            terminals: ids.iter().map(|id| Terminal::new(TerminalId::new(*id))).collect(),
            workstations: Vec::new(),
        });
        Arc::new(TerminalRegistry::load(Arc::new(store)).await.unwrap())
    }

    fn admin_pair(registry: Arc<TerminalRegistry>, admin_table: OperationTable) -> (RpcChannel, RpcChannel) {
        let (a, b) = tokio::io::duplex(4096);
        let server = RpcChannel::spawn(a, Arc::new(service_table(registry).unwrap()), "server");
        let admin = RpcChannel::spawn(b, Arc::new(admin_table), "admin");
        (server, admin)
    }

    #[tokio::test]
    async fn test_list_and_info() {
        let registry = registry_with(&[1, 2]).await;
        let (_server, admin) = admin_pair(registry, OperationTable::new());

        admin.call::<Ping>(()).await.unwrap();
        assert_eq!(
            admin.call::<ListTerminals>(()).await.unwrap(),
            vec![TerminalId::new(1), TerminalId::new(2)]
        );

        let info = admin.call::<GetTerminalInfo>(TerminalId::new(2)).await.unwrap();
        assert_eq!(info.name, "PC#2");
        assert!(!info.online);
    }

    #[tokio::test]
    async fn test_info_for_unknown_terminal() {
        let registry = registry_with(&[1]).await;
        let (_server, admin) = admin_pair(registry, OperationTable::new());

        let err = admin
            .call::<GetTerminalInfo>(TerminalId::new(99))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Declared(AdminError::NoSuchObject)));
    }

    #[tokio::test]
    async fn test_shutdown_of_offline_terminal() {
        let registry = registry_with(&[1]).await;
        let (_server, admin) = admin_pair(registry, OperationTable::new());

        let err = admin
            .call::<ShutdownTerminal>(TerminalId::new(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Declared(AdminError::TerminalOffline)));

        let err = admin
            .call::<ShutdownTerminal>(TerminalId::new(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Declared(AdminError::NoSuchObject)));
    }

    #[tokio::test]
    async fn test_events_become_notifications() {
        let registry = registry_with(&[1]).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut admin_table = OperationTable::new();
        let removed = tx.clone();
        admin_table
            .register_notification::<TerminalRemoved, _, _>(move |id| {
                let _ = removed.send(format!("removed {}", id));
                async {}
            })
            .unwrap();
        admin_table
            .register_notification::<TerminalAdded, _, _>(move |id| {
                let _ = tx.send(format!("added {}", id));
                async {}
            })
            .unwrap();

        let (server, _admin) = admin_pair(Arc::clone(&registry), admin_table);
        tokio::spawn(forward_events(registry.subscribe(), server));

        registry.remove_terminal(TerminalId::new(1)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "removed 1");
    }
}
