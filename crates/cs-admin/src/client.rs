//! Typed client for the admin control service
//!
//! Wraps the `admin-rpc@consys` channel. Server pushes arrive as
//! [`AdminNotification`]s on a broadcast channel so several views can
//! follow the terminal list at once.

use std::convert::Infallible;
use std::sync::Arc;

use tokio::sync::broadcast;

use cs_core::error::TransportError;
use cs_core::mux::{open_channel, SubChannelOpener};
use cs_core::rpc::ops::{
    GetTerminalInfo, ListTerminals, Ping, ShutdownTerminal, TerminalAdded, TerminalRemoved,
    TerminalStatusChanged,
};
use cs_core::rpc::{AdminError, OperationTable, RegistrationError, RpcChannel, RpcError, TerminalInfo};
use cs_core::types::TerminalId;
use cs_protocol::ServiceName;

/// Channel capacity for pushed notifications
const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;

/// A lifecycle event pushed by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminNotification {
    TerminalAdded(TerminalId),
    TerminalRemoved(TerminalId),
    TerminalStatusChanged { id: TerminalId, online: bool },
}

/// Create the sender that notification tables publish into
pub fn notification_channel() -> broadcast::Sender<AdminNotification> {
    broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY).0
}

/// Handlers for the three notifications, publishing into `events`
pub fn notification_table(
    events: broadcast::Sender<AdminNotification>,
) -> Result<OperationTable, RegistrationError> {
    let mut table = OperationTable::new();

    let tx = events.clone();
    table.register_notification::<TerminalAdded, _, _>(move |id| {
        let _ = tx.send(AdminNotification::TerminalAdded(id));
        async {}
    })?;

    let tx = events.clone();
    table.register_notification::<TerminalRemoved, _, _>(move |id| {
        let _ = tx.send(AdminNotification::TerminalRemoved(id));
        async {}
    })?;

    table.register_notification::<TerminalStatusChanged, _, _>(move |(id, online)| {
        let _ = events.send(AdminNotification::TerminalStatusChanged { id, online });
        async {}
    })?;

    Ok(table)
}

/// Admin side of the admin control service
#[derive(Clone)]
pub struct AdminClient {
    channel: RpcChannel,
    events: broadcast::Sender<AdminNotification>,
}

impl AdminClient {
    /// Open the admin channel on an authenticated session
    pub async fn open<O>(
        opener: &O,
        events: broadcast::Sender<AdminNotification>,
    ) -> Result<Self, TransportError>
    where
        O: SubChannelOpener + ?Sized,
    {
        let table = notification_table(events.clone()).map_err(|e| TransportError::ChannelRejected {
            service: ServiceName::AdminRpc.to_string(),
            reason: e.to_string(),
        })?;
        let table = Arc::new(table);
        let channel = open_channel(opener, ServiceName::AdminRpc, move |stream| {
            RpcChannel::spawn(stream, table, "admin-rpc")
        })
        .await?;
        Ok(Self::with_channel(channel, events))
    }

    /// Wrap a channel already wired to a notification table
    pub fn with_channel(channel: RpcChannel, events: broadcast::Sender<AdminNotification>) -> Self {
        Self { channel, events }
    }

    pub async fn ping(&self) -> Result<(), RpcError<Infallible>> {
        self.channel.call::<Ping>(()).await
    }

    pub async fn list_terminals(&self) -> Result<Vec<TerminalId>, RpcError<Infallible>> {
        self.channel.call::<ListTerminals>(()).await
    }

    pub async fn terminal_info(&self, id: TerminalId) -> Result<TerminalInfo, RpcError<AdminError>> {
        self.channel.call::<GetTerminalInfo>(id).await
    }

    /// Ask an online terminal's daemon to stop
    pub async fn shutdown_terminal(&self, id: TerminalId) -> Result<(), RpcError<AdminError>> {
        self.channel.call::<ShutdownTerminal>(id).await
    }

    /// Subscribe to server pushes
    ///
    /// Only events arriving after the call are delivered.
    pub fn notifications(&self) -> broadcast::Receiver<AdminNotification> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    pub fn close(&self) {
        self.channel.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cs_core::rpc::HandlerError;
    use std::time::Duration;

    /// A fake server answering the admin operations for terminals 1 (online) and 2
    fn fake_server(stream: tokio::io::DuplexStream) -> RpcChannel {
        let mut table = OperationTable::new();
        table.register::<Ping, _, _>(|()| async { Ok(()) }).unwrap();
        table
            .register::<ListTerminals, _, _>(|()| async {
                Ok(vec![TerminalId::new(1), TerminalId::new(2)])
            })
            .unwrap();
        table
            .register::<GetTerminalInfo, _, _>(|id: TerminalId| async move {
                match id.as_u32() {
                    1 => Ok(TerminalInfo {
                        name: "PC#1".to_string(),
                        online: true,
                    }),
                    2 => Ok(TerminalInfo {
                        name: "PC#2".to_string(),
                        online: false,
                    }),
                    _ => Err(HandlerError::Declared(AdminError::NoSuchObject)),
                }
            })
            .unwrap();
        table
            .register::<ShutdownTerminal, _, _>(|id: TerminalId| async move {
                match id.as_u32() {
                    1 => Ok(()),
                    2 => Err(HandlerError::Declared(AdminError::TerminalOffline)),
                    _ => Err(HandlerError::Declared(AdminError::NoSuchObject)),
                }
            })
            .unwrap();
        RpcChannel::spawn(stream, Arc::new(table), "server")
    }

    fn connect() -> (AdminClient, RpcChannel) {
        let (admin_side, server_side) = tokio::io::duplex(4096);
        let events = notification_channel();
        let table = Arc::new(notification_table(events.clone()).unwrap());
        let channel = RpcChannel::spawn(admin_side, table, "admin");
        (AdminClient::with_channel(channel, events), fake_server(server_side))
    }

    #[tokio::test]
    async fn test_queries() {
        let (client, _server) = connect();

        client.ping().await.unwrap();
        assert_eq!(
            client.list_terminals().await.unwrap(),
            vec![TerminalId::new(1), TerminalId::new(2)]
        );
        assert!(client.terminal_info(TerminalId::new(1)).await.unwrap().online);
        assert!(matches!(
            client.terminal_info(TerminalId::new(5)).await,
            Err(RpcError::Declared(AdminError::NoSuchObject))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_errors() {
        let (client, _server) = connect();

        client.shutdown_terminal(TerminalId::new(1)).await.unwrap();
        assert!(matches!(
            client.shutdown_terminal(TerminalId::new(2)).await,
            Err(RpcError::Declared(AdminError::TerminalOffline))
        ));
    }

    #[tokio::test]
    async fn test_notifications_are_broadcast() {
        let (client, server) = connect();
        let mut first = client.notifications();
        let mut second = client.notifications();

        server.notify::<TerminalAdded>(TerminalId::new(4)).unwrap();
        server
            .notify::<TerminalStatusChanged>((TerminalId::new(4), true))
            .unwrap();

        for rx in [&mut first, &mut second] {
            let added = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(added, AdminNotification::TerminalAdded(TerminalId::new(4)));
            let changed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(
                changed,
                AdminNotification::TerminalStatusChanged {
                    id: TerminalId::new(4),
                    online: true
                }
            );
        }
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let (client, server) = connect();
        server.close();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !client.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(client.ping().await, Err(RpcError::Closed)));
    }
}
