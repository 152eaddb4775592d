//! Server side of one connected peer
//!
//! A [`ServerSession`] lives from TCP accept to disconnect. It records the
//! authenticated role, the peer's control channel, the client-to-server
//! remote-call link and the reverse channels the server has asked for.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cs_core::control::ControlSender;
use cs_core::error::TransportError;
use cs_core::mux::BoxedStream;
use cs_core::rpc::{OperationTable, RpcChannel};
use cs_core::types::{SessionHandle, TerminalId};
use cs_protocol::ControlMessage;

use crate::registry::RegistryError;

/// What a peer authenticated as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Terminal daemon
    Client,
    /// Admin console
    Admin,
}

type AttachTask = JoinHandle<Result<TerminalId, RegistryError>>;

/// One connected peer
pub struct ServerSession {
    handle: SessionHandle,
    peer: SocketAddr,
    role: OnceLock<Role>,
    handshake_timeout: Duration,
    control: watch::Sender<Option<ControlSender>>,
    rpc: Mutex<Option<RpcChannel>>,
    attach: Mutex<Option<AttachTask>>,
    reverse_seq: AtomicU64,
    reverse: DashMap<u64, oneshot::Sender<BoxedStream>>,
    closed: CancellationToken,
}

impl ServerSession {
    /// New unauthenticated session
    pub fn new(peer: SocketAddr, handshake_timeout: Duration) -> Self {
        let (control, _) = watch::channel(None);
        Self {
            handle: SessionHandle::next(),
            peer,
            role: OnceLock::new(),
            handshake_timeout,
            control,
            rpc: Mutex::new(None),
            attach: Mutex::new(None),
            reverse_seq: AtomicU64::new(1),
            reverse: DashMap::new(),
            closed: CancellationToken::new(),
        }
    }

    /// Process-local handle of this session
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Remote address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Role, once authenticated
    pub fn role(&self) -> Option<Role> {
        self.role.get().copied()
    }

    /// Record the authenticated role; the first one sticks
    pub fn set_role(&self, role: Role) -> bool {
        self.role.set(role).is_ok()
    }

    /// Install the peer's control channel; a second one is refused
    pub fn set_control(&self, sender: ControlSender) -> bool {
        self.control.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(sender.clone());
            true
        })
    }

    /// Install the client-to-server link; a second one is refused
    pub fn set_rpc(&self, channel: RpcChannel) -> bool {
        match self.rpc.lock() {
            Ok(mut slot) if slot.is_none() => {
                *slot = Some(channel);
                true
            }
            _ => false,
        }
    }

    /// The client-to-server link, if open
    pub fn rpc(&self) -> Option<RpcChannel> {
        self.rpc.lock().ok().and_then(|slot| slot.clone())
    }

    /// Remember the identity handshake running for this session
    pub fn set_attach(&self, task: AttachTask) {
        if let Ok(mut slot) = self.attach.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
    }

    /// Take the identity handshake, if one was started
    pub fn take_attach(&self) -> Option<AttachTask> {
        self.attach.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Ask the client for a new server-to-client remote-call channel
    ///
    /// Waits for the control channel up to the handshake timeout, sends
    /// `open-reverse-channel(n)` and resolves once the client has opened
    /// `rpc-s2c-<n>@consys`.
    pub async fn open_reverse_channel(
        &self,
        table: Arc<OperationTable>,
    ) -> Result<RpcChannel, TransportError> {
        let control = self.wait_for_control().await?;

        let sequence_id = self.reverse_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.reverse.insert(sequence_id, tx);

        if let Err(e) = control.send(ControlMessage::OpenReverseChannel { sequence_id }) {
            self.reverse.remove(&sequence_id);
            return Err(e);
        }
        tracing::debug!("{} asked for reverse channel {}", self.handle, sequence_id);

        let stream = tokio::select! {
            stream = rx => stream.map_err(|_| TransportError::SessionClosed),
            _ = self.closed.cancelled() => Err(TransportError::SessionClosed),
        };
        self.reverse.remove(&sequence_id);

        let label = format!("{}/rpc-s2c-{}", self.handle, sequence_id);
        Ok(RpcChannel::spawn(stream?, table, label))
    }

    /// Hand an inbound reverse channel to whoever asked for it
    pub fn complete_reverse(&self, sequence_id: u64, stream: BoxedStream) -> bool {
        match self.reverse.remove(&sequence_id) {
            Some((_, waiter)) => waiter.send(stream).is_ok(),
            None => {
                tracing::warn!(
                    "{} opened reverse channel {} nobody asked for",
                    self.handle,
                    sequence_id
                );
                false
            }
        }
    }

    async fn wait_for_control(&self) -> Result<ControlSender, TransportError> {
        let mut control = self.control.subscribe();
        let waited = tokio::time::timeout(self.handshake_timeout, async {
            tokio::select! {
                sender = control.wait_for(|slot| slot.is_some()) => {
                    sender.ok().and_then(|slot| slot.clone())
                }
                _ = self.closed.cancelled() => None,
            }
        })
        .await;

        match waited {
            Ok(Some(sender)) if !sender.is_closed() => Ok(sender),
            Ok(_) => Err(TransportError::SessionClosed),
            Err(_) => {
                tracing::warn!(
                    "{} opened no control channel within {:?}",
                    self.handle,
                    self.handshake_timeout
                );
                Err(TransportError::ChannelRejected {
                    service: "control@consys".to_string(),
                    reason: "handshake timed out".to_string(),
                })
            }
        }
    }

    /// Tear down every channel of this session
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        if let Some(sender) = self.control.borrow().as_ref() {
            sender.close();
        }
        if let Some(rpc) = self.rpc() {
            rpc.close();
        }
        self.reverse.clear();
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cs_core::control::ControlChannel;
    use cs_core::rpc::ops::Ping;

    fn session(timeout_ms: u64) -> Arc<ServerSession> {
        Arc::new(ServerSession::new(
            "127.0.0.1:50000".parse().unwrap(),
            Duration::from_millis(timeout_ms),
        ))
    }

    fn ping_table() -> Arc<OperationTable> {
        let mut table = OperationTable::new();
        table.register::<Ping, _, _>(|()| async { Ok(()) }).unwrap();
        Arc::new(table)
    }

    #[test]
    fn test_role_is_set_once() {
        let session = session(10);
        assert_eq!(session.role(), None);
        assert!(session.set_role(Role::Client));
        assert!(!session.set_role(Role::Admin));
        assert_eq!(session.role(), Some(Role::Client));
    }

    #[tokio::test]
    async fn test_reverse_channel_without_control_times_out() {
        let session = session(20);
        let err = session.open_reverse_channel(ping_table()).await.err().expect("expected an error");
        assert!(matches!(err, TransportError::ChannelRejected { .. }));
    }

    #[tokio::test]
    async fn test_reverse_channel_is_paired_by_sequence_id() {
        let session = session(1000);

        let (server_end, client_end) = tokio::io::duplex(1024);
        let (sender, _inbound) = ControlChannel::spawn(server_end);
        assert!(session.set_control(sender.clone()));
        assert!(!session.set_control(sender));
        let (_client_control, mut requests) = ControlChannel::spawn(client_end);

        // Stand-in for the client: answer the request with a channel
        let peer = Arc::clone(&session);
        let client = tokio::spawn(async move {
            let Some(ControlMessage::OpenReverseChannel { sequence_id }) = requests.recv().await
            else {
                panic!("expected a reverse channel request");
            };
            let (ours, theirs) = tokio::io::duplex(4096);
            assert!(!peer.complete_reverse(sequence_id + 100, Box::new(tokio::io::duplex(8).0)));
            assert!(peer.complete_reverse(sequence_id, Box::new(ours)));
            RpcChannel::spawn(theirs, ping_table(), "client")
        });

        let channel = session.open_reverse_channel(ping_table()).await.unwrap();
        let client_side = client.await.unwrap();

        channel.call::<Ping>(()).await.unwrap();
        client_side.call::<Ping>(()).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_fails_waiting_reverse_channel() {
        let session = session(1000);
        let (server_end, _client_end) = tokio::io::duplex(1024);
        let (sender, _inbound) = ControlChannel::spawn(server_end);
        session.set_control(sender);

        let waiting = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.open_reverse_channel(ping_table()).await })
        };
        tokio::task::yield_now().await;
        session.close();

        assert!(matches!(
            waiting.await.unwrap(),
            Err(TransportError::SessionClosed)
        ));
        assert!(session.is_closed());
    }
}
