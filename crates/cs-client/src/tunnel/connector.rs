//! Outbound connection to the server
//!
//! One attempt connects the SSH transport, opens the control channel and
//! the remote-call channel, and starts answering reverse-channel requests.
//! The reconnect automaton owns the resulting [`TerminalSession`].

use std::sync::Arc;

use async_trait::async_trait;
use russh_keys::key::KeyPair;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use cs_core::automaton::{Connector, DisconnectNotifier, LiveSession};
use cs_core::config::ClientConfig;
use cs_core::control::{ControlChannel, ControlSender};
use cs_core::error::TransportError;
use cs_core::mux::open_channel;
use cs_core::rpc::{OperationTable, RpcChannel};
use cs_core::transport::{Credentials, Secret, TransportSession};
use cs_protocol::{ControlMessage, ServiceName};

/// Establishes terminal sessions to the server
pub struct TerminalConnector {
    /// Server address (`host:port`)
    address: String,
    /// Pinned server host key fingerprint
    host_key: String,
    /// Credentials for public-key authentication
    credentials: Credentials,
    /// Operations answered on every channel the terminal opens
    table: Arc<OperationTable>,
}

impl TerminalConnector {
    /// Create a connector from the daemon configuration and a loaded key
    pub fn new(config: &ClientConfig, key: Arc<KeyPair>, table: Arc<OperationTable>) -> Self {
        Self {
            address: config.server_address.clone(),
            host_key: config.server_host_key.clone(),
            credentials: Credentials {
                username: config.username.clone(),
                secret: Secret::PrivateKey(key),
            },
            table,
        }
    }

    /// Server address this connector dials
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Connector for TerminalConnector {
    type Session = TerminalSession;

    async fn connect(
        &self,
        on_disconnect: DisconnectNotifier,
    ) -> Result<TerminalSession, TransportError> {
        let transport = Arc::new(
            TransportSession::connect(&self.address, &self.host_key, &self.credentials, on_disconnect)
                .await?,
        );

        // Control first, so the server can ask for reverse channels as soon
        // as it has identified us
        let opened = open_channel(&*transport, ServiceName::Control, ControlChannel::spawn).await;
        let (control, requests) = match opened {
            Ok(pair) => pair,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };

        let reverse = tokio::spawn(answer_reverse_requests(
            Arc::clone(&transport),
            requests,
            Arc::clone(&self.table),
        ));

        let table = Arc::clone(&self.table);
        let opened = open_channel(&*transport, ServiceName::Rpc, move |stream| {
            RpcChannel::spawn(stream, table, "rpc-c2s")
        })
        .await;
        let rpc = match opened {
            Ok(rpc) => rpc,
            Err(e) => {
                reverse.abort();
                control.close();
                transport.close().await;
                return Err(e);
            }
        };

        tracing::info!("Connected to server at {}", self.address);
        Ok(TerminalSession {
            transport,
            control,
            rpc,
            reverse,
        })
    }
}

/// Open `rpc-s2c-<n>` for every `open-reverse-channel(n)` the server sends
async fn answer_reverse_requests(
    transport: Arc<TransportSession>,
    mut requests: mpsc::UnboundedReceiver<ControlMessage>,
    table: Arc<OperationTable>,
) {
    while let Some(message) = requests.recv().await {
        match message {
            ControlMessage::OpenReverseChannel { sequence_id } => {
                let service = ServiceName::ReverseRpc(sequence_id);
                let table = Arc::clone(&table);
                let label = service.to_string();
                let opened = open_channel(&*transport, service, move |stream| {
                    RpcChannel::spawn(stream, table, label)
                })
                .await;
                if opened.is_ok() {
                    tracing::debug!("Opened reverse channel {}", sequence_id);
                }
            }
        }
    }
    tracing::debug!("Control channel ended");
}

/// A connected terminal session
pub struct TerminalSession {
    transport: Arc<TransportSession>,
    control: ControlSender,
    rpc: RpcChannel,
    reverse: JoinHandle<()>,
}

impl TerminalSession {
    /// The terminal's remote-call channel
    pub fn rpc(&self) -> &RpcChannel {
        &self.rpc
    }

    /// Whether the transport has gone away
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }
}

#[async_trait]
impl LiveSession for TerminalSession {
    async fn close(&self) {
        self.reverse.abort();
        self.rpc.close();
        self.control.close();
        self.transport.close().await;
    }
}
