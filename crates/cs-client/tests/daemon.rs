//! Daemon against a real server on the loopback interface

use std::sync::Arc;
use std::time::Duration;

use russh_keys::key::KeyPair;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use cs_client::{ClientDaemon, IdentityStore};
use cs_core::config::{BackoffConfig, ClientConfig, ServerConfig};
use cs_core::pool::WorkerPool;
use cs_core::rpc::ops::Shutdown;
use cs_core::types::{ConnectionState, TerminalId};
use cs_server::server::SshServer;
use cs_server::store::MemoryStore;
use cs_server::{RegistryEvent, ServerState};

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    state: Arc<ServerState>,
    config: ClientConfig,
    client_key: Arc<KeyPair>,
    server_cancel: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server_cancel.cancel();
    }
}

async fn harness() -> Harness {
    let host_key = KeyPair::generate_ed25519().unwrap();
    let host_fingerprint = host_key.clone_public_key().unwrap().fingerprint();
    let client_key = KeyPair::generate_ed25519().unwrap();

    let server_config = ServerConfig {
        client_key_fingerprint: client_key.clone_public_key().unwrap().fingerprint(),
        ..ServerConfig::default()
    };
    let state = Arc::new(
        ServerState::with_store(
            server_config,
            Arc::new(MemoryStore::new()),
            Arc::new(WorkerPool::new(1)),
        )
        .await
        .unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let server_cancel = CancellationToken::new();
    let server = SshServer::new(host_key, Arc::clone(&state), server_cancel.clone());
    tokio::spawn(async move { server.serve(listener).await });

    let dir = tempfile::tempdir().unwrap();
    let config = ClientConfig {
        server_address: address,
        username: "consys".to_string(),
        private_key_path: dir.path().join("client_key"),
        server_host_key: host_fingerprint,
        identity_path: dir.path().join("identity.json"),
        backoff: BackoffConfig {
            initial: Duration::from_millis(50),
            max: Duration::from_millis(200),
            multiplier: 1.5,
            jitter: 0.0,
        },
    };

    Harness {
        state,
        config,
        client_key: Arc::new(client_key),
        server_cancel,
        _dir: dir,
    }
}

async fn next_status(events: &mut broadcast::Receiver<RegistryEvent>) -> (TerminalId, bool) {
    loop {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if let RegistryEvent::TerminalStatusChanged { id, online } = event {
            return (id, online);
        }
    }
}

#[tokio::test]
async fn test_daemon_is_identified_and_survives_drop() {
    let h = harness().await;
    let mut events = h.state.registry.subscribe();

    let shutdown = CancellationToken::new();
    let daemon = ClientDaemon::start(&h.config, Arc::clone(&h.client_key), shutdown.clone())
        .await
        .unwrap();
    assert_eq!(daemon.handle().state(), ConnectionState::Connected);

    let id = TerminalId::new(1);
    assert_eq!(next_status(&mut events).await, (id, true));
    let identity = IdentityStore::new(&h.config.identity_path);
    assert_eq!(identity.load().await.unwrap(), Some(id));

    // Server drops the connection; the daemon comes back with the same id
    h.state.tracker.clients().pop().unwrap().close();
    assert_eq!(next_status(&mut events).await, (id, false));
    assert_eq!(next_status(&mut events).await, (id, true));
    assert_eq!(h.state.registry.terminal_ids().await, vec![id]);

    shutdown.cancel();
    timeout(WAIT, daemon.run()).await.unwrap().unwrap();
    assert_eq!(next_status(&mut events).await, (id, false));
}

#[tokio::test]
async fn test_server_shutdown_stops_daemon() {
    let h = harness().await;
    let mut events = h.state.registry.subscribe();

    let shutdown = CancellationToken::new();
    let daemon = ClientDaemon::start(&h.config, Arc::clone(&h.client_key), shutdown.clone())
        .await
        .unwrap();
    let (id, _) = next_status(&mut events).await;

    let link = h.state.registry.client_link(id).await.unwrap();
    link.call::<Shutdown>(()).await.unwrap();

    timeout(WAIT, daemon.run()).await.unwrap().unwrap();
    assert!(shutdown.is_cancelled());
    assert_eq!(next_status(&mut events).await, (id, false));
}

#[tokio::test]
async fn test_daemon_keeps_retrying_against_wrong_host_key() {
    let h = harness().await;
    let mut config = h.config.clone();

    // Nothing listens on this port at first
    let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = placeholder.local_addr().unwrap();
    drop(placeholder);
    config.server_address = address.to_string();

    let shutdown = CancellationToken::new();
    let daemon = ClientDaemon::start(&config, Arc::clone(&h.client_key), shutdown.clone())
        .await
        .unwrap();
    assert_ne!(daemon.handle().state(), ConnectionState::Connected);

    let mut events = h.state.registry.subscribe();
    let listener = TcpListener::bind(address).await.unwrap();
    let server = SshServer::new(
        KeyPair::generate_ed25519().unwrap(),
        Arc::clone(&h.state),
        h.server_cancel.clone(),
    );
    tokio::spawn(async move { server.serve(listener).await });

    // The new server presents a different host key, so every attempt fails
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(events.try_recv().is_err());
    assert_ne!(daemon.handle().state(), ConnectionState::Connected);

    shutdown.cancel();
    timeout(WAIT, daemon.run()).await.unwrap().unwrap();
}
