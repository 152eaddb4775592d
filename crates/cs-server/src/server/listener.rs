//! SSH server listener
//!
//! Accepts incoming connections and runs one handler per peer.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::Disconnect;
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::server::handler::{ssh_config, ConnectionHandler};
use crate::session::ServerSession;
use crate::state::ServerState;

/// How long a disconnected peer gets to flush before the task is left behind
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// SSH server that listens for incoming connections
pub struct SshServer {
    /// russh configuration (host key, timings)
    config: Arc<russh::server::Config>,
    /// Shared server state
    state: Arc<ServerState>,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
}

impl SshServer {
    /// Create a new SSH server
    pub fn new(host_key: KeyPair, state: Arc<ServerState>, cancel: CancellationToken) -> Self {
        Self {
            config: ssh_config(host_key),
            state,
            cancel,
        }
    }

    /// Bind `bind_addr` and serve until cancelled
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until cancelled
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("SSH server listening on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("SSH server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => tracing::error!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::info!("New connection from {}", peer_addr);

        let config = Arc::clone(&self.config);
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let session = Arc::new(ServerSession::new(peer_addr, state.config.handshake_timeout));
            let handler = ConnectionHandler::new(Arc::clone(&state), Arc::clone(&session));

            match run_connection(config, socket, handler, &session, &cancel).await {
                Ok(()) => tracing::info!("Connection from {} closed", peer_addr),
                Err(e) => tracing::warn!("Connection from {} closed with error: {}", peer_addr, e),
            }

            state.session_closed(&session).await;
        });
    }
}

/// Drive one SSH connection until the peer leaves, the session is closed
/// or the server shuts down
///
/// In the last two cases the connection is ended with an SSH disconnect so
/// the peer notices and can reconnect.
async fn run_connection(
    config: Arc<russh::server::Config>,
    socket: TcpStream,
    handler: ConnectionHandler,
    session: &ServerSession,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut running = tokio::select! {
        running = russh::server::run_stream(config, socket, handler) => running?,
        _ = cancel.cancelled() => return Ok(()),
    };
    let ssh = running.handle();

    let reason = tokio::select! {
        result = &mut running => return result,
        _ = cancel.cancelled() => "server shutting down",
        _ = session.closed() => "session closed by server",
    };

    tracing::info!("Dropping connection from {}: {}", session.peer(), reason);
    if ssh
        .disconnect(Disconnect::ByApplication, reason.to_string(), String::new())
        .await
        .is_err()
    {
        // Connection task already finished
        return Ok(());
    }

    match tokio::time::timeout(DISCONNECT_GRACE, &mut running).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                "Connection from {} did not end within {:?} of disconnect",
                session.peer(),
                DISCONNECT_GRACE
            );
            Ok(())
        }
    }
}

/// Load the host key, generating and saving one on first start
pub async fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        tracing::info!("Loading host key from {:?}", path);
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {:?}", path))?;
        return Ok(key);
    }

    tracing::info!("Generating new host key at {:?}", path);

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let key = KeyPair::generate_ed25519()
        .ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key"))?;

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("Failed to encode host key")?;
    tokio::fs::write(path, &pem)
        .await
        .with_context(|| format!("Failed to write host key to {:?}", path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("Failed to restrict permissions on {:?}", path))?;
    }

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_host_key_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("host_key");

        let generated = load_or_generate_host_key(&path).await.unwrap();
        assert!(path.exists());

        let loaded = load_or_generate_host_key(&path).await.unwrap();
        assert_eq!(
            generated.clone_public_key().unwrap().fingerprint(),
            loaded.clone_public_key().unwrap().fingerprint()
        );
    }
}
