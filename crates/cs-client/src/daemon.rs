//! Terminal daemon main loop

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use tokio_util::sync::CancellationToken;

use cs_core::automaton::{AutomatonHandle, ReconnectAutomaton};
use cs_core::config::ClientConfig;
use cs_core::transport::load_private_key;

use crate::identity::IdentityStore;
use crate::root::root_table;
use crate::tunnel::{TerminalConnector, TerminalSession};

/// Running daemon: the automaton plus the token that stops it
pub struct ClientDaemon {
    handle: AutomatonHandle<TerminalSession>,
    task: tokio::task::JoinHandle<()>,
    shutdown: CancellationToken,
}

impl ClientDaemon {
    /// Start the automaton and fire the first `connect`
    ///
    /// A failed first attempt is logged; the automaton keeps retrying in
    /// the background.
    pub async fn start(
        config: &ClientConfig,
        key: Arc<KeyPair>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let identity = Arc::new(IdentityStore::new(&config.identity_path));
        match identity.load().await {
            Ok(Some(id)) => tracing::info!("Terminal identity: {}", id),
            Ok(None) => tracing::info!("No terminal identity yet; the server will assign one"),
            Err(e) => tracing::warn!("{}", e),
        }

        let table = Arc::new(
            root_table(identity, shutdown.clone()).context("Failed to build operation table")?,
        );
        let connector = TerminalConnector::new(config, key, table);
        tracing::info!("Connecting to server at {}", connector.address());

        let (handle, task) = ReconnectAutomaton::spawn(connector, &config.backoff);

        let mut states = handle.subscribe();
        let watcher_token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = watcher_token.cancelled() => break,
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *states.borrow_and_update();
                        tracing::info!("Connection state: {}", state);
                    }
                }
            }
        });

        if let Err(e) = handle.connect().await {
            tracing::warn!("Initial connection failed: {} (retrying in background)", e);
        }

        Ok(Self {
            handle,
            task,
            shutdown,
        })
    }

    /// The automaton driving this daemon
    pub fn handle(&self) -> &AutomatonHandle<TerminalSession> {
        &self.handle
    }

    /// Wait for shutdown, then disconnect and stop the automaton
    pub async fn run(self) -> Result<()> {
        self.shutdown.cancelled().await;
        tracing::info!("Shutting down");

        self.handle.shutdown();
        self.task.await.context("Automaton task failed")?;
        Ok(())
    }
}

/// Load the daemon's private key, generating one on first start
///
/// The public key's fingerprint has to be configured on the server.
pub async fn load_or_generate_client_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        tracing::debug!("Using existing private key at {:?}", path);
        return Ok(load_private_key(path)?);
    }

    tracing::info!("Generating new private key at {:?}", path);

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let key = KeyPair::generate_ed25519()
        .ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key"))?;

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("Failed to encode private key")?;
    tokio::fs::write(path, &pem)
        .await
        .with_context(|| format!("Failed to write private key to {:?}", path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("Failed to restrict permissions on {:?}", path))?;
    }

    Ok(key)
}
