//! Global server state

use std::sync::Arc;

use anyhow::{Context, Result};

use cs_core::config::ServerConfig;
use cs_core::control::ControlChannel;
use cs_core::mux::ChannelAcceptors;
use cs_core::pool::WorkerPool;
use cs_core::rpc::{OperationTable, RpcChannel};
use cs_protocol::{ServiceKind, ServiceName};

use crate::admin;
use crate::auth::{AdminCredentials, TerminalKey};
use crate::registry::TerminalRegistry;
use crate::session::{Role, ServerSession};
use crate::store::{JsonFileStore, TerminalStore};
use crate::tracker::ConnectionTracker;

/// Channel handlers, keyed by the session they arrive on
pub type Acceptors = ChannelAcceptors<Arc<ServerSession>>;

/// Global state for the server daemon
pub struct ServerState {
    /// Configuration
    pub config: ServerConfig,
    /// Terminal table
    pub registry: Arc<TerminalRegistry>,
    /// Live sessions
    pub tracker: Arc<ConnectionTracker>,
    /// Allowed terminal key
    pub terminal_key: TerminalKey,
    /// Admin accounts
    pub admins: AdminCredentials,
    /// Background workers (persistence)
    pub pool: Arc<WorkerPool>,
    terminal_table: Arc<OperationTable>,
    client_channels: Acceptors,
    admin_channels: Acceptors,
}

impl ServerState {
    /// Open the file store named in `config` and load the registry
    pub async fn open(config: ServerConfig) -> Result<Self> {
        let pool = Arc::new(WorkerPool::new(config.worker_threads));
        let store = Arc::new(JsonFileStore::new(&config.store_path, Arc::clone(&pool)));
        Self::with_store(config, store, pool).await
    }

    /// Build the state over an explicit store
    pub async fn with_store(
        config: ServerConfig,
        store: Arc<dyn TerminalStore>,
        pool: Arc<WorkerPool>,
    ) -> Result<Self> {
        let registry = Arc::new(
            TerminalRegistry::load(store)
                .await
                .context("Failed to load terminal records")?,
        );

        let terminal_table = Arc::new(admin::terminal_table()?);
        let admin_table = Arc::new(admin::service_table(Arc::clone(&registry))?);

        let client_channels = client_acceptors(Arc::clone(&registry), Arc::clone(&terminal_table));
        let admin_channels = admin_acceptors(Arc::clone(&registry), admin_table);

        Ok(Self {
            terminal_key: TerminalKey::from_config(&config),
            admins: AdminCredentials::new(config.admins.clone()),
            config,
            registry,
            tracker: Arc::new(ConnectionTracker::new()),
            pool,
            terminal_table,
            client_channels,
            admin_channels,
        })
    }

    /// Channel handlers allowed for a role
    pub fn acceptors(&self, role: Role) -> &Acceptors {
        match role {
            Role::Client => &self.client_channels,
            Role::Admin => &self.admin_channels,
        }
    }

    /// Operations the server answers on terminal channels
    pub fn terminal_table(&self) -> Arc<OperationTable> {
        Arc::clone(&self.terminal_table)
    }

    /// Clean up after a session has ended
    ///
    /// Waits for a running identity handshake, then unbinds the terminal
    /// if the handshake bound one.
    pub async fn session_closed(&self, session: &ServerSession) {
        self.tracker.remove(session.handle());
        session.close();

        if let Some(attach) = session.take_attach() {
            if let Ok(Ok(id)) = attach.await {
                tracing::debug!("{} held terminal {}", session.handle(), id);
                // Errors are logged by the registry
                let _ = self.registry.detach_client(session.handle()).await;
            }
        }
    }
}

fn client_acceptors(registry: Arc<TerminalRegistry>, table: Arc<OperationTable>) -> Acceptors {
    let mut acceptors = Acceptors::new();

    acceptors.accept_channel(ServiceKind::Control, |session, _service, stream| async move {
        let (sender, mut inbound) = ControlChannel::spawn(stream);
        if !session.set_control(sender.clone()) {
            tracing::warn!("{} opened a second control channel", session.handle());
            sender.close();
            return;
        }
        tracing::debug!("{} control channel ready", session.handle());
        while let Some(message) = inbound.recv().await {
            tracing::debug!("Ignoring {:?} from {}", message, session.handle());
        }
    });

    acceptors.accept_channel(ServiceKind::Rpc, move |session, _service, stream| {
        let registry = Arc::clone(&registry);
        let table = Arc::clone(&table);
        async move {
            let label = format!("{}/rpc-c2s", session.handle());
            let link = RpcChannel::spawn(stream, table, label);
            if !session.set_rpc(link.clone()) {
                tracing::warn!("{} opened a second remote-call channel", session.handle());
                link.close();
                return;
            }

            let owner = Arc::clone(&session);
            let attach = tokio::spawn(async move {
                let result = registry.attach_client(owner.handle(), link).await;
                if let Err(e) = &result {
                    if !owner.is_closed() {
                        tracing::warn!("Dropping {}: {}", owner.handle(), e);
                        owner.close();
                    }
                }
                result
            });
            session.set_attach(attach);
        }
    });

    acceptors.accept_channel(ServiceKind::ReverseRpc, |session, service, stream| async move {
        if let ServiceName::ReverseRpc(sequence_id) = service {
            session.complete_reverse(sequence_id, stream);
        }
    });

    acceptors
}

fn admin_acceptors(registry: Arc<TerminalRegistry>, table: Arc<OperationTable>) -> Acceptors {
    let mut acceptors = Acceptors::new();

    acceptors.accept_channel(ServiceKind::AdminRpc, move |session, _service, stream| {
        let events = registry.subscribe();
        let table = Arc::clone(&table);
        async move {
            let label = format!("{}/admin-rpc", session.handle());
            let link = RpcChannel::spawn(stream, table, label);
            if !session.set_rpc(link.clone()) {
                tracing::warn!("{} opened a second admin channel", session.handle());
                link.close();
                return;
            }
            tracing::info!("Admin {} attached", session.handle());
            admin::forward_events(events, link).await;
        }
    });

    acceptors
}
