//! Admin login over the reconnect automaton
//!
//! The console keeps one automaton for its whole lifetime; logging in
//! again swaps the target and credentials and restarts it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use cs_core::automaton::{
    AutomatonHandle, ConnectError, Connector, DisconnectNotifier, LiveSession, ReconnectAutomaton,
};
use cs_core::config::AdminConfig;
use cs_core::error::TransportError;
use cs_core::transport::{Credentials, TransportSession};
use cs_core::types::ConnectionState;

use crate::client::{notification_channel, AdminClient, AdminNotification};

/// Where to connect and as whom
#[derive(Debug, Clone)]
struct Target {
    address: String,
    host_key: String,
    credentials: Option<Credentials>,
}

/// Connector reading the current target on every attempt
struct AdminConnector {
    target: Arc<Mutex<Target>>,
    events: broadcast::Sender<AdminNotification>,
}

#[async_trait]
impl Connector for AdminConnector {
    type Session = AdminSession;

    async fn connect(&self, on_disconnect: DisconnectNotifier) -> Result<AdminSession, TransportError> {
        let target = self
            .target
            .lock()
            .map_err(|_| TransportError::SessionClosed)?
            .clone();
        let Some(credentials) = target.credentials else {
            return Err(TransportError::Unauthorized);
        };

        let transport =
            TransportSession::connect(&target.address, &target.host_key, &credentials, on_disconnect)
                .await?;

        match AdminClient::open(&transport, self.events.clone()).await {
            Ok(client) => {
                tracing::info!("Logged in to {} as '{}'", target.address, credentials.username);
                Ok(AdminSession { transport, client })
            }
            Err(e) => {
                transport.close().await;
                Err(e)
            }
        }
    }
}

/// An authenticated admin session
pub struct AdminSession {
    transport: TransportSession,
    client: AdminClient,
}

impl AdminSession {
    pub fn client(&self) -> &AdminClient {
        &self.client
    }
}

#[async_trait]
impl LiveSession for AdminSession {
    async fn close(&self) {
        self.client.close();
        self.transport.close().await;
    }
}

/// Admin console connection manager
pub struct Login {
    handle: AutomatonHandle<AdminSession>,
    task: JoinHandle<()>,
    target: Arc<Mutex<Target>>,
    events: broadcast::Sender<AdminNotification>,
}

impl Login {
    /// Create a logged-out console for `config`'s server
    pub fn new(config: &AdminConfig) -> Self {
        let target = Arc::new(Mutex::new(Target {
            address: config.server_address.clone(),
            host_key: config.server_host_key.clone(),
            credentials: None,
        }));
        let events = notification_channel();
        let connector = AdminConnector {
            target: Arc::clone(&target),
            events: events.clone(),
        };
        let (handle, task) = ReconnectAutomaton::spawn(connector, &config.backoff);

        Self {
            handle,
            task,
            target,
            events,
        }
    }

    /// Log in, replacing any previous session
    ///
    /// Fires `disconnect`, stores the new target, then fires `connect` and
    /// reports the first attempt's outcome. A failed login fires
    /// `disconnect` again so bad credentials are not retried.
    pub async fn do_connect(
        &self,
        server: Option<String>,
        credentials: Credentials,
    ) -> Result<(), ConnectError> {
        self.handle.disconnect().await?;

        // An attempt still in flight has to drain before `connect` is valid
        let mut states = self.handle.subscribe();
        states
            .wait_for(|state| *state != ConnectionState::Cancelled)
            .await
            .map_err(|_| ConnectError::Closed)?;

        {
            let mut target = self.target.lock().map_err(|_| ConnectError::Closed)?;
            if let Some(server) = server {
                target.address = server;
            }
            target.credentials = Some(credentials);
        }

        match self.handle.connect().await {
            Err(ConnectError::Transport(e)) => {
                tracing::warn!("Login failed: {}", e);
                self.handle.disconnect().await?;
                Err(ConnectError::Transport(e))
            }
            result => result,
        }
    }

    /// Drop the session and stop retrying
    pub async fn logout(&self) -> Result<(), ConnectError> {
        self.handle.disconnect().await
    }

    /// Client of the live session, if logged in
    pub fn client(&self) -> Option<AdminClient> {
        self.handle.session().map(|s| s.client().clone())
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// Server pushes, across reconnects
    pub fn notifications(&self) -> broadcast::Receiver<AdminNotification> {
        self.events.subscribe()
    }

    /// The automaton driving this console
    pub fn handle(&self) -> &AutomatonHandle<AdminSession> {
        &self.handle
    }

    /// Disconnect and stop the automaton
    pub async fn shutdown(self) {
        let _ = self.handle.disconnect().await;
        self.handle.shutdown();
        if let Err(e) = self.task.await {
            tracing::warn!("Automaton task failed: {}", e);
        }
    }
}
