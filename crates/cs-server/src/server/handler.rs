//! SSH connection handler implementation
//!
//! Authenticates terminals by public key and admins by password, then
//! routes every sub-channel through the acceptors allowed for that role.
//! Sub-channels are `session` channels followed by a subsystem request
//! naming the service; anything outside the allow-list is refused.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use russh_keys::key::PublicKey;

use crate::session::{Role, ServerSession};
use crate::state::ServerState;

/// Handler for a single SSH connection
pub struct ConnectionHandler {
    /// Shared server state
    state: Arc<ServerState>,
    /// The peer this connection belongs to
    session: Arc<ServerSession>,
    /// Session channels waiting for their subsystem request
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl ConnectionHandler {
    /// Create a handler for one accepted connection
    pub fn new(state: Arc<ServerState>, session: Arc<ServerSession>) -> Self {
        Self {
            state,
            session,
            channels: HashMap::new(),
        }
    }

    fn authenticated(&self, role: Role) -> Auth {
        if self.session.set_role(role) {
            self.state.tracker.add(Arc::clone(&self.session));
        }
        Auth::Accept
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
        }
    }
}

#[async_trait]
impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    /// Terminal daemons log in with the single allowed key
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint();
        tracing::info!(
            "Key auth attempt from {} ({}), fingerprint: {}",
            self.session.peer(),
            user,
            fingerprint
        );

        if self.state.terminal_key.verify(user, public_key) {
            tracing::info!("Terminal {} authenticated", self.session.handle());
            return Ok(self.authenticated(Role::Client));
        }

        tracing::warn!(
            "Key authentication REJECTED for {} ({})",
            self.session.peer(),
            fingerprint
        );
        Ok(Self::reject())
    }

    /// Admins log in with a password
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        tracing::info!("Password auth attempt from {} ({})", self.session.peer(), user);

        if self.state.admins.verify(user, password) {
            tracing::info!("Admin '{}' authenticated as {}", user, self.session.handle());
            return Ok(self.authenticated(Role::Admin));
        }

        tracing::warn!(
            "Password authentication REJECTED for {} ({})",
            self.session.peer(),
            user
        );
        Ok(Self::reject())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let channel_id = channel.id();
        tracing::debug!("Channel opened: {:?}", channel_id);

        self.channels.insert(channel_id, channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(role) = self.session.role() else {
            let _ = session.channel_failure(channel_id);
            return Ok(());
        };

        let resolved = self.state.acceptors(role).resolve(name);
        let channel = self.channels.remove(&channel_id);

        match (resolved, channel) {
            (Ok((service, accept)), Some(channel)) => {
                tracing::debug!("{} opened {} on {:?}", self.session.handle(), service, channel_id);
                let _ = session.channel_success(channel_id);
                let owner = Arc::clone(&self.session);
                tokio::spawn(accept(owner, service, Box::new(channel.into_stream())));
            }
            (Err(e), _) => {
                tracing::warn!("{} refused sub-channel: {}", self.session.handle(), e);
                let _ = session.channel_failure(channel_id);
            }
            (Ok((service, _)), None) => {
                tracing::warn!("{} requested {} on unknown {:?}", self.session.handle(), service, channel_id);
                let _ = session.channel_failure(channel_id);
            }
        }

        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel closed: {:?}", channel);
        self.channels.remove(&channel);
        Ok(())
    }
}

/// Build the russh server configuration around the host key
pub fn ssh_config(host_key: russh_keys::key::KeyPair) -> Arc<russh::server::Config> {
    let mut config = russh::server::Config::default();
    config.keys.push(host_key);
    config.auth_rejection_time = std::time::Duration::from_secs(1);
    config.auth_rejection_time_initial = Some(std::time::Duration::from_secs(0));
    Arc::new(config)
}
