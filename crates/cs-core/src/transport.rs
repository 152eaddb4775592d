//! Client side of the authenticated transport session
//!
//! [`TransportSession::connect`] opens an SSH connection, checks the server
//! host key against a pinned fingerprint, and authenticates with the first
//! applicable [`AuthStrategy`]. The established session opens sub-channels
//! as SSH `session` channels followed by a subsystem request.

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use cs_protocol::ServiceName;

use crate::automaton::DisconnectNotifier;
use crate::error::TransportError;
use crate::mux::{BoxedStream, SubChannelOpener};

/// Secret half of the credentials
#[derive(Clone)]
pub enum Secret {
    Password(String),
    PrivateKeyFile(PathBuf),
    PrivateKey(Arc<KeyPair>),
}

/// Username plus secret, held in memory only for authentication
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub secret: Secret,
}

impl Credentials {
    /// Password credentials
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Secret::Password(password.into()),
        }
    }

    /// Public-key credentials read from a file at connect time
    pub fn key_file(username: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            username: username.into(),
            secret: Secret::PrivateKeyFile(path.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.secret {
            Secret::Password(_) => "password",
            Secret::PrivateKeyFile(_) | Secret::PrivateKey(_) => "public-key",
        };
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &kind)
            .finish()
    }
}

/// Load a private key, mapping failures to [`TransportError::KeyNotFound`]
pub fn load_private_key(path: &std::path::Path) -> Result<KeyPair, TransportError> {
    if !path.exists() {
        return Err(TransportError::KeyNotFound {
            path: path.to_path_buf(),
            reason: "File does not exist".to_string(),
        });
    }
    russh_keys::load_secret_key(path, None).map_err(|e| TransportError::KeyNotFound {
        path: path.to_path_buf(),
        reason: format!("Failed to load key: {}", e),
    })
}

/// Result of one authentication strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted,
    /// The server refused; no further strategies are tried
    Rejected,
    /// The credentials do not fit this strategy; try the next one
    NotApplicable,
}

/// One way of proving identity to the server
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Method name for logs
    fn name(&self) -> &'static str;

    /// Try this method once
    async fn authenticate(
        &self,
        handle: &mut Handle<PinnedHostKey>,
        credentials: &Credentials,
    ) -> Result<AuthOutcome, TransportError>;
}

/// Public-key authentication
pub struct PublicKeyAuth;

#[async_trait]
impl AuthStrategy for PublicKeyAuth {
    fn name(&self) -> &'static str {
        "publickey"
    }

    async fn authenticate(
        &self,
        handle: &mut Handle<PinnedHostKey>,
        credentials: &Credentials,
    ) -> Result<AuthOutcome, TransportError> {
        let key = match &credentials.secret {
            Secret::PrivateKey(key) => Arc::clone(key),
            Secret::PrivateKeyFile(path) => Arc::new(load_private_key(path)?),
            Secret::Password(_) => return Ok(AuthOutcome::NotApplicable),
        };

        let accepted = handle
            .authenticate_publickey(&credentials.username, key)
            .await
            .map_err(|e| TransportError::Connect {
                address: String::new(),
                reason: format!("Authentication error: {}", e),
            })?;
        Ok(if accepted {
            AuthOutcome::Accepted
        } else {
            AuthOutcome::Rejected
        })
    }
}

/// Password authentication
pub struct PasswordAuth;

#[async_trait]
impl AuthStrategy for PasswordAuth {
    fn name(&self) -> &'static str {
        "password"
    }

    async fn authenticate(
        &self,
        handle: &mut Handle<PinnedHostKey>,
        credentials: &Credentials,
    ) -> Result<AuthOutcome, TransportError> {
        let Secret::Password(password) = &credentials.secret else {
            return Ok(AuthOutcome::NotApplicable);
        };

        let accepted = handle
            .authenticate_password(&credentials.username, password)
            .await
            .map_err(|e| TransportError::Connect {
                address: String::new(),
                reason: format!("Authentication error: {}", e),
            })?;
        Ok(if accepted {
            AuthOutcome::Accepted
        } else {
            AuthOutcome::Rejected
        })
    }
}

/// Strategies in preference order
pub fn default_strategies() -> Vec<Box<dyn AuthStrategy>> {
    vec![Box::new(PublicKeyAuth), Box::new(PasswordAuth)]
}

/// SSH client handler that pins the server host key
///
/// Holds the disconnect notifier; russh drops the handler when the
/// connection ends, which fires it.
pub struct PinnedHostKey {
    expected: String,
    presented: Arc<Mutex<Option<String>>>,
    _on_disconnect: DisconnectNotifier,
}

#[async_trait]
impl client::Handler for PinnedHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        if fingerprint == self.expected {
            tracing::info!("Valid host key fingerprint: {}", fingerprint);
            Ok(true)
        } else {
            tracing::warn!("Invalid host key fingerprint: {}", fingerprint);
            if let Ok(mut presented) = self.presented.lock() {
                *presented = Some(fingerprint);
            }
            Ok(false)
        }
    }
}

/// An authenticated SSH session to the server
pub struct TransportSession {
    handle: Handle<PinnedHostKey>,
    address: String,
}

impl TransportSession {
    /// Connect, verify the host key and authenticate
    ///
    /// `on_disconnect` fires once when the connection is lost, including
    /// when this call itself fails.
    pub async fn connect(
        address: &str,
        expected_host_key: &str,
        credentials: &Credentials,
        on_disconnect: DisconnectNotifier,
    ) -> Result<Self, TransportError> {
        let presented = Arc::new(Mutex::new(None));
        let handler = PinnedHostKey {
            expected: expected_host_key.to_string(),
            presented: Arc::clone(&presented),
            _on_disconnect: on_disconnect,
        };

        tracing::debug!("Connecting to {}", address);
        let mut handle = client::connect(Arc::new(Config::default()), address, handler)
            .await
            .map_err(|e| {
                let presented = presented.lock().ok().and_then(|mut p| p.take());
                match presented {
                    Some(presented) => TransportError::InvalidHostKey {
                        presented,
                        expected: expected_host_key.to_string(),
                    },
                    None => TransportError::Connect {
                        address: address.to_string(),
                        reason: e.to_string(),
                    },
                }
            })?;

        tracing::debug!("Authenticating as user '{}'", credentials.username);
        let mut outcome = AuthOutcome::NotApplicable;
        for strategy in default_strategies() {
            outcome = strategy
                .authenticate(&mut handle, credentials)
                .await
                .map_err(|e| match e {
                    TransportError::Connect { reason, .. } => TransportError::Connect {
                        address: address.to_string(),
                        reason,
                    },
                    other => other,
                })?;
            match outcome {
                AuthOutcome::NotApplicable => continue,
                AuthOutcome::Accepted => {
                    tracing::info!("Authenticated with {}", strategy.name());
                    break;
                }
                AuthOutcome::Rejected => {
                    tracing::warn!("Server rejected {} authentication", strategy.name());
                    break;
                }
            }
        }

        if outcome != AuthOutcome::Accepted {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "en")
                .await;
            return Err(TransportError::Unauthorized);
        }

        Ok(Self {
            handle,
            address: address.to_string(),
        })
    }

    /// Server address of this session
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the underlying connection has ended
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Disconnect from the server
    pub async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await
        {
            tracing::debug!("Disconnect from {}: {}", self.address, e);
        }
    }
}

#[async_trait]
impl SubChannelOpener for TransportSession {
    async fn open_sub_channel(&self, service: &ServiceName) -> Result<BoxedStream, TransportError> {
        let rejected = |reason: String| TransportError::ChannelRejected {
            service: service.to_string(),
            reason,
        };

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| rejected(e.to_string()))?;

        channel
            .request_subsystem(true, &service.as_str())
            .await
            .map_err(|e| rejected(e.to_string()))?;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => break,
                Some(ChannelMsg::Failure) => return Err(rejected("subsystem refused".to_string())),
                Some(other) => tracing::trace!("Ignoring {:?} while opening {}", other, service),
                None => return Err(TransportError::SessionClosed),
            }
        }

        Ok(Box::new(channel.into_stream()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_hides_secret() {
        let creds = Credentials::password("alice", "hunter2");
        let shown = format!("{:?}", creds);
        assert!(shown.contains("alice"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn test_missing_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent_key");
        assert!(matches!(
            load_private_key(&path),
            Err(TransportError::KeyNotFound { .. })
        ));
    }
}
