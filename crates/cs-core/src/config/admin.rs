//! Admin console configuration

use serde::{Deserialize, Serialize};

use super::BackoffConfig;

/// Configuration for an admin console
///
/// Credentials are not stored; they are supplied at login.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Server address to connect to (`host:port`)
    pub server_address: String,

    /// Pinned server host key fingerprint
    pub server_host_key: String,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            server_address: "localhost:2222".to_string(),
            server_host_key: String::new(),
            backoff: BackoffConfig::default(),
        }
    }
}
