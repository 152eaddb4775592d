//! Terminal daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::BackoffConfig;

/// Configuration for the terminal client daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address to connect to (`host:port`)
    pub server_address: String,

    /// Username for SSH authentication
    pub username: String,

    /// Path to the private key for authentication
    pub private_key_path: PathBuf,

    /// Pinned server host key fingerprint
    pub server_host_key: String,

    /// File holding the identity assigned by the server
    pub identity_path: PathBuf,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let config_dir = super::default_config_dir();

        Self {
            server_address: "localhost:2222".to_string(),
            username: whoami::username(),
            private_key_path: config_dir.join("client_key"),
            server_host_key: String::new(),
            identity_path: config_dir.join("identity.json"),
            backoff: BackoffConfig::default(),
        }
    }
}
