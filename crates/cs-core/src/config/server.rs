//! Server configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs_f64;

/// Configuration for the server daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the SSH server to
    pub bind_address: String,

    /// Path to the host key file (generated on first start if missing)
    pub host_key_path: PathBuf,

    /// Username every terminal daemon authenticates as
    pub client_username: String,

    /// Fingerprint of the single allowed terminal key
    pub client_key_fingerprint: String,

    /// Admin accounts: name to hex SHA-256 digest of the password
    pub admins: HashMap<String, String>,

    /// JSON file holding terminals and workstations
    pub store_path: PathBuf,

    /// Size of the background worker pool
    pub worker_threads: usize,

    /// How long to wait for a client's control channel during setup
    #[serde(with = "duration_secs_f64")]
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let config_dir = super::default_config_dir();

        Self {
            bind_address: "0.0.0.0:2222".to_string(),
            host_key_path: config_dir.join("host_key"),
            client_username: "consys".to_string(),
            client_key_fingerprint: String::new(),
            admins: HashMap::new(),
            store_path: config_dir.join("terminals.json"),
            worker_threads: 4,
            handshake_timeout: Duration::from_secs(1),
        }
    }
}
