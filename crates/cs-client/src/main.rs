//! ConSys Terminal Daemon
//!
//! Runs on a contest workstation and keeps it connected to the server,
//! reconnecting with backoff whenever the connection drops.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cs_client::{load_or_generate_client_key, ClientDaemon};
use cs_core::config::{self, ClientConfig};

#[derive(Parser)]
#[command(name = "consys-client")]
#[command(about = "ConSys terminal daemon - keeps this workstation connected to the server")]
#[command(version)]
struct Args {
    /// Server to connect to (host or host:port)
    #[arg(short, long)]
    server: Option<String>,

    /// Pinned server host key fingerprint
    #[arg(long)]
    host_key: Option<String>,

    /// Path to private key (auto-generated if not specified)
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("ConSys client starting...");

    // Load configuration
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config::default_config_path("client"));

    let mut config: ClientConfig = config::load_config_or_default(&config_path).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from {:?}: {}", config_path, e);
        ClientConfig::default()
    });

    // Apply command-line overrides
    if let Some(server) = args.server {
        config.server_address = if server.contains(':') {
            server
        } else {
            format!("{}:2222", server)
        };
    }
    if let Some(host_key) = args.host_key {
        config.server_host_key = host_key;
    }
    if let Some(key) = args.key {
        config.private_key_path = key;
    }

    if config.server_host_key.is_empty() {
        anyhow::bail!(
            "No server host key configured. Set server_host_key in {:?} or pass --host-key.",
            config_path
        );
    }

    let key = load_or_generate_client_key(&config.private_key_path).await?;
    let fingerprint = key
        .clone_public_key()
        .context("Private key has no public half")?
        .fingerprint();
    tracing::info!("Client key fingerprint: {}", fingerprint);

    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl+C, initiating shutdown..."),
            Err(e) => {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
        }
        signal_token.cancel();
    });

    let daemon = ClientDaemon::start(&config, Arc::new(key), shutdown).await?;
    daemon.run().await?;

    tracing::info!("Client shutdown complete");
    Ok(())
}
