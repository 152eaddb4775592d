//! ConSys Server Daemon
//!
//! Accepts SSH connections from terminal daemons and admin consoles.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cs_core::config::{self, ServerConfig};
use cs_server::auth::hash_password;
use cs_server::server::{load_or_generate_host_key, SshServer};
use cs_server::ServerState;

#[derive(Parser)]
#[command(name = "consys-server")]
#[command(about = "ConSys server daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the digest to store for an admin password and exit
    #[arg(long, value_name = "PASSWORD")]
    hash_password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(password) = &args.hash_password {
        println!("{}", hash_password(password));
        return Ok(());
    }

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("ConSys server starting...");

    // Load configuration
    let config: ServerConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path("server");
        config::load_config_or_default(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            ServerConfig::default()
        })
    };

    let bind_addr = args.bind.unwrap_or_else(|| config.bind_address.clone());

    let host_key = load_or_generate_host_key(&config.host_key_path).await?;
    let fingerprint = host_key
        .clone_public_key()
        .context("Host key has no public half")?
        .fingerprint();
    tracing::info!("Host key fingerprint: {}", fingerprint);

    if config.client_key_fingerprint.is_empty() {
        tracing::warn!("No client key fingerprint configured - terminals will be rejected");
    }
    if config.admins.is_empty() {
        tracing::warn!("No admin accounts configured - admins will be rejected");
    }

    let state = Arc::new(ServerState::open(config).await?);

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    let server = SshServer::new(host_key, Arc::clone(&state), cancel.clone());

    tracing::info!("Starting SSH server on {}", bind_addr);
    server.run(&bind_addr).await?;

    for session in state.tracker.clients().into_iter().chain(state.tracker.admins()) {
        session.close();
    }
    state.pool.shutdown().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}
