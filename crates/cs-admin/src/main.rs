//! ConSys Admin Console
//!
//! Logs in to the server as an admin and queries or controls terminals.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cs_admin::commands;
use cs_admin::output::print_error;
use cs_admin::Login;
use cs_core::config::{self, AdminConfig};
use cs_core::transport::Credentials;
use cs_core::types::TerminalId;

#[derive(Parser)]
#[command(name = "consys-admin")]
#[command(author, version, about = "ConSys admin console")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Server to connect to (host:port, overrides config)
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Pinned server host key fingerprint (overrides config)
    #[arg(long, global = true)]
    host_key: Option<String>,

    /// Admin account name
    #[arg(short, long, global = true, default_value = "admin")]
    user: String,

    /// Admin password
    #[arg(long, global = true, env = "CONSYS_ADMIN_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the server answers
    Ping,

    /// List registered terminals
    List {
        /// Only show online terminals
        #[arg(long)]
        online: bool,
    },

    /// Show one terminal
    Info {
        /// Terminal id
        id: u32,
    },

    /// Ask terminal daemons to stop
    Shutdown {
        /// Terminal id(s)
        #[arg(required = true)]
        ids: Vec<u32>,
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },

    /// Print terminal events as they happen
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config::default_config_path("admin"));
    let mut config: AdminConfig = config::load_config_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    if let Some(host_key) = cli.host_key {
        config.server_host_key = host_key;
    }

    let password = match cli.password {
        Some(password) => password,
        None => prompt_password(&cli.user)?,
    };

    let login = Login::new(&config);
    if let Err(e) = login
        .do_connect(cli.server, Credentials::password(&cli.user, password))
        .await
    {
        print_error(&format!("Login failed: {}", e));
        login.shutdown().await;
        return Err(e.into());
    }

    let Some(client) = login.client() else {
        login.shutdown().await;
        anyhow::bail!("Session ended during login");
    };

    let result = match cli.command {
        Commands::Ping => client
            .ping()
            .await
            .map(|()| println!("pong"))
            .map_err(anyhow::Error::from),
        Commands::List { online } => commands::list_command(&client, online).await,
        Commands::Info { id } => commands::info_command(&client, TerminalId::new(id)).await,
        Commands::Shutdown { ids, force } => {
            let ids: Vec<TerminalId> = ids.into_iter().map(TerminalId::new).collect();
            commands::shutdown_command(&client, &ids, force).await
        }
        Commands::Watch => {
            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel_clone.cancel();
                }
            });
            commands::watch_command(login.notifications(), cancel).await
        }
    };

    login.shutdown().await;
    result
}

/// Read the password from the terminal
fn prompt_password(user: &str) -> Result<String> {
    eprint!("Password for {}: ", user);
    std::io::Write::flush(&mut std::io::stderr())?;

    let mut input = String::new();
    std::io::stdin()
        .read_line(&mut input)
        .context("Failed to read password")?;
    Ok(input.trim_end_matches(['\r', '\n']).to_string())
}
