//! herald-server binary.

use clap::Parser;
use herald_server::{HeraldServer, MemoryStore, Relay, RelaySettings, ServerConfig};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// herald-server — presence-aware message relay
#[derive(Parser, Debug)]
#[command(name = "herald-server", version, about = "Presence-aware message relay")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = "~/.herald/config.toml")]
    config: String,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Seconds a connection may stay unauthenticated
    #[arg(long)]
    auth_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting herald-server");

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.bind,
        cli.port,
        cli.max_connections,
        cli.auth_timeout,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if server_config.users.is_empty() {
        info!("no users configured, every authentication will fail");
    }
    let store = Arc::new(MemoryStore::with_users(server_config.users.clone()));
    let relay = Relay::new(RelaySettings::from(&server_config), store.clone(), store);
    let server = HeraldServer::new(server_config, relay);

    if let Err(e) = server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("herald-server stopped");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
