mod anticheat;
mod config;
mod game;
mod metrics;
mod net;
mod persistence;
mod scripting;
mod server;
mod util;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn, Level};

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::persistence::MemoryStore;
use crate::scripting::NullHooks;
use crate::server::GameServer;

/// Authoritative UDP game server
#[derive(Debug, Parser)]
#[command(name = "outpost-server", version, about)]
struct Args {
    /// UDP port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Maximum concurrent clients
    #[arg(long)]
    max_clients: Option<usize>,

    /// Database connection string for the persistence adapter
    #[arg(long)]
    db_conn: Option<String>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    info!("Outpost Server v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    // Defaults, then environment, then config file, then CLI flags
    let mut config = ServerConfig::load_or_default();
    if let Some(path) = &args.config {
        config.merge_file(path)?;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(max_clients) = args.max_clients {
        config.max_clients = max_clients;
    }
    if let Some(db_conn) = args.db_conn {
        config.db_connection = Some(db_conn);
    }

    if let Err(e) = config.validate() {
        anyhow::bail!("invalid configuration: {}", e);
    }

    info!(
        "configuration loaded: {}:{}, max_clients={}, tick_rate={} Hz",
        config.bind_address, config.port, config.max_clients, config.tick_rate
    );

    let metrics = Arc::new(Metrics::new());

    let metrics_port: u16 = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9090);

    let metrics_clone = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("metrics server error: {}", e);
        }
    });

    // The SQL adapter lives outside this crate; without one configured the
    // in-memory store keeps the persistence pipeline exercised.
    if config.db_connection.is_some() {
        warn!("db_connection set but no SQL adapter is linked; using in-memory store");
    }
    let store = Arc::new(MemoryStore::new());

    if let Some(scripts) = &config.scripts_path {
        warn!("scripts_path '{}' set but no script host is linked", scripts);
    }

    let mut server = GameServer::new(config, store, Box::new(NullHooks), metrics).await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    server.run().await?;

    Ok(())
}
