//! Meshplane Daemon
//!
//! Hosts the management core: opens the account store, wires the peer
//! update bus and keeps it tidy until shutdown.

use clap::Parser;
use meshplane_common::{Database, Error};
use meshplane_management::{AccountManager, MemoryStore, PeersUpdateManager, SqliteStore, Store};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod sweeper;

use config::{BootstrapConfig, DaemonConfig, StoreEngine};

#[derive(Parser)]
#[command(name = "meshplaned")]
#[command(about = "Meshplane daemon - mesh VPN control plane")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MESHPLANE_CONFIG")]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Keep accounts in memory only
    #[arg(long)]
    memory: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,
}

fn init_logging(cli: &Cli, config: &DaemonConfig) {
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if cli.json || config.logging.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn open_store(config: &DaemonConfig) -> anyhow::Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match config.store.engine {
        StoreEngine::Sqlite => {
            tokio::fs::create_dir_all(&config.store.path).await?;
            let db = Database::open(config.db_path())?;
            info!("Using SQLite store at {}", config.db_path().display());
            Arc::new(SqliteStore::new(db))
        }
        StoreEngine::Memory => {
            warn!("Using in-memory store, accounts are lost on shutdown");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(store)
}

async fn bootstrap(manager: &AccountManager, ctx: &CancellationToken, bootstrap: &BootstrapConfig) -> anyhow::Result<()> {
    match manager
        .create_account(ctx, &bootstrap.account_id, &bootstrap.owner, &bootstrap.domain)
        .await
    {
        Ok(_) => info!("Bootstrapped account {}", bootstrap.account_id),
        Err(Error::AlreadyExists { .. }) => info!("Account {} already present", bootstrap.account_id),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| meshplane_common::default_store_path().join("config.toml"));
    let mut config = DaemonConfig::load(&config_path)?;
    if let Some(store) = &cli.store {
        config.store.path = store.clone();
    }
    if cli.memory {
        config.store.engine = StoreEngine::Memory;
    }

    init_logging(&cli, &config);
    info!("Meshplane daemon v{}", meshplane_common::VERSION);
    info!("Configuration: {}", config_path.display());

    let store = open_store(&config).await?;
    let updates = Arc::new(PeersUpdateManager::new(config.updates.channel_buffer));
    let manager = AccountManager::new(store, updates.clone());

    let shutdown = CancellationToken::new();
    if let Some(account) = &config.bootstrap {
        bootstrap(&manager, &shutdown, account).await?;
    }

    let sweeper = sweeper::Sweeper::new(updates, Duration::from_secs(config.updates.sweep_interval_secs));
    let sweeper_shutdown = shutdown.clone();
    let mut sweeper_handle = tokio::spawn(async move { sweeper.run(sweeper_shutdown).await });

    info!("Daemon started with {} store", config.store.engine);

    // Wait for shutdown signal
    let sweeper_done = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            false
        }
        result = &mut sweeper_handle => {
            if let Err(e) = result {
                error!("Sweeper error: {}", e);
            }
            true
        }
    };

    shutdown.cancel();
    if !sweeper_done {
        if let Err(e) = sweeper_handle.await {
            error!("Sweeper error: {}", e);
        }
    }

    info!("Daemon shutdown complete");
    Ok(())
}
