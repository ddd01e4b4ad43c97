mod migrations;
mod server;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use relaycast_cluster::{Broker, Coordinator, MemoryBroker, RedisBroker, RelaySettings};
use relaycast_core::{
    bootstrap::{init_database, load_config},
    logging, Config, NotificationStore, PgNotificationStore,
};

use server::RelayServer;

/// Real-time notification relay
#[derive(Debug, Parser)]
#[command(name = "relaycast", version)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,
}

/// Connect to Redis, or fall back to the in-process broker when no URL is set
async fn connect_broker(config: &Config) -> Result<Arc<dyn Broker>> {
    if config.redis_url().is_empty() {
        warn!("Redis not configured, using in-process broker (single-node mode)");
        return Ok(Arc::new(MemoryBroker::new()));
    }

    let broker = RedisBroker::connect(
        config.redis_url(),
        Duration::from_secs(config.redis.connect_timeout_seconds),
    )
    .await
    .context("Failed to connect to Redis")?;

    Ok(Arc::new(broker))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load and validate configuration
    let config = load_config(cli.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Relaycast starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Initialize database and apply migrations
    let pool = init_database(&config).await?;
    migrations::run_migrations(&pool, config.redis_url()).await?;
    let store: Arc<dyn NotificationStore> = Arc::new(PgNotificationStore::new(pool));

    // 4. Initialize broker
    let broker = match connect_broker(&config).await {
        Ok(broker) => broker,
        Err(e) => {
            store.close().await;
            return Err(e);
        }
    };

    // 5. Run the relay until a shutdown signal
    let coordinator = Coordinator::new(
        broker,
        store,
        config.channels.clone(),
        RelaySettings::from(&config.relay),
    );

    if let Err(e) = RelayServer::new(config, coordinator).run().await {
        error!("Relaycast stopped with error: {:#}", e);
        return Err(e);
    }

    info!("Relaycast stopped");
    Ok(())
}
