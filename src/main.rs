//! upcheck - HTTP uptime and latency monitor.

use upcheck::config::Config;
use upcheck::db::{self, Store};
use upcheck::probe::HttpProbe;
use upcheck::scheduler::{outcome_channel, spawn_writer, Scheduler};
use upcheck::web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("upcheck=info".parse()?))
        .init();

    // Load configuration
    let cfg = Arc::new(Config::load()?);
    tracing::info!("Starting upcheck on port {}...", cfg.core.port);
    tracing::info!("Using database at {}", cfg.core.db_path);

    // Initialize database, then migrate it to the current schema
    db::initialize(&cfg.core.db_path, true)?;
    let store = Arc::new(Store::open(&cfg.core.db_path)?);
    tracing::info!("Database initialized successfully");

    if cfg.checks.is_empty() {
        tracing::warn!("No checks configured, add [host.<name>] tables to the config");
    }

    // Start the writer and one check loop per check
    let (tx, rx) = outcome_channel();
    let writer = spawn_writer(store.clone(), rx);
    let probe = Arc::new(HttpProbe::new()?);
    let scheduler = Scheduler::start(&cfg, probe, tx);

    // Serve the dashboard until interrupted
    let server = Server::new(cfg.clone(), store);
    let served = server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    tracing::info!("Shutting down gracefully");
    scheduler.shutdown().await;
    let saved = writer.await?;
    tracing::info!("Saved {} outcomes this run", saved);

    served
}
