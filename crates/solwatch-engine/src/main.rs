use std::sync::Arc;
use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};

use solwatch_common::Config;
use solwatch_engine::Indexer;
use solwatch_store::PostgresGateway;
use solwatch_stream::PubsubSource;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let config = Config::from_env()?;
    info!(
        "Starting solwatch indexer against {} ({} commitment)",
        config.ws_endpoint, config.commitment
    );

    let gateway = Arc::new(PostgresGateway::connect(&config.database_url).await?);
    let source = Arc::new(PubsubSource::new(
        config.ws_endpoint.clone(),
        config.commitment.clone(),
    ));

    let indexer = Indexer::new(config, gateway, source).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    indexer.run(shutdown_rx).await
}
