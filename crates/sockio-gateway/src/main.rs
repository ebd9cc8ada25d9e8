#![warn(missing_docs)]

//! sockio gateway server (xhr-polling, xhr-streaming, websocket)

use std::sync::Arc;

use clap::Parser;
use sockio_gateway::cli::Cli;
use sockio_gateway::{EchoFactory, Gateway};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!("sockio gateway starting...");

    let cli = Cli::parse();
    let config = cli.load_config()?;

    let gateway = Gateway::new(config, Arc::new(EchoFactory));
    let registry = gateway.registry().clone();
    gateway
        .serve(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            tracing::info!("Shutdown requested, closing {} sessions", registry.len());
            registry.shutdown_all().await;
        })
        .await?;
    Ok(())
}
