mod builder;
mod conditions;
mod config;
mod controller;
mod credentials;
mod error;
mod events;
mod index;
mod metrics;
mod models;
mod queue;
mod registry;
mod storage;
mod verify;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "charthouse=info,kube=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting charthouse - Helm and OCI source controller");

    let config = config::Config::from_env();

    // Initialize metrics server
    let metrics_handle = metrics::start_metrics_server(config.metrics_addr).await?;

    // Start source controllers
    let controller_handle = controller::start_controllers(config).await?;

    info!("charthouse is running");

    // Wait for all services
    tokio::select! {
        _ = metrics_handle => info!("Metrics server stopped"),
        _ = controller_handle => info!("Controllers stopped"),
    }

    Ok(())
}
