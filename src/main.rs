mod api;
mod config;
mod error;
mod event_consumer;
mod metadata_store;
mod object_store;
mod reconciler;

use anyhow::{Context, Result};
use api::{start_api_server, AppState};
use config::Config;
use event_consumer::S3EventConsumer;
use metadata_store::MetadataStore;
use object_store::ObjectStore;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting image catalog service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let metadata_store = Arc::new(
        MetadataStore::new(&config.dynamodb)
            .await
            .context("Failed to initialize metadata store")?,
    );

    metadata_store
        .ensure_table()
        .await
        .context("Failed to ensure image table")?;

    let object_store = Arc::new(
        ObjectStore::new(&config.s3)
            .await
            .context("Failed to initialize object store")?,
    );

    // Create SQS consumer for S3 object-created events
    let event_consumer = S3EventConsumer::new(&config.events, metadata_store.clone())
        .await
        .context("Failed to initialize S3 event consumer")?;

    // Create API state
    let api_state = AppState {
        object_store: object_store.clone(),
        metadata_store: metadata_store.clone(),
        presigned_url_expiry: config.presigned_url_expiry(),
    };

    // Spawn event consumer task
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = event_consumer.run().await {
            error!(error = %e, "S3 event consumer error");
        }
    });

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Image catalog service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down image catalog service");

    // Abort tasks
    consumer_handle.abort();
    api_handle.abort();

    info!("Image catalog service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
