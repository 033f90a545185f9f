mod config;
mod detect;
mod envelope;
mod error;
mod markup;
mod rpc;
mod sender;
mod store;
mod webhook;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::markup::Translator;
use crate::sender::MessengerFactory;
use crate::store::TenantStore;
use crate::webhook::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,bridgebot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Connector code: {}", config.bitrix.connector_code);
    info!("  Database: {}", config.storage.database_path.display());
    info!("  Bind address: {}", config.server.bind_addr);

    let store = TenantStore::open(&config.storage.database_path)?;
    let factory = MessengerFactory::new(&config)?;
    let translator = Translator::new()?;

    let bind_addr = config.server.bind_addr.clone();
    let state = Arc::new(AppState {
        config,
        store,
        factory,
        translator,
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    info!("Webhook server listening on {}", bind_addr);

    axum::serve(listener, webhook::router(state))
        .await
        .context("Webhook server exited")?;

    Ok(())
}
