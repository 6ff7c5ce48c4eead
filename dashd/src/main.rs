mod config;
mod store;
mod bus;
mod ttl_cache;
mod pins;
mod directory;
mod network;
mod peers;
mod documents;
mod weather;
mod hardware;
mod containers;
mod process;
mod api;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::bus::dbus::SystemBusConnector;
use crate::bus::ConnectionManager;
use crate::config::Config;
use crate::directory::ServiceDirectory;
use crate::network::{EgressLookup, NetworkObserver};
use crate::peers::PeerAggregator;
use crate::pins::PinRegistry;
use crate::store::{DocumentDb, StoreHandle};
use crate::weather::WeatherService;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dashd=info"))
        )
        .init();

    tracing::info!("Starting dashd");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/dashd/dashd.toml".to_string());

    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    // Open document store
    let db = DocumentDb::open(&config.store.db_path)?;
    tracing::info!("Opened database at {:?}", config.store.db_path);
    let store = StoreHandle::spawn(db);

    // Bus connection is established lazily on first use
    let bus = Arc::new(ConnectionManager::new(
        Box::new(SystemBusConnector),
        config.bus.connect_timeout(),
        config.bus.call_timeout(),
    ));

    let client = reqwest::Client::builder()
        .user_agent(concat!("dashd/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let pins = PinRegistry::new(store.clone());

    if config.weather.api_key.is_none() {
        tracing::info!("No weather API key configured, weather is disabled");
    }

    let app_state = api::routes::AppState {
        directory: ServiceDirectory::new(bus.clone(), pins.clone()),
        peers: Arc::new(PeerAggregator::new(
            store.clone(),
            pins.clone(),
            client.clone(),
            Duration::from_millis(config.peers.request_timeout_ms),
            Duration::from_secs(config.peers.cache_ttl_secs),
        )),
        observer: Arc::new(NetworkObserver::with_defaults(bus.clone())),
        egress: Arc::new(EgressLookup::new(
            client.clone(),
            config.network.egress_url.clone(),
            Duration::from_millis(config.network.egress_timeout_ms),
            Duration::from_secs(config.network.egress_ttl_secs),
        )),
        weather: Arc::new(WeatherService::new(store.clone(), client.clone(), &config.weather)),
        engines: Arc::from(config.containers.engines.clone()),
        client,
        store: store.clone(),
        pins,
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");
    cancel.cancel();

    if let Err(e) = server_handle.await {
        tracing::error!("Server task failed: {}", e);
    }

    if let Err(e) = store.shutdown().await {
        tracing::error!("Failed to shutdown store: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
