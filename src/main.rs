//! Radio Relay
//!
//! Streams the selected station as raw PCM to one playback device and serves
//! the HTTP control API.

use radio_relay::{api, bus, catalog, config, metadata, persistence, pipeline, relay, store};

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const RELAY_STOP_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "radio_relay=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting Radio Relay v{} ({})",
        env!("RELAY_VERSION"),
        env!("RELAY_GIT_SHA")
    );

    let config = config::load_config()?;

    let catalog_file = config.catalog_file();
    let catalog = catalog::Catalog::load(&catalog_file)
        .with_context(|| format!("Failed to load station catalog {}", catalog_file.display()))?;

    let bus = bus::create_bus();
    let index_file = persistence::IndexFile::new(config.state_file());
    let store = Arc::new(store::StationStore::restore(catalog, index_file, bus.clone()));
    let current = store.snapshot().await;
    tracing::info!(
        "Loaded {} stations. Starting with: {} (index {})",
        store.catalog().len(),
        current.station,
        current.index
    );

    let resolver = Arc::new(metadata::HttpMetadataResolver::new(config.metadata_timeout())?);
    let shutdown = CancellationToken::new();

    // Data plane
    let audio_listener = tokio::net::TcpListener::bind(config.audio_addr())
        .await
        .with_context(|| format!("Failed to start TCP listener on {}", config.audio_addr()))?;
    let transcoder = pipeline::Transcoder::new(&config.transcoder)
        .with_inherit_stderr(config.transcoder_stderr)
        .with_reap_timeout(config.reap_timeout());
    let relay = relay::Relay::new(store.clone(), transcoder, bus.clone())
        .with_failure_backoff(config.failure_backoff());
    let relay_task = tokio::spawn(relay.serve(audio_listener, shutdown.clone()));

    // Control plane
    let state = api::AppState::new(store.clone(), resolver, bus.clone(), shutdown.clone());
    let app = api::router(state);

    let control_listener = tokio::net::TcpListener::bind(config.control_addr())
        .await
        .with_context(|| format!("Failed to start control API on {}", config.control_addr()))?;
    tracing::info!(
        "Control API listening on http://{} (/nowplaying, /next, /current, /restart)",
        config.control_addr()
    );

    if let Err(e) = axum::serve(control_listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
    {
        tracing::error!("Control API server failed: {}", e);
    }

    relay::wind_down(&store, &shutdown, relay_task, RELAY_STOP_GRACE).await;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Wait for Ctrl+C, SIGTERM, or an internal shutdown request, then cancel `shutdown`
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
        _ = shutdown.cancelled() => tracing::info!("Restart requested, shutting down..."),
    }

    shutdown.cancel();
}
