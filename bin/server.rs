// Spot Reviews - Web Server
// REST API with Axum; aggregate maintenance runs in-process on the trigger queue

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use spot_reviews::api::{router, AppState};
use spot_reviews::{trigger, AggregateMaintainer, Config, PlacesClient, Store};

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = Config::load()?;

    let store = Store::open(&config.database_path)
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;
    info!(path = %config.database_path.display(), "database opened");

    // Trigger queue: ingest publishes, the maintainer consumes
    let (queue, receiver) = trigger::channel();
    let maintainer = Arc::new(
        AggregateMaintainer::new(store.clone()).with_max_attempts(config.max_txn_attempts),
    );
    let consumer = tokio::spawn(trigger::run_consumer(receiver, maintainer));

    // Reviews persisted before a crash but never counted
    trigger::replay_unprocessed(&store, &queue).context("Failed to replay uncounted reviews")?;

    let places = match &config.places_api_key {
        Some(key) => Some(PlacesClient::new(key).context("Failed to create places client")?),
        None => {
            warn!("GOOGLE_MAPS_KEY not set, nearby search disabled");
            None
        }
    };

    let state = AppState::new(store, queue, places).with_places_radius(config.places_radius);
    let app = router(state);

    let address = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind to {address}"))?;
    info!("Server running on http://{address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // The router (and every queue handle) is gone; let pending updates finish
    info!("Draining aggregate updates...");
    consumer.await.context("Trigger consumer failed")?;
    info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
