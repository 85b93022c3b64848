//! Tutorboard Sync Server
//!
//! Keeps one authoritative document per session, relays CRDT deltas between
//! the session's sockets, and exposes the patch API to the agent path.

mod api;
mod config;
mod registry;
mod socket;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tutorboard_core::{now_millis, FileStorage, MemoryStorage, SnapshotStorage};

use crate::config::ServerConfig;
use crate::registry::SessionRegistry;

fn open_storage(config: &ServerConfig) -> Arc<dyn SnapshotStorage> {
    let storage = match &config.snapshot_dir {
        Some(dir) => FileStorage::new(dir.clone()),
        None => FileStorage::default_location(),
    };
    match storage {
        Ok(storage) => {
            info!("Snapshots stored in {}", storage.base_path().display());
            Arc::new(storage)
        }
        Err(e) => {
            warn!("File storage unavailable, snapshots kept in memory: {}", e);
            Arc::new(MemoryStorage::new())
        }
    }
}

fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(socket::ws_handler))
        .route("/health", get(api::health))
        .route("/sessions/{id}/patch", post(api::apply_patch))
        .route("/sessions/{id}/summary", get(api::summary))
        .route("/sessions/{id}/find", post(api::find))
        .route("/sessions/{id}/persist", post(api::persist))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(registry)
}

/// Index page
async fn index() -> &'static str {
    "Tutorboard Sync Server - Connect via WebSocket at /ws"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tutorboard_server=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let registry = Arc::new(SessionRegistry::new(open_storage(&config), config.channel_capacity));

    let reaper = Arc::clone(&registry);
    let period = Duration::from_millis(config.reaper_interval_ms);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            reaper.sweep_all(now_millis());
        }
    });

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    info!("Tutorboard server listening on {}", config.addr);
    info!("WebSocket endpoint: ws://{}/ws", config.addr);

    axum::serve(listener, router(registry)).await?;
    Ok(())
}
