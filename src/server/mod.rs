//! HTTP server
//!
//! axum front end for the lease coordinator, plus the startup wiring that
//! turns an [`AppConfig`] into a running service.

pub mod handlers;
pub mod middleware;
pub mod routes;

use axum::{extract::Extension, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::{error, info};

use crate::channel::{CleanupConfig, CleanupScheduler, Clock, LeaseCoordinator, SystemClock};
use crate::config::{AppConfig, ServerConfig, StorageBackend, StorageConfig};
use crate::metrics::LeaseMetrics;
use crate::storage::{JournalStore, MemoryStore, Stores};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<LeaseCoordinator>,
    pub config: ServerConfig,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .finish()
    }
}

/// Open the configured backend.
pub fn open_stores(config: &StorageConfig) -> crate::error::Result<Stores> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory channel store (leases are lost on restart)");
            Ok(Stores::single(MemoryStore::new()))
        }
        StorageBackend::Journal => {
            let store = JournalStore::open(&config.data_dir)?;
            info!(data_dir = ?config.data_dir, "Using journaled channel store");
            Ok(Stores::single(store))
        }
    }
}

/// Build the coordinator from configuration.
///
/// Every independent step is attempted before failing, so one start-up
/// reports all of its problems at once.
pub fn build_coordinator(
    config: &AppConfig,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Arc<LeaseCoordinator>> {
    let mut problems = Vec::new();

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        problems.push(e.to_string());
    }

    let metrics = LeaseMetrics::new()
        .map_err(|e| {
            error!(error = %e, "Failed to create metrics registry");
            problems.push(e.to_string());
        })
        .ok();

    let stores = open_stores(&config.storage)
        .map_err(|e| {
            error!(error = %e, "Failed to open channel store");
            problems.push(e.to_string());
        })
        .ok();

    match (metrics, stores) {
        (Some(metrics), Some(stores)) if problems.is_empty() => Ok(Arc::new(
            LeaseCoordinator::new(stores, &config.lease, clock, metrics),
        )),
        _ => Err(anyhow::anyhow!(
            "Service initialization failed: {}",
            problems.join("; ")
        )),
    }
}

/// Router with every route and layer, ready to serve.
pub fn build_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.request_timeout_secs);
    let enable_cors = state.config.enable_cors;

    let app = Router::new()
        .merge(routes::channel_routes())
        .merge(routes::health_routes())
        .layer(axum::middleware::from_fn(middleware::log_request))
        .layer(Extension(Arc::new(state)))
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new());

    if enable_cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Run the HTTP server until `shutdown` is cancelled.
pub async fn start_server(
    config: ServerConfig,
    coordinator: Arc<LeaseCoordinator>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.http_addr, config.http_port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Server listening on http://{}", addr);
    info!("Metrics: http://{}/_metrics", addr);

    let app = build_router(AppState {
        coordinator,
        config,
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| {
            error!(error = %e, "Server error");
            anyhow::anyhow!("Server failed: {}", e)
        })
}

/// Wire up and run the whole service: store, coordinator, cleanup task and
/// HTTP server. Returns after `shutdown` is cancelled and both halves stop.
pub async fn run(config: AppConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let coordinator = build_coordinator(&config, Arc::new(SystemClock))?;

    info!(
        lease_secs = config.lease.lease_duration_secs,
        cleanup_interval_secs = config.lease.cleanup_interval_secs,
        backend = ?config.storage.backend,
        "Starting channel lease service"
    );

    let cleanup = CleanupScheduler::spawn(coordinator.clone(), CleanupConfig::from(&config.lease));

    let served = start_server(config.server.clone(), coordinator, shutdown.clone()).await;

    // The server may also stop on its own error; take the sweeper down with it.
    shutdown.cancel();
    cleanup.shutdown().await;
    info!("Channel lease service stopped");

    served
}
