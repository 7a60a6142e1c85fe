//! `FleetLock` server entry point.
//!
//! Bootstraps the storage backend and every `fleetlock-core` component, then
//! starts the Axum HTTP server with graceful shutdown. Five background
//! workers run alongside the server and are cancelled on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::HeaderValue;
use axum::middleware as axum_mw;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use fleetlock_core::events::EventLog;
use fleetlock_core::heartbeat::HeartbeatManager;
use fleetlock_core::locker::LockerStateMachine;
use fleetlock_core::notify::NotificationBroadcaster;
use fleetlock_core::queue::CommandQueue;
use fleetlock_storage::MemoryStore;
#[cfg(feature = "postgres-backend")]
use fleetlock_storage::PostgresStore;

use fleetlock_server::background;
use fleetlock_server::config::{ServerConfig, StorageBackendType};
use fleetlock_server::middleware::{rate_limit_ip, require_staff};
use fleetlock_server::routes;
use fleetlock_server::state::AppState;

use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(storage = ?config.storage_backend, "FleetLock starting");

    let state = build_app_state(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker_handles = background::spawn_all(
        Arc::clone(&state),
        &shutdown_rx,
        config.heartbeat_interval.to_std().unwrap_or(Duration::from_secs(10)),
        config.command_poll_interval.to_std().unwrap_or(Duration::from_secs(2)),
    );

    let app = build_router(Arc::clone(&state));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "FleetLock server listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("waiting for background workers to stop");
    for handle in worker_handles {
        let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
    }

    info!("FleetLock server stopped");
    Ok(())
}

/// Build the shared application state for one storage backend.
async fn build_app_state(config: &ServerConfig) -> anyhow::Result<Arc<AppState>> {
    let (locker_store, queue_store, event_store, heartbeat_store): (
        Arc<dyn fleetlock_storage::LockerStore>,
        Arc<dyn fleetlock_storage::CommandQueueStore>,
        Arc<dyn fleetlock_storage::EventStore>,
        Arc<dyn fleetlock_storage::HeartbeatStore>,
    ) = match &config.storage_backend {
        StorageBackendType::Memory => {
            info!("using in-memory storage (data will not persist)");
            let store = Arc::new(MemoryStore::new());
            (store.clone(), store.clone(), store.clone(), store)
        }
        #[cfg(feature = "postgres-backend")]
        StorageBackendType::Postgres { url } => {
            info!("using PostgreSQL storage");
            let store = Arc::new(
                PostgresStore::connect(url).await.context("failed to connect to PostgreSQL storage")?,
            );
            (store.clone(), store.clone(), store.clone(), store)
        }
        #[cfg(not(feature = "postgres-backend"))]
        StorageBackendType::Postgres { .. } => {
            anyhow::bail!("PostgreSQL backend requested but feature 'postgres-backend' is not enabled");
        }
    };

    let notify = Arc::new(NotificationBroadcaster::new(config.fleet.notify.clone()));
    let events = Arc::new(EventLog::new(event_store, config.fleet.events.clone()));
    let rate_limiter = Arc::new(config.fleet.build_rate_limiter());

    let locker = Arc::new(LockerStateMachine::new(
        locker_store,
        Arc::clone(&events),
        Arc::clone(&notify),
        config.fleet.locker.clone(),
    ));
    let queue = Arc::new(CommandQueue::new(queue_store.clone(), config.fleet.queue.clone()));
    let heartbeat = Arc::new(HeartbeatManager::new(
        heartbeat_store,
        queue_store,
        Arc::clone(&events),
        config.fleet.heartbeat.clone(),
    ));

    Ok(Arc::new(AppState::new(
        locker,
        queue,
        heartbeat,
        rate_limiter,
        events,
        notify,
        config.fleet.zones.clone(),
        config.fleet.hardware.clone(),
        config.zones_enabled,
    )))
}

/// Build the Axum router with all routes and middleware.
///
/// Each route module that mixes kiosk-facing and staff-facing endpoints
/// exposes both a `router()` (no identity required) and a `staff_router()`
/// (layered with [`require_staff`] before merging) — see the per-module doc
/// comments under `routes/` for which endpoints land in which.
fn build_router(state: Arc<AppState>) -> Router {
    let lockers = Router::new().merge(routes::lockers::router()).merge(
        routes::lockers::staff_router()
            .route_layer(axum_mw::from_fn_with_state(Arc::clone(&state), require_staff)),
    );

    let commands = Router::new().merge(routes::commands::router()).merge(
        routes::commands::staff_router()
            .route_layer(axum_mw::from_fn_with_state(Arc::clone(&state), require_staff)),
    );

    let zones = Router::new().merge(routes::zones::router()).merge(
        routes::zones::staff_router()
            .route_layer(axum_mw::from_fn_with_state(Arc::clone(&state), require_staff)),
    );

    let events = routes::events::router()
        .route_layer(axum_mw::from_fn_with_state(Arc::clone(&state), require_staff));

    let rate_limit = Router::new().merge(routes::ratelimit::router()).merge(
        routes::ratelimit::staff_router()
            .route_layer(axum_mw::from_fn_with_state(Arc::clone(&state), require_staff)),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderName::from_static("x-staff-user"),
        ]);

    Router::new()
        .nest("/v1/kiosks/{kiosk_id}/lockers", lockers)
        .nest("/v1/kiosks/{kiosk_id}/commands", commands)
        .nest("/v1/kiosks/{kiosk_id}/heartbeat", routes::heartbeat::router())
        .nest("/v1/kiosks", routes::heartbeat::list_router())
        .nest("/v1/zones", zones)
        .nest("/v1/events", events)
        .nest("/v1/rate-limit", rate_limit)
        .nest("/v1/notify", routes::notify::router())
        .layer(axum_mw::from_fn_with_state(Arc::clone(&state), rate_limit_ip))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}
