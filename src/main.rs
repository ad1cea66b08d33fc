// =============================================================================
// ORDER SERVICE - Main Entry Point
// =============================================================================
// Order lifecycle and inventory reservation service.
//
// WHAT THIS SERVICE DOES:
// - Takes storefront checkouts and third-party draft orders
// - Reserves physical stock, virtual items and promo quota at creation
// - Deducts on payment or fulfillment, releases on cancel and refund
// - Gates physical fulfillment behind a one-time shipping form
// - Issues serials for delivered goods
// - Exposes Prometheus metrics for observability
// =============================================================================

mod audit;
mod config;
mod db;
mod error;
mod handlers;
mod ledger;
mod memory;
mod metrics;
mod models;
mod notify;
mod order;
mod password;
mod permissions;
mod promo;
mod serial;
mod service;
mod shipping;
mod store;
mod sweeper;
mod virtual_pool;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, ConfigHandle};
use crate::db::Database;
use crate::memory::MemoryStore;
use crate::metrics::setup_metrics;
use crate::notify::{LogTransport, NotificationQueue};
use crate::permissions::PermissionCache;
use crate::service::OrderService;
use crate::store::Store;

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
pub struct AppState {
    pub service: Arc<OrderService>,

    /// Used directly only by the readiness probe.
    pub store: Arc<dyn Store>,

    /// Permission cache; `None` when REDIS_URL is unset.
    pub redis: Option<redis::aio::ConnectionManager>,

    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // RUST_LOG controls levels, e.g. RUST_LOG=info,order_service=debug
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,order_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Order Service...");

    let config = Config::from_env()?;
    info!(
        port = config.port,
        auto_cancel_hours = config.order.auto_cancel_hours,
        virtual_delivery_order = config.order.virtual_delivery_order.as_str(),
        "Configuration loaded"
    );

    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // -------------------------------------------------------------------------
    // Storage
    // -------------------------------------------------------------------------
    let store: Arc<dyn Store> = if config.uses_memory_store() {
        warn!("Using the in-memory store; data is lost on restart");
        Arc::new(MemoryStore::new())
    } else {
        let db = Database::connect(&config.database_url).await?;
        info!("Connected to PostgreSQL");
        db.run_migrations().await?;
        info!("Database migrations completed");
        Arc::new(db)
    };

    let redis = match &config.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str())?;
            let conn = redis::aio::ConnectionManager::new(client).await?;
            info!("Connected to Redis");
            Some(conn)
        }
        None => {
            info!("REDIS_URL not set; permission lookups go straight to the store");
            None
        }
    };

    // -------------------------------------------------------------------------
    // Background workers
    // -------------------------------------------------------------------------
    let shutdown = CancellationToken::new();
    let (notifier, notify_worker) =
        NotificationQueue::start(Arc::new(LogTransport), config.notify_max_attempts, shutdown.clone());

    let port = config.port;
    let config = ConfigHandle::new(config);
    let service = Arc::new(OrderService::new(
        store.clone(),
        config.clone(),
        Arc::new(notifier),
        PermissionCache::new(redis.clone(), store.clone()),
    ));
    let sweeper = sweeper::spawn(service.clone(), shutdown.clone());
    spawn_config_reloader(config, shutdown.clone());

    let state = Arc::new(AppState { service, store, redis, metrics_handle });

    // -------------------------------------------------------------------------
    // Routes
    // -------------------------------------------------------------------------
    let api = Router::new()
        // ----- Stocks -----
        .route("/stocks", get(handlers::list_stocks).post(handlers::create_stock))
        .route("/stocks/alerts", get(handlers::low_stock_alerts))
        .route("/stocks/:id", get(handlers::get_stock))
        .route("/stocks/:id/adjust", post(handlers::adjust_stock))
        .route("/stocks/:id/in", post(handlers::stock_in))
        // ----- Virtual pools -----
        .route("/pools", post(handlers::create_pool))
        .route("/pools/:id", get(handlers::get_pool))
        .route("/pools/:id/items", get(handlers::list_items).post(handlers::import_items))
        .route("/items/:id/invalidate", post(handlers::invalidate_item))
        // ----- Catalog -----
        .route("/products", post(handlers::create_product))
        .route("/products/:sku", get(handlers::get_product))
        .route("/promo-codes", post(handlers::create_promo))
        .route("/promo-codes/validate", post(handlers::validate_promo))
        .route("/promo-codes/:code", get(handlers::get_promo))
        // ----- Orders -----
        .route("/orders", post(handlers::checkout))
        .route("/orders/draft", post(handlers::create_draft))
        .route("/orders/:order_no", get(handlers::get_order))
        .route("/orders/:order_no/events", get(handlers::order_events))
        .route("/orders/:order_no/serials", get(handlers::order_serials))
        .route("/orders/:order_no/pay", post(handlers::confirm_payment))
        .route("/orders/:order_no/resubmit", post(handlers::request_resubmit))
        .route("/orders/:order_no/form-link", post(handlers::refresh_form))
        .route("/orders/:order_no/ship", post(handlers::assign_tracking))
        .route("/orders/:order_no/deliver", post(handlers::deliver_virtual))
        .route("/orders/:order_no/complete", post(handlers::confirm_receipt))
        .route("/orders/:order_no/cancel", post(handlers::cancel_order))
        .route("/orders/:order_no/refund", post(handlers::refund_order))
        .route("/orders/:order_no/remark", post(handlers::add_admin_remark))
        // ----- Shipping forms -----
        .route("/forms/:token", get(handlers::get_form).post(handlers::submit_form))
        // ----- Audit, serials, permissions -----
        .route("/inventory/logs", get(handlers::inventory_logs))
        .route("/serials/:serial/verify", get(handlers::verify_serial))
        .route("/admins/:user_id/permissions", put(handlers::update_permissions));

    let app = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .nest("/api/v1", api)
        .route_layer(middleware::from_fn(handlers::track_metrics))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "Order Service is listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // The server only returns after the token fired.
    shutdown.cancel();
    for (name, handle) in [("sweeper", sweeper), ("notifications", notify_worker)] {
        if let Err(e) = handle.await {
            error!(worker = name, error = %e, "Worker ended abnormally");
        }
    }
    info!("Order Service stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM, or when something else cancels `shutdown`.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal, shutting down gracefully..."),
        _ = terminate => info!("Received SIGTERM signal, shutting down gracefully..."),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

/// SIGHUP re-reads `.env` and the environment and publishes a new snapshot.
/// A config that fails validation is logged and the old one kept.
#[cfg(unix)]
fn spawn_config_reloader(config: ConfigHandle, shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGHUP handler; config reload disabled");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = hangup.recv() => match config.reload_from_env() {
                    Ok(next) => info!(
                        auto_cancel_hours = next.order.auto_cancel_hours,
                        sweep_interval_secs = next.order.sweep_interval_secs,
                        "Configuration reloaded"
                    ),
                    Err(e) => error!(error = %e, "Configuration reload failed; keeping previous config"),
                },
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_config_reloader(_config: ConfigHandle, _shutdown: CancellationToken) {}
