mod api;
mod config;
mod error;
mod models;
mod services;

use crate::api::AppState;
use crate::config::Config;
use crate::services::preheat::PreheatService;
use crate::services::storage::FsStorage;
use crate::services::transcode::{TranscodeConfig, TranscodeWorker};
use crate::services::{
    AuthService, CatalogClient, ProgressiveHlsManager, RoomCache, RoomHub, RoomManager, RoomStore,
    StreamProcessor,
};
use axum::{
    http::{header, Method},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,soundroom=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    // Connect to database
    let db = PgPoolOptions::new()
        .max_connections(50)
        .connect(&config.database_url)
        .await?;
    tracing::info!("Connected to database");

    // Run migrations
    sqlx::migrate!("./migrations").run(&db).await?;
    tracing::info!("Database migrations completed");

    // Connect to Redis
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis = redis::aio::ConnectionManager::new(redis_client.clone()).await?;
    tracing::info!("Connected to Redis");

    // Object storage
    tokio::fs::create_dir_all(&config.storage_root).await?;
    let storage = Arc::new(FsStorage::new(config.storage_root.clone()));
    tracing::info!("Object storage rooted at {:?}", config.storage_root);

    // Initialize services
    let instance_id = uuid::Uuid::new_v4().simple().to_string();
    let cache = RoomCache::new(redis, redis_client, instance_id.clone());
    let store = RoomStore::new(db.clone());
    let auth = Arc::new(AuthService::new(&config));

    let hls = Arc::new(ProgressiveHlsManager::new());
    hls.spawn_janitor();

    let worker = TranscodeWorker::new(TranscodeConfig {
        ffmpeg_path: config.ffmpeg_path.clone(),
        bitrate: config.hls_bitrate,
        segment_seconds: config.hls_segment_seconds,
    });
    let streams = Arc::new(StreamProcessor::new(
        Arc::clone(&hls),
        storage,
        cache.clone(),
        worker,
    ));

    let catalog = config.catalog_url.as_ref().map(|url| {
        tracing::info!("Song search enabled against {}", url);
        Arc::new(CatalogClient::new(url.clone()))
    });
    if catalog.is_none() {
        tracing::warn!("Song search disabled - CATALOG_URL not set");
    }

    let hub = Arc::new(RoomHub::new());
    // Bridge cache pub/sub into the hub so every instance delivers to its
    // own connections.
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    cache.spawn_event_listener(event_tx);
    hub.forward_envelopes(event_rx);

    let manager = Arc::new(RoomManager::new(
        store.clone(),
        cache.clone(),
        Arc::clone(&hub),
        Arc::clone(&streams),
        catalog,
    ));

    PreheatService::new(
        cache.clone(),
        store,
        Arc::clone(&streams),
        Duration::from_secs(config.preheat_interval_secs),
    )
    .spawn();

    let app_state = Arc::new(AppState {
        auth,
        manager,
        streams,
    });

    // Build router
    let app = Router::new()
        .nest("/api", api::room_routes())
        .merge(api::stream_routes())
        .merge(api::ws_routes())
        .with_state(app_state)
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        );

    // Start server
    let addr = format!("{}:{}", config.server_host, config.server_port);
    tracing::info!("Starting server on {} (instance {})", addr, instance_id);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
