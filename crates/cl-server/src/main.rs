//! # Careline Server
//!
//! REST API + WebSocket gateway for real-time patient–doctor consultation
//! chat.

mod api;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use cl_realtime::ChatHub;

/// Shared application state available to all handlers.
pub struct AppState {
    pub db: sqlx::PgPool,
    pub config: cl_common::AppConfig,
    pub hub: Arc<ChatHub>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting Careline server...");

    // Load configuration
    let config = cl_common::AppConfig::load().expect("Failed to load configuration");

    // Connect to PostgreSQL
    let db = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;

    // Run migrations
    let migrator = sqlx::migrate::Migrator::new(std::path::Path::new("./migrations")).await?;
    migrator.run(&db).await?;
    tracing::info!("Database migrations applied");

    // The chat hub is constructed here and injected into handlers; its
    // router task lives for the life of the process.
    let (hub, _router_task) = ChatHub::new();

    // Build shared state
    let state = Arc::new(AppState {
        db,
        config: config.clone(),
        hub: hub.clone(),
    });

    // Reclaims connections whose peers went silent
    let _supervisor = cl_realtime::supervisor::start(hub);
    tracing::info!("Liveness supervisor started");

    // Build router
    let app = Router::new()
        .nest("/api", api::router(state.clone()))
        .nest("/ws", ws::router(state.clone()))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.api_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    tracing::info!("Shutdown signal received");
}
