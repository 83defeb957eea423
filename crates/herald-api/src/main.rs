//! Herald API server: admin HTTP surface plus the dispatcher pool.

use herald_api::{AppState, routes};
use herald_config::{LogFormat, SystemConfig, load_from_env};
use herald_core::{HandlerRegistry, SystemClock};
use herald_db::{JobStore, PgJobStore, create_pool, run_migrations};
use herald_dispatcher::{Dispatcher, WebhookHandler};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_from_env()?;
    init_tracing(&config);

    info!("Connecting to database...");
    let pool = create_pool(&config.database.url, config.database.max_connections).await?;
    run_migrations(&pool).await?;
    info!("Database connected");

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));

    let registry = HandlerRegistry::new().with(WebhookHandler::new(&config.webhook)?)?;
    let dispatcher = Dispatcher::new(
        config.dispatcher.clone(),
        config.backoff,
        store.clone(),
        registry,
    );
    let workers = dispatcher.start();

    let state = AppState::new(store, Arc::new(SystemClock), config.dispatcher.max_attempts);
    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", config.server.listen);
    let listener = TcpListener::bind(config.server.listen).await?;
    let token = workers.token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
                _ = token.cancelled() => {}
            }
        })
        .await?;

    workers.shutdown().await;
    Ok(())
}

fn init_tracing(config: &SystemConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}
