//! Notice API server binary entrypoint.

use std::net::SocketAddr;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use notice_common::config::AppConfig;
use notice_common::db::{create_pool, run_migrations};
use notice_common::redis_pool::create_redis_pool;
use notice_notifier::runtime::DeliveryRuntime;

use notice_api::routes::create_router;
use notice_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("notice_api=debug,notice_engine=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Notice API server...");

    let config = AppConfig::from_env()?;

    let pool = create_pool(&config).await?;
    run_migrations(&pool).await?;

    let redis = create_redis_pool(&config.redis_url).await?;

    let runtime = DeliveryRuntime::build(pool, redis, &config)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let state = AppState::new(runtime.service, config);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
