//! Cuenty API Server
//!
//! Thin HTTP surface over the renewal engine: admin/reporting queries, the
//! subscription write operations, and the paid-order hook consumed by the
//! storefront. Authentication and catalog browsing live elsewhere.

mod error;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use cuenty_engine::{Engine, PgStore};
use cuenty_shared::AppConfig;
use tracing::info;

use crate::routes::create_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Configuration failures abort startup; automation never runs with
    // undefined schedules or half-configured channels.
    let config = AppConfig::from_env()?;

    let default_filter = if config.features.debug_logs { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    info!("Starting Cuenty API");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    // Run migrations on a dedicated single-connection pool first
    let migration_pool = cuenty_shared::create_migration_pool(&database_url).await?;
    cuenty_shared::run_migrations(&migration_pool).await?;
    migration_pool.close().await;
    info!("Migrations applied");

    let pool = cuenty_shared::create_pool(&database_url).await?;
    let store = Arc::new(PgStore::new(pool));
    let engine = Arc::new(Engine::from_config(config, store));

    let app = create_router(AppState { engine });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let addr: SocketAddr = bind_address
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid BIND_ADDRESS: {}", bind_address))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Cuenty API listening");
    axum::serve(listener, app).await?;

    Ok(())
}
