//! API Server binary entrypoint.

use api_server::{ApiServer, ServerConfig};
use custody_core::config::Config;
use custody_core::db;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "api_server=debug,tower_http=debug,axum=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let core_config = Config::from_env()?;

    // Create database connection pool
    let pool = db::create_pool(&core_config.database).await?;

    // Run migrations (can be disabled via SKIP_MIGRATIONS=true for manual migration management)
    let skip_migrations = std::env::var("SKIP_MIGRATIONS")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    if !skip_migrations {
        tracing::info!("Running database migrations...");
        db::run_migrations(&pool).await?;
    } else {
        tracing::info!("Skipping migrations (SKIP_MIGRATIONS=true)");
    }

    // Create server config from environment
    let config = ServerConfig::from_env();

    // Create and run server
    let server = ApiServer::new(config, core_config, pool);
    server.run().await?;

    Ok(())
}
