pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod seed;
pub mod store;

// Export API types
pub use api::handlers;
pub use api::routes;

pub use cache::{CacheMode, IdentityCache, LazyRef, ReferenceRegistry};
pub use error::{DataSetError, Result};

pub use logic::{
    AssemblyStats, DataSetListGraph, GraphBuilder, OverrideResolver, ResolvedValue, TreeAssembler, ValueFormatter,
    ValueSource,
};

// Export all model types
pub use model::*;

pub use seed::*;

// Export store types
pub use store::{MemoryStore, PostgresStore, RowSource, Store};

use crate::api::handlers::AppState;
use crate::config::AppConfig;
use std::sync::Arc;

/// Serve the HTTP API on `config.server` over `store`
pub async fn serve_store<S: Store + 'static>(store: Arc<S>, config: AppConfig) -> anyhow::Result<()> {
    use anyhow::Context;
    use tokio::net::TcpListener;

    if std::env::var("LOAD_SEED_DATA").unwrap_or_default() == "true" {
        log::info!("Loading seed data...");
        seed::load_seed_data(&*store).await?;
    }

    let bind_address = config.server_address();
    let app = crate::api::routes::create_router().with_state(AppState::new(store, config));

    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    log::info!("datasets server running on http://{}", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Load configuration, pick a store and serve
pub async fn run_server() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();

    let config = AppConfig::load()?;
    log::info!(
        "Configuration loaded: server={} cache={:?}",
        config.server_address(),
        config.cache.mode
    );

    match config.database_url() {
        Some(database_url) => {
            log::info!("Connecting to PostgreSQL...");
            let store = PostgresStore::new(&database_url, config.max_connections())
                .await?
                .with_max_chain_depth(config.graph.max_chain_depth);
            log::info!("Running database migrations...");
            store.migrate().await?;
            serve_store(Arc::new(store), config).await
        }
        None => {
            log::warn!("No DATABASE_URL or database.connection_string set; data lives in memory only");
            let store = MemoryStore::new().with_max_chain_depth(config.graph.max_chain_depth);
            serve_store(Arc::new(store), config).await
        }
    }
}
