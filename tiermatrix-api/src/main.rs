use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tiermatrix_api::{app, AppState, EngineSettings};
use tiermatrix_catalog::HierarchyConfig;
use tiermatrix_core::{CachedTierStore, MemoryTierCache, MemoryTierStore, TierCache, TierStore};
use tiermatrix_session::ReconcilerConfig;
use tiermatrix_store::{Config, DbClient, PgTierStore, RedisClient, RedisTierCache};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tiermatrix_api=debug,tiermatrix_session=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Tiermatrix API on port {}", config.server.port);

    let store: Arc<dyn TierStore> = match &config.database.url {
        Some(url) => {
            let db = DbClient::new(url).await.context("Failed to connect to Postgres")?;
            db.migrate().await.context("Failed to run migrations")?;
            Arc::new(PgTierStore::new(db.pool))
        }
        None => {
            tracing::warn!("No database configured, using the in-memory store");
            Arc::new(MemoryTierStore::new())
        }
    };

    let cache: Arc<dyn TierCache> = match &config.redis.url {
        Some(url) => {
            let redis = RedisClient::new(url).await.context("Failed to connect to Redis")?;
            Arc::new(RedisTierCache::new(redis, config.engine.cache_ttl_seconds))
        }
        None => Arc::new(MemoryTierCache::new(Duration::from_secs(config.engine.cache_ttl_seconds))),
    };
    let store: Arc<dyn TierStore> = Arc::new(CachedTierStore::new(store, cache));

    let settings = EngineSettings {
        reconciler: ReconcilerConfig {
            batch_size: config.engine.batch_size,
            refresh_baseline: config.engine.refresh_baseline,
        },
        debounce: Duration::from_millis(config.engine.debounce_ms),
        hierarchy: HierarchyConfig {
            discriminating_keys: config.engine.discriminating_keys.clone(),
        },
    };

    let app = app(AppState::new(store, settings));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
