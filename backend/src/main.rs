use std::{sync::Arc, time::Duration};

use quote_consensus::QuotePipeline;
use tracing_subscriber::EnvFilter;

mod api;
mod cache;
mod config;
mod database;
mod error;
mod service;
mod types;

use api::{AppState, create_router};
use cache::AggregateCache;
use config::Config;
use database::Database;
use service::QuoteService;

/// How often old history is pruned
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging; RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("🚀 Starting Quote Consensus Service...");

    // Load environment variables from .env file
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        "🔐 Trusting queue {} with {} oracles (quorum {})",
        config.queue.id,
        config.queue.len(),
        config.consensus.min_oracle_samples.max(config.queue.min_quorum)
    );

    // Initialize database connection
    tracing::info!("📊 Connecting to database...");
    let db = Arc::new(Database::new(&config.database_url).await?);
    db.migrate().await?;

    let pipeline = QuotePipeline::new(config.consensus.clone())?;
    let mut service = QuoteService::new(pipeline, config.queue.clone(), db);

    match config.slot_clock {
        Some(clock) => {
            tracing::info!(
                "⏱️ Slot clock: genesis {} ms, {} ms per slot",
                clock.genesis_ms,
                clock.slot_duration_ms
            );
            service = service.with_clock(Arc::new(clock));
        }
        None => tracing::warn!("SLOT_GENESIS_MS not set, quote slots are not checked"),
    }

    // Initialize Redis cache
    if let Some(redis_url) = &config.redis_url {
        tracing::info!("💾 Connecting to Redis...");
        let cache = AggregateCache::new(redis_url)
            .await?
            .with_ttl(config.cache_ttl_seconds);
        service = service.with_cache(Arc::new(cache));
    } else {
        tracing::info!("💾 REDIS_URL not set, serving without cache");
    }

    service.hydrate().await?;
    let service = Arc::new(service);

    // Retention: prune history on a fixed interval
    let retention = config.history_retention_days;
    let cleanup_service = service.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = cleanup_service.cleanup(retention).await {
                tracing::warn!("History cleanup failed: {}", e);
            }
        }
    });

    let app = create_router(AppState { service });

    tracing::info!("✅ All systems initialized!");
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    tracing::info!("🌐 Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
