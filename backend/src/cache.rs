//! Redis Cache Layer
//!
//! Publishes the latest accepted state of every feed so readers never touch
//! the database or wait on the pipeline lock.
//!
//! # Architecture
//! ```text
//! Update accepted → Persist → Write cache (feed:{id})
//!
//! Read → Check Cache → Hit? → Return
//!           ↓
//!         Miss? → Quote store → Store Cache → Return
//! ```
//!
//! # Cache Strategy
//! - TTL: configurable, 60 seconds by default
//! - Key format: "feed:{hex feed id}"
//! - Stores JSON-serialized StoredState
//!
//! The cache is never authoritative: a write failure is logged, the feed's
//! entry is evicted so readers fall back to the store, and the update still
//! stands.

use crate::error::Result;
use async_trait::async_trait;
use quote_consensus::{FeedId, StoredState};
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::{debug, warn};

/// Default cache TTL (Time To Live) in seconds
pub const DEFAULT_CACHE_TTL: u64 = 60;

/// Read-through cache of published feed states.
#[async_trait]
pub trait StateCache: Send + Sync {
    /// Publish a feed state, replacing whatever was cached for the feed.
    async fn set_state(&self, state: &StoredState) -> Result<()>;

    /// `None` on a miss or an expired entry.
    async fn get_state(&self, feed_id: &FeedId) -> Result<Option<StoredState>>;

    /// Drop a feed from the cache, forcing the next read through the store.
    async fn delete_state(&self, feed_id: &FeedId) -> Result<()>;

    async fn health_check(&self) -> bool;
}

/// Redis cache of published feed states
#[derive(Clone)]
pub struct AggregateCache {
    /// Redis connection manager (handles reconnection automatically)
    connection: ConnectionManager,

    /// Cache TTL in seconds
    ttl: u64,
}

impl AggregateCache {
    /// Connect to Redis
    ///
    /// # Example
    /// ```rust
    /// let cache = AggregateCache::new("redis://127.0.0.1").await?;
    /// ```
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;

        debug!("Redis cache connected to {}", redis_url);

        Ok(Self {
            connection,
            ttl: DEFAULT_CACHE_TTL,
        })
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    /// Cache key of a feed
    ///
    /// # Format
    /// "feed:{hex feed id}"
    pub fn make_key(feed_id: &FeedId) -> String {
        format!("feed:{}", feed_id.to_hex())
    }
}

#[async_trait]
impl StateCache for AggregateCache {
    async fn set_state(&self, state: &StoredState) -> Result<()> {
        let key = Self::make_key(&state.feed_id);
        let json = serde_json::to_string(state)?;

        let mut connection = self.connection.clone();
        connection.set_ex::<_, _, ()>(&key, json, self.ttl).await?;

        debug!("Cached state for {} (TTL: {}s)", state.feed_id, self.ttl);
        Ok(())
    }

    async fn get_state(&self, feed_id: &FeedId) -> Result<Option<StoredState>> {
        let key = Self::make_key(feed_id);

        let mut connection = self.connection.clone();
        let cached: Option<String> = connection.get(&key).await?;

        match cached {
            Some(json) => {
                debug!("Cache HIT for {}", feed_id);
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => {
                debug!("Cache MISS for {}", feed_id);
                Ok(None)
            }
        }
    }

    async fn delete_state(&self, feed_id: &FeedId) -> Result<()> {
        let key = Self::make_key(feed_id);

        let mut connection = self.connection.clone();
        connection.del::<_, ()>(&key).await?;

        debug!("Deleted cache for {}", feed_id);
        Ok(())
    }

    /// Check if cache is healthy (can connect to Redis)
    async fn health_check(&self) -> bool {
        let mut connection = self.connection.clone();
        match redis::cmd("PING")
            .query_async::<_, String>(&mut connection)
            .await
        {
            Ok(response) if response == "PONG" => {
                debug!("Redis health check passed");
                true
            }
            Ok(response) => {
                warn!("Redis health check failed: unexpected response {}", response);
                false
            }
            Err(e) => {
                warn!("Redis health check failed: {}", e);
                false
            }
        }
    }
}
