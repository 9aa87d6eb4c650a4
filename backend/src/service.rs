//! Quote Service
//!
//! Glue between the HTTP surface and the consensus pipeline. One service owns
//! the consumer's quote store; every update batch runs under its lock so
//! commits for a feed never interleave.
//!
//! # Flow
//! ```text
//! UpdateRequest → unbundle → pipeline (staged copy) → persist → swap in → cache → summary
//! ```

use crate::{
    cache::StateCache,
    database::{AggregateRecord, HistoryStore, RejectionRecord},
    error::{Result, ServiceError},
    types::{ServiceStats, UpdateRequest, UpdateSummary},
};
use chrono::{Duration, Utc};
use quote_consensus::{
    ChainClock, ChainTime, FeedId, MemoryQuoteStore, Queue, QueueId, QuotePipeline, QuoteStore,
    StaticQueueRegistry, StoredState, canonical_quote_key, wire,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Largest page the history endpoints hand out.
pub const MAX_PAGE: i64 = 1_000;

fn unix_now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Wall-clock time; no slot, so slot freshness is not enforced.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ChainClock for SystemClock {
    fn now(&self) -> ChainTime {
        ChainTime::at(unix_now_ms())
    }
}

/// Wall-clock time plus the slot a fixed-rate chain would be at.
///
/// Slot `n` starts at `genesis_ms + n * slot_duration_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotClock {
    pub genesis_ms: u64,
    pub slot_duration_ms: u64,
}

impl SlotClock {
    pub fn at(&self, unix_ms: u64) -> ChainTime {
        let slot = unix_ms.saturating_sub(self.genesis_ms) / self.slot_duration_ms.max(1);
        ChainTime::with_slot(unix_ms, slot)
    }
}

impl ChainClock for SlotClock {
    fn now(&self) -> ChainTime {
        self.at(unix_now_ms())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub database: bool,
    /// `None` when no cache is configured
    pub cache: Option<bool>,
    pub feeds: usize,
    pub stats: ServiceStats,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.database && self.cache.unwrap_or(true)
    }
}

pub struct QuoteService {
    pipeline: QuotePipeline,
    registry: StaticQueueRegistry,
    queue_id: QueueId,
    store: Mutex<MemoryQuoteStore>,
    history: Arc<dyn HistoryStore>,
    cache: Option<Arc<dyn StateCache>>,
    clock: Arc<dyn ChainClock + Send + Sync>,
    stats: Mutex<ServiceStats>,
}

impl QuoteService {
    pub fn new(pipeline: QuotePipeline, queue: Queue, history: Arc<dyn HistoryStore>) -> Self {
        let queue_id = queue.id;
        Self {
            pipeline,
            registry: StaticQueueRegistry::new().with_queue(queue),
            queue_id,
            store: Mutex::new(MemoryQuoteStore::new()),
            history,
            cache: None,
            clock: Arc::new(SystemClock),
            stats: Mutex::new(ServiceStats::default()),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn StateCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn ChainClock + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Load every persisted feed state into the quote store.
    ///
    /// Call once on startup, before serving updates.
    pub async fn hydrate(&self) -> Result<usize> {
        let states = self.history.load_states().await?;
        let count = states.len();

        let mut store = self.store.lock().await;
        for state in states {
            store.load(state);
        }

        info!("Hydrated {} feed states", count);
        Ok(count)
    }

    /// Run one batch of oracle responses through the pipeline.
    ///
    /// The pipeline commits into a copy of the store. The copy replaces the
    /// live store only once the batch is persisted, so a failed write leaves
    /// every feed where it was. Persisting and publishing to the cache both
    /// happen under the store lock, in commit order.
    pub async fn submit(&self, request: UpdateRequest) -> Result<UpdateSummary> {
        let UpdateRequest {
            mut responses,
            bundle,
            feeds,
        } = request;

        if let Some(bundle) = bundle {
            let bytes = hex::decode(bundle.trim().trim_start_matches("0x"))
                .map_err(|e| ServiceError::InvalidRequest(format!("bundle is not hex: {e}")))?;
            responses.extend(wire::decode_bundle(&bytes)?);
        }
        if responses.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "batch contains no oracle responses".to_string(),
            ));
        }
        if feeds.as_ref().is_some_and(Vec::is_empty) {
            return Err(ServiceError::InvalidRequest(
                "feeds must not be empty when given".to_string(),
            ));
        }

        let mut store = self.store.lock().await;
        let mut staged = store.clone();
        let report = self.pipeline.run_with_registry(
            &responses,
            &self.registry,
            &self.queue_id,
            self.clock.as_ref(),
            &mut staged,
            feeds.as_deref(),
        )?;

        let updated: Vec<FeedId> = match feeds {
            Some(feeds) => feeds,
            None => report.outcomes.keys().copied().collect(),
        };
        let summary =
            UpdateSummary::from_report(&report, canonical_quote_key(&self.queue_id, &updated));

        if let Err(e) = self
            .history
            .record_batch(&summary.accepted, &summary.rejected)
            .await
        {
            warn!("Discarding batch, persisting it failed: {}", e);
            return Err(e);
        }
        *store = staged;

        if let Some(cache) = &self.cache {
            for state in &summary.accepted {
                publish(cache.as_ref(), state).await;
            }
        }
        drop(store);

        self.stats.lock().await.record(&summary);

        info!(
            "Processed batch of {} responses: {} accepted, {} rejected, {} dropped",
            responses.len(),
            summary.accepted.len(),
            summary.rejected.len(),
            summary.dropped.len()
        );

        Ok(summary)
    }

    /// Latest accepted state of a feed, served from the cache when possible.
    pub async fn latest(&self, feed_id: &FeedId) -> Result<StoredState> {
        if let Some(cache) = &self.cache {
            match cache.get_state(feed_id).await {
                Ok(Some(state)) => return Ok(state),
                Ok(None) => {}
                Err(e) => warn!("Cache read failed for {}: {}", feed_id, e),
            }
        }

        // Held while refilling the cache so a concurrent commit cannot be
        // overwritten by this older state.
        let store = self.store.lock().await;
        let state = store
            .get(feed_id)
            .ok_or_else(|| ServiceError::NotFound(format!("feed {feed_id}")))?;

        if let Some(cache) = &self.cache {
            publish(cache.as_ref(), &state).await;
        }

        Ok(state)
    }

    pub async fn feeds(&self) -> Vec<StoredState> {
        self.store.lock().await.feeds().cloned().collect()
    }

    pub async fn history(&self, feed_id: &FeedId, limit: i64) -> Result<Vec<AggregateRecord>> {
        self.history.history(feed_id, clamp_page(limit)).await
    }

    pub async fn rejections(&self, limit: i64) -> Result<Vec<RejectionRecord>> {
        self.history.rejections(clamp_page(limit)).await
    }

    pub async fn health(&self) -> HealthReport {
        let database = self.history.health_check().await;
        let cache = match &self.cache {
            Some(cache) => Some(cache.health_check().await),
            None => None,
        };

        HealthReport {
            database,
            cache,
            feeds: self.store.lock().await.len(),
            stats: self.stats.lock().await.clone(),
        }
    }

    /// Drop history older than `retention_days`.
    pub async fn cleanup(&self, retention_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        self.history.cleanup(cutoff).await
    }
}

/// Write a state to the cache. On failure the feed's entry is evicted, since
/// whatever it still holds is older than the store.
async fn publish(cache: &dyn StateCache, state: &StoredState) {
    let Err(e) = cache.set_state(state).await else {
        return;
    };
    warn!("Failed to cache state for {}: {}", state.feed_id, e);

    match cache.delete_state(&state.feed_id).await {
        Ok(()) => debug!("Evicted cached state for {}", state.feed_id),
        Err(e) => warn!("Failed to evict cached state for {}: {}", state.feed_id, e),
    }
}

fn clamp_page(limit: i64) -> i64 {
    limit.clamp(1, MAX_PAGE)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::RejectedFeed;
    use async_trait::async_trait;
    use chrono::DateTime;
    use quote_consensus::wire::{FeedValue, QuoteMessage};
    use quote_consensus::{
        ConsensusConfig, FixedClock, FixedPoint, QuoteSigner, RawOracleResponse, Stage,
    };
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    pub const QUEUE: QueueId = QueueId::new([0x51; 32]);
    pub const NOW_MS: u64 = 1_700_000_000_000;

    /// History kept in memory, for tests that do not need PostgreSQL.
    #[derive(Default)]
    pub struct MemoryHistory {
        pub accepted: StdMutex<Vec<StoredState>>,
        pub rejected: StdMutex<Vec<RejectedFeed>>,
        /// Makes every write fail, as if the database were unreachable.
        pub fail_writes: AtomicBool,
    }

    #[async_trait]
    impl HistoryStore for MemoryHistory {
        async fn load_states(&self) -> Result<Vec<StoredState>> {
            let mut latest: Vec<StoredState> = Vec::new();
            for state in self.accepted.lock().unwrap().iter() {
                latest.retain(|s| s.feed_id != state.feed_id);
                latest.push(state.clone());
            }
            Ok(latest)
        }

        async fn record_batch(
            &self,
            accepted: &[StoredState],
            rejected: &[RejectedFeed],
        ) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(ServiceError::DatabaseError(sqlx::Error::PoolTimedOut));
            }
            self.accepted.lock().unwrap().extend_from_slice(accepted);
            self.rejected.lock().unwrap().extend_from_slice(rejected);
            Ok(())
        }

        async fn history(&self, feed_id: &FeedId, limit: i64) -> Result<Vec<AggregateRecord>> {
            Ok(self
                .accepted
                .lock()
                .unwrap()
                .iter()
                .rev()
                .filter(|s| &s.feed_id == feed_id)
                .take(limit as usize)
                .enumerate()
                .map(|(i, s)| AggregateRecord {
                    id: i as i64,
                    feed_id: s.feed_id,
                    value: s.value,
                    timestamp_ms: s.timestamp_ms,
                    slot: s.slot,
                    num_oracles: s.num_oracles,
                    update_count: s.update_count,
                    created_at: Utc::now(),
                })
                .collect())
        }

        async fn rejections(&self, limit: i64) -> Result<Vec<RejectionRecord>> {
            Ok(self
                .rejected
                .lock()
                .unwrap()
                .iter()
                .rev()
                .take(limit as usize)
                .enumerate()
                .map(|(i, r)| RejectionRecord::new(i as i64, r, Utc::now()))
                .collect())
        }

        async fn cleanup(&self, _before: DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    /// Cache kept in memory. The first write can be held back to let a
    /// concurrent batch run in the meantime.
    #[derive(Default)]
    struct MemoryCache {
        entries: StdMutex<HashMap<FeedId, StoredState>>,
        fail_writes: AtomicBool,
        delay_first_write: AtomicBool,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl StateCache for MemoryCache {
        async fn set_state(&self, state: &StoredState) -> Result<()> {
            if self.delay_first_write.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(ServiceError::RedisError(redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "connection refused",
                ))));
            }
            self.entries
                .lock()
                .unwrap()
                .insert(state.feed_id, state.clone());
            Ok(())
        }

        async fn get_state(&self, feed_id: &FeedId) -> Result<Option<StoredState>> {
            Ok(self.entries.lock().unwrap().get(feed_id).cloned())
        }

        async fn delete_state(&self, feed_id: &FeedId) -> Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.entries.lock().unwrap().remove(feed_id);
            Ok(())
        }

        async fn health_check(&self) -> bool {
            !self.fail_writes.load(Ordering::SeqCst)
        }
    }

    pub fn btc() -> FeedId {
        FeedId::derive(b"BTC/USD")
    }

    pub fn signers() -> Vec<QuoteSigner> {
        (1..=4).map(QuoteSigner::from_seed).collect()
    }

    pub fn service(history: Arc<MemoryHistory>) -> QuoteService {
        service_with(history, ConsensusConfig::default(), ChainTime::at(NOW_MS))
    }

    fn service_with(
        history: Arc<MemoryHistory>,
        config: ConsensusConfig,
        now: ChainTime,
    ) -> QuoteService {
        let queue = Queue::new(QUEUE, signers().iter().map(|s| s.oracle_key()), 1);
        let pipeline = QuotePipeline::new(config).unwrap();

        QuoteService::new(pipeline, queue, history).with_clock(Arc::new(FixedClock(now)))
    }

    pub fn btc_responses(values: &[&str]) -> Vec<RawOracleResponse> {
        signed_btc(values, NOW_MS - 1_000, 10)
    }

    fn signed_btc(values: &[&str], timestamp_ms: u64, slot: u64) -> Vec<RawOracleResponse> {
        signers()
            .iter()
            .zip(values)
            .map(|(signer, value)| {
                let message = QuoteMessage {
                    queue: QUEUE,
                    slot,
                    timestamp_ms,
                    feeds: vec![FeedValue {
                        feed_id: btc(),
                        value: value.parse().unwrap(),
                        min_oracle_samples: 1,
                    }],
                };
                signer.sign_message(&message).unwrap()
            })
            .collect()
    }

    fn request(responses: Vec<RawOracleResponse>) -> UpdateRequest {
        UpdateRequest {
            responses,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_submit_persists_and_counts() {
        let history = Arc::new(MemoryHistory::default());
        let service = service(history.clone());

        let summary = service
            .submit(request(btc_responses(&["100.0", "100.1", "99.9", "100.05"])))
            .await
            .unwrap();

        assert_eq!(summary.accepted.len(), 1);
        assert_eq!(summary.accepted[0].value, "100.025".parse::<FixedPoint>().unwrap());
        assert_eq!(summary.canonical_key, canonical_quote_key(&QUEUE, &[btc()]));
        assert_eq!(history.accepted.lock().unwrap().len(), 1);

        let latest = service.latest(&btc()).await.unwrap();
        assert_eq!(latest.update_count, 1);

        let health = service.health().await;
        assert!(health.is_healthy());
        assert_eq!(health.feeds, 1);
        assert_eq!(health.stats.batches_processed, 1);
        assert_eq!(health.stats.feeds_accepted, 1);
    }

    #[tokio::test]
    async fn test_rejections_are_recorded() {
        let history = Arc::new(MemoryHistory::default());
        let service = service(history.clone());

        let summary = service
            .submit(request(btc_responses(&["100", "100", "130"])))
            .await
            .unwrap();

        assert!(summary.accepted.is_empty());
        assert_eq!(summary.rejected[0].stage, Stage::FreshnessChecked);

        let rejections = service.rejections(10).await.unwrap();
        assert_eq!(rejections.len(), 1);
        assert!(rejections[0].is_stage(Stage::FreshnessChecked));
        assert!(service.latest(&btc()).await.is_err());
    }

    #[tokio::test]
    async fn test_bundle_and_requested_feeds() {
        let history = Arc::new(MemoryHistory::default());
        let service = service(history);

        let bundle = wire::encode_bundle(&btc_responses(&["100", "100", "100"])).unwrap();
        let eth = FeedId::derive(b"ETH/USD");
        let summary = service
            .submit(UpdateRequest {
                responses: Vec::new(),
                bundle: Some(format!("0x{}", hex::encode(bundle))),
                feeds: Some(vec![btc(), eth]),
            })
            .await
            .unwrap();

        assert_eq!(summary.accepted.len(), 1);
        assert_eq!(summary.rejected.len(), 1);
        assert_eq!(summary.rejected[0].feed_id, eth);
        assert_eq!(summary.canonical_key, canonical_quote_key(&QUEUE, &[btc(), eth]));
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let service = service(Arc::new(MemoryHistory::default()));

        assert!(matches!(
            service.submit(UpdateRequest::default()).await,
            Err(ServiceError::InvalidRequest(_))
        ));
        assert!(matches!(
            service
                .submit(UpdateRequest {
                    bundle: Some("zz".to_string()),
                    ..Default::default()
                })
                .await,
            Err(ServiceError::InvalidRequest(_))
        ));
        assert!(matches!(
            service
                .submit(UpdateRequest {
                    bundle: Some("01".to_string()),
                    ..Default::default()
                })
                .await,
            Err(ServiceError::InvalidBundle(_))
        ));
        assert!(matches!(
            service
                .submit(UpdateRequest {
                    responses: btc_responses(&["100"]),
                    feeds: Some(Vec::new()),
                    ..Default::default()
                })
                .await,
            Err(ServiceError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_hydrate_restores_store() {
        let history = Arc::new(MemoryHistory::default());
        service(history.clone())
            .submit(request(btc_responses(&["100", "100", "100"])))
            .await
            .unwrap();

        let restarted = service(history);
        assert_eq!(restarted.hydrate().await.unwrap(), 1);

        // Without the restored state this jump would pass as a first update.
        let summary = restarted
            .submit(request(btc_responses(&["200", "200", "200"])))
            .await
            .unwrap();
        assert!(summary.accepted.is_empty());
        assert_eq!(summary.rejected[0].stage, Stage::ConsensusEvaluated);
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_store_untouched() {
        let history = Arc::new(MemoryHistory::default());
        let service = service(history.clone());

        service
            .submit(request(btc_responses(&["100", "100", "100"])))
            .await
            .unwrap();

        history.fail_writes.store(true, Ordering::SeqCst);
        let result = service
            .submit(request(btc_responses(&["101", "101", "101"])))
            .await;
        assert!(matches!(result, Err(ServiceError::DatabaseError(_))));

        let latest = service.latest(&btc()).await.unwrap();
        assert_eq!(latest.value, FixedPoint::from_integer(100));
        assert_eq!(latest.update_count, 1);
        assert_eq!(history.accepted.lock().unwrap().len(), 1);

        // Once the database is back, the same batch goes through.
        history.fail_writes.store(false, Ordering::SeqCst);
        let summary = service
            .submit(request(btc_responses(&["101", "101", "101"])))
            .await
            .unwrap();
        assert_eq!(summary.accepted[0].update_count, 2);
    }

    #[tokio::test]
    async fn test_concurrent_batches_publish_in_commit_order() {
        let cache = Arc::new(MemoryCache::default());
        cache.delay_first_write.store(true, Ordering::SeqCst);
        let service = service(Arc::new(MemoryHistory::default())).with_cache(cache.clone());

        let older = request(signed_btc(&["100", "100", "100"], NOW_MS - 2_000, 10));
        let newer = request(signed_btc(&["101", "101", "101"], NOW_MS - 1_000, 11));
        let (first, second) = tokio::join!(service.submit(older), service.submit(newer));
        first.unwrap();
        second.unwrap();

        let stored = service.feeds().await;
        let cached = cache.get_state(&btc()).await.unwrap().unwrap();
        assert_eq!(cached, stored[0]);
        assert_eq!(cached.value, FixedPoint::from_integer(101));
    }

    #[tokio::test]
    async fn test_cache_write_failure_evicts_entry() {
        let cache = Arc::new(MemoryCache::default());
        let service = service(Arc::new(MemoryHistory::default())).with_cache(cache.clone());

        service
            .submit(request(btc_responses(&["100", "100", "100"])))
            .await
            .unwrap();
        assert!(cache.get_state(&btc()).await.unwrap().is_some());

        cache.fail_writes.store(true, Ordering::SeqCst);
        service
            .submit(request(signed_btc(&["101", "101", "101"], NOW_MS - 500, 11)))
            .await
            .unwrap();

        assert_eq!(cache.deletes.load(Ordering::SeqCst), 1);
        assert!(cache.get_state(&btc()).await.unwrap().is_none());

        // Readers fall through to the store and see the new state.
        let latest = service.latest(&btc()).await.unwrap();
        assert_eq!(latest.value, FixedPoint::from_integer(101));
        assert!(!service.health().await.is_healthy());
    }

    #[test]
    fn test_slot_clock() {
        let clock = SlotClock {
            genesis_ms: 1_000,
            slot_duration_ms: 400,
        };

        assert_eq!(clock.at(1_000), ChainTime::with_slot(1_000, 0));
        assert_eq!(clock.at(1_399), ChainTime::with_slot(1_399, 0));
        assert_eq!(clock.at(5_000), ChainTime::with_slot(5_000, 10));
        assert_eq!(clock.at(0).slot, Some(0));
        assert!(clock.now().slot.is_some());
    }

    #[tokio::test]
    async fn test_slot_age_is_enforced_with_a_slot_clock() {
        let config = ConsensusConfig {
            max_slot_age: Some(30),
            ..ConsensusConfig::default()
        };
        let now = ChainTime::with_slot(NOW_MS, 1_000);
        let history = Arc::new(MemoryHistory::default());
        let service = service_with(history.clone(), config, now);

        let summary = service
            .submit(request(signed_btc(&["100", "100", "100"], NOW_MS - 1_000, u64::MAX)))
            .await
            .unwrap();
        assert!(summary.accepted.is_empty());
        assert_eq!(summary.dropped.len(), 3);
        assert!(summary.dropped.iter().all(|d| d.stage == Stage::Decoded));
        assert!(summary.dropped[0].reason.contains("ahead of current slot"));

        let summary = service
            .submit(request(signed_btc(&["100", "100", "100"], NOW_MS - 1_000, 900)))
            .await
            .unwrap();
        assert!(summary.accepted.is_empty());
        assert!(summary.dropped[0].reason.contains("slots behind"));
        assert!(history.accepted.lock().unwrap().is_empty());

        let summary = service
            .submit(request(signed_btc(&["100", "100", "100"], NOW_MS - 1_000, 990)))
            .await
            .unwrap();
        assert_eq!(summary.accepted.len(), 1);
        assert_eq!(summary.accepted[0].slot, 990);
    }
}
