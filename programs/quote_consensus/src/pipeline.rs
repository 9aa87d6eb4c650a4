//! Quote pipeline
//!
//! Runs one batch of raw responses through every gate and commits what
//! survives. The lifecycle of each feed in a batch is
//!
//! ```text
//! RECEIVED → SIGNATURE_VERIFIED → DECODED → FRESHNESS_CHECKED → CONSENSUS_EVALUATED
//!                                                                     │
//!                                                          ACCEPTED | REJECTED
//! ```
//!
//! Response- and quote-level failures are recorded as [`Dropped`] and only
//! shrink the pool. Feed-level failures become [`FeedOutcome::Rejected`] and
//! leave the store untouched; other feeds in the batch carry on.

use crate::aggregator::{aggregate, latest_per_oracle};
use crate::deviation::check_deviation;
use crate::error::{ConfigError, DropReason, FeedError, PipelineError};
use crate::fixed_point::VarianceBound;
use crate::freshness::{
    check_freshness, ChainClock, ChainTime, FreshnessPolicy, DEFAULT_MAX_CLOCK_SKEW_MS,
};
use crate::queue::{Queue, QueueRegistry};
use crate::store::QuoteStore;
use crate::types::{FeedId, OracleKey, Quote, QueueId, StoredState};
use crate::verifier::{RawOracleResponse, SignatureVerifier};
use crate::wire;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Policy a consumer applies to every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub min_oracle_samples: u32,
    /// Largest tolerated `(max - min) / median`, e.g. `0.05` for 5%.
    pub max_variance_pct: f64,
    pub max_age_ms: u64,
    pub max_deviation_bps: u64,
    pub max_clock_skew_ms: u64,
    pub max_slot_age: Option<u64>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_oracle_samples: 3,
            max_variance_pct: 0.05,
            max_age_ms: 30_000,
            max_deviation_bps: 1_000,
            max_clock_skew_ms: DEFAULT_MAX_CLOCK_SKEW_MS,
            max_slot_age: None,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_oracle_samples == 0 {
            return Err(ConfigError::ZeroQuorum);
        }
        if self.max_age_ms == 0 {
            return Err(ConfigError::ZeroMaxAge);
        }
        if !self.max_variance_pct.is_finite() || self.max_variance_pct < 0.0 {
            return Err(ConfigError::InvalidVariance(self.max_variance_pct));
        }
        VarianceBound::from_fraction(self.max_variance_pct)?;
        Ok(())
    }

    pub fn freshness_policy(&self) -> FreshnessPolicy {
        FreshnessPolicy {
            max_age_ms: self.max_age_ms,
            max_clock_skew_ms: self.max_clock_skew_ms,
            max_slot_age: self.max_slot_age,
        }
    }
}

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Received,
    SignatureVerified,
    Decoded,
    FreshnessChecked,
    ConsensusEvaluated,
    Accepted,
    Rejected,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "RECEIVED",
            Stage::SignatureVerified => "SIGNATURE_VERIFIED",
            Stage::Decoded => "DECODED",
            Stage::FreshnessChecked => "FRESHNESS_CHECKED",
            Stage::ConsensusEvaluated => "CONSENSUS_EVALUATED",
            Stage::Accepted => "ACCEPTED",
            Stage::Rejected => "REJECTED",
        };
        f.write_str(name)
    }
}

/// A response or quote removed from the pool. `stage` is the last stage it
/// completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dropped {
    pub oracle: OracleKey,
    /// Set once the failure concerns a single decoded quote.
    pub feed_id: Option<FeedId>,
    pub stage: Stage,
    pub reason: DropReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedOutcome {
    Accepted(StoredState),
    /// `stage` is the last stage the feed completed before failing.
    Rejected { stage: Stage, error: FeedError },
}

impl FeedOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FeedOutcome::Accepted(_))
    }

    pub fn stage(&self) -> Stage {
        match self {
            FeedOutcome::Accepted(_) => Stage::Accepted,
            FeedOutcome::Rejected { .. } => Stage::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub queue: QueueId,
    pub outcomes: BTreeMap<FeedId, FeedOutcome>,
    pub dropped: Vec<Dropped>,
}

impl BatchReport {
    pub fn accepted(&self) -> impl Iterator<Item = &StoredState> {
        self.outcomes.values().filter_map(|o| match o {
            FeedOutcome::Accepted(state) => Some(state),
            FeedOutcome::Rejected { .. } => None,
        })
    }

    pub fn rejected(&self) -> impl Iterator<Item = (&FeedId, Stage, &FeedError)> {
        self.outcomes.iter().filter_map(|(feed, o)| match o {
            FeedOutcome::Rejected { stage, error } => Some((feed, *stage, error)),
            FeedOutcome::Accepted(_) => None,
        })
    }

    pub fn outcome(&self, feed_id: &FeedId) -> Option<&FeedOutcome> {
        self.outcomes.get(feed_id)
    }
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct QuotePipeline {
    config: ConsensusConfig,
    variance: VarianceBound,
    freshness: FreshnessPolicy,
}

impl QuotePipeline {
    pub fn new(config: ConsensusConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let variance = VarianceBound::from_fraction(config.max_variance_pct)?;
        let freshness = config.freshness_policy();

        Ok(Self {
            config,
            variance,
            freshness,
        })
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Process one batch against `queue` at time `now`.
    ///
    /// `requested` restricts the update to the listed feeds: quotes for other
    /// feeds are ignored, and a listed feed without any surviving quote is
    /// rejected with `InsufficientSamples` rather than left out. Without it
    /// every feed present in the batch is evaluated.
    pub fn run<S: QuoteStore>(
        &self,
        responses: &[RawOracleResponse],
        queue: &Queue,
        now: ChainTime,
        store: &mut S,
        requested: Option<&[FeedId]>,
    ) -> BatchReport {
        debug!(
            queue = %queue.id,
            responses = responses.len(),
            "processing batch"
        );

        let (verified, mut dropped) = SignatureVerifier::verify_batch(responses, queue);

        let mut pools: BTreeMap<FeedId, Vec<Quote>> = BTreeMap::new();
        if let Some(feeds) = requested {
            for feed in feeds {
                pools.entry(*feed).or_default();
            }
        }

        for response in &verified {
            let quotes = match wire::decode(response) {
                Ok(quotes) => quotes,
                Err(e) => {
                    warn!(oracle = %response.oracle(), error = %e, "dropping undecodable response");
                    dropped.push(Dropped {
                        oracle: response.oracle(),
                        feed_id: None,
                        stage: Stage::SignatureVerified,
                        reason: DropReason::Decode(e),
                    });
                    continue;
                }
            };

            for quote in quotes {
                if requested.is_some() && !pools.contains_key(&quote.feed_id) {
                    debug!(feed = %quote.feed_id, "ignoring quote for unrequested feed");
                    continue;
                }
                if let Err(e) = check_freshness(&quote, now, &self.freshness) {
                    warn!(
                        oracle = %quote.oracle,
                        feed = %quote.feed_id,
                        error = %e,
                        "dropping quote"
                    );
                    dropped.push(Dropped {
                        oracle: quote.oracle,
                        feed_id: Some(quote.feed_id),
                        stage: Stage::Decoded,
                        reason: DropReason::Freshness(e),
                    });
                    continue;
                }
                pools.entry(quote.feed_id).or_default().push(quote);
            }
        }

        let outcomes = pools
            .into_iter()
            .map(|(feed_id, pool)| {
                let outcome = self.evaluate_feed(&feed_id, &pool, queue, store);
                (feed_id, outcome)
            })
            .collect();

        BatchReport {
            queue: queue.id,
            outcomes,
            dropped,
        }
    }

    /// Resolve the queue and the time through the platform adapters, then
    /// [`run`](Self::run).
    pub fn run_with_registry<R, C, S>(
        &self,
        responses: &[RawOracleResponse],
        registry: &R,
        queue_id: &QueueId,
        clock: &C,
        store: &mut S,
        requested: Option<&[FeedId]>,
    ) -> Result<BatchReport, PipelineError>
    where
        R: QueueRegistry + ?Sized,
        C: ChainClock + ?Sized,
        S: QuoteStore,
    {
        let queue = registry
            .queue(queue_id)
            .ok_or(PipelineError::UnknownQueue(*queue_id))?;

        Ok(self.run(responses, &queue, clock.now(), store, requested))
    }

    /// The quorum a feed must meet: the largest of the consumer's setting,
    /// the queue's floor, and the smallest hint among the contributing
    /// oracles.
    pub fn effective_quorum(&self, pool: &[Quote], queue: &Queue) -> u32 {
        let hint = latest_per_oracle(pool)
            .iter()
            .map(|q| q.min_oracle_samples as u32)
            .min()
            .unwrap_or(0);

        self.config
            .min_oracle_samples
            .max(queue.min_quorum)
            .max(hint)
    }

    fn evaluate_feed<S: QuoteStore>(
        &self,
        feed_id: &FeedId,
        pool: &[Quote],
        queue: &Queue,
        store: &mut S,
    ) -> FeedOutcome {
        let quorum = self.effective_quorum(pool, queue);

        let result = match aggregate(pool, quorum, self.variance) {
            Ok(result) => result,
            Err(e) => {
                warn!(feed = %feed_id, error = %e, "feed rejected by consensus");
                return FeedOutcome::Rejected {
                    stage: Stage::FreshnessChecked,
                    error: FeedError::Consensus(e),
                };
            }
        };

        let previous = store.get(feed_id);
        if let Err(e) = check_deviation(&result, previous.as_ref(), self.config.max_deviation_bps)
        {
            warn!(feed = %feed_id, error = %e, "feed rejected by deviation guard");
            return FeedOutcome::Rejected {
                stage: Stage::ConsensusEvaluated,
                error: FeedError::Deviation(e),
            };
        }

        let state = store.commit(&result);
        info!(
            feed = %state.feed_id,
            value = %state.value,
            oracles = state.num_oracles,
            updates = state.update_count,
            "feed update accepted"
        );
        FeedOutcome::Accepted(state)
    }
}
