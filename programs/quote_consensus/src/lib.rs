//! Quote Consensus
//!
//! Verifies signed oracle quotes and folds them into one trusted value per
//! feed. Every stage is synchronous and deterministic so the same code can run
//! inside an on-chain program or behind an off-chain service.
//!
//! # Architecture
//! ```text
//! RawOracleResponse ─→ [verifier] ─→ [wire::decode] ─→ [freshness]
//!                                                          │
//!            StoredState ←─ [store] ←─ [deviation] ←─ [aggregator]
//! ```
//!
//! [`pipeline::QuotePipeline`] drives the whole flow for one batch of
//! responses. Per-response failures shrink the pool of quotes and are
//! reported as [`pipeline::Dropped`]; per-feed failures are reported as
//! [`pipeline::FeedOutcome::Rejected`] and never touch the store.

pub mod aggregator;
pub mod deviation;
pub mod error;
pub mod fixed_point;
pub mod freshness;
pub mod pipeline;
pub mod queue;
pub mod signer;
pub mod store;
pub mod types;
pub mod verifier;
pub mod wire;

pub use aggregator::aggregate;
pub use deviation::check_deviation;
pub use error::{
    ConfigError, ConsensusError, DecodeError, DeviationError, DropReason, EncodeError,
    FeedError, FixedPointError, FreshnessError, ParseKeyError, PipelineError, VerificationError,
};
pub use fixed_point::{FixedPoint, VarianceBound};
pub use freshness::{check_freshness, ChainClock, ChainTime, FixedClock, FreshnessPolicy};
pub use pipeline::{BatchReport, ConsensusConfig, Dropped, FeedOutcome, QuotePipeline, Stage};
pub use queue::{Queue, QueueRegistry, StaticQueueRegistry};
pub use signer::QuoteSigner;
pub use store::{MemoryQuoteStore, QuoteStore};
pub use types::{
    canonical_quote_key, AggregateResult, CanonicalKey, FeedId, OracleKey, Quote, QueueId,
    StoredState,
};
pub use verifier::{RawOracleResponse, SignatureVerifier, VerifiedResponse};
