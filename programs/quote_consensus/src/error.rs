use crate::fixed_point::FixedPoint;
use crate::types::{FeedId, OracleKey, QueueId};
use thiserror::Error;

/// A response could not be authenticated against the consumer's queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("invalid signature from oracle {oracle}")]
    InvalidSignature { oracle: OracleKey },

    #[error("oracle {oracle} is not a member of queue {queue}")]
    UnauthorizedSigner { oracle: OracleKey, queue: QueueId },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The message was signed for a different queue than the one the
    /// consumer trusts.
    #[error("message signed for queue {signed_for}, expected {expected}")]
    QueueMismatch { signed_for: QueueId, expected: QueueId },
}

/// A verified message does not follow the quote layout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated buffer: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unsupported message version {0}")]
    UnsupportedVersion(u8),

    #[error("message carries no feeds")]
    EmptyFeedList,

    #[error("message carries {0} feeds, more than allowed")]
    TooManyFeeds(usize),

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("feed {0} appears more than once in one message")]
    DuplicateFeed(FeedId),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("cannot encode a message without feeds")]
    EmptyFeedList,

    #[error("cannot encode {0} feeds in one message")]
    TooManyFeeds(usize),

    #[error("cannot encode {0} responses in one bundle")]
    TooManyResponses(usize),

    #[error("signature must be 64 bytes, got {0}")]
    SignatureLength(usize),

    #[error("message of {0} bytes exceeds the bundle length prefix")]
    MessageTooLong(usize),
}

/// A quote falls outside the freshness window.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FreshnessError {
    #[error("quote is {age_ms} ms old, max age is {max_age_ms} ms")]
    StaleQuote { age_ms: u64, max_age_ms: u64 },

    #[error("quote timestamp {timestamp_ms} is ahead of {now_ms} by more than {max_skew_ms} ms")]
    FutureTimestamp {
        timestamp_ms: u64,
        now_ms: u64,
        max_skew_ms: u64,
    },

    #[error("quote slot {slot} is more than {max_slot_age} slots behind {current_slot}")]
    StaleSlot {
        slot: u64,
        current_slot: u64,
        max_slot_age: u64,
    },

    #[error("quote slot {slot} is ahead of current slot {current_slot}")]
    FutureSlot { slot: u64, current_slot: u64 },
}

/// Consensus could not be reached for one feed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("insufficient samples: need {required}, have {available}")]
    InsufficientSamples { required: u32, available: usize },

    #[error("oracle values spread from {min} to {max} around median {median}, above the variance bound")]
    ExcessiveVariance {
        min: FixedPoint,
        max: FixedPoint,
        median: FixedPoint,
    },

    /// Caller bug: quotes for several feeds were passed to one aggregation.
    #[error("quotes for feed {found} mixed into aggregation of feed {expected}")]
    MixedFeeds { expected: FeedId, found: FeedId },
}

/// The new aggregate is inconsistent with the last accepted value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviationError {
    #[error("value moved {deviation_bps} bps, max allowed is {max_deviation_bps} bps")]
    ExcessiveDeviation {
        deviation_bps: u64,
        max_deviation_bps: u64,
    },

    #[error("aggregate timestamp {timestamp_ms} is older than stored {previous_timestamp_ms}")]
    OutOfOrder {
        timestamp_ms: u64,
        previous_timestamp_ms: u64,
    },
}

/// Why a single feed update was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Deviation(#[from] DeviationError),
}

/// Why a single response or quote was dropped from the pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Freshness(#[from] FreshnessError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("queue {0} is not registered")]
    UnknownQueue(QueueId),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FixedPointError {
    #[error("value does not fit in 128-bit fixed point")]
    Overflow,

    #[error("invalid fixed point literal: {0}")]
    Parse(String),

    #[error("invalid ratio: {0}")]
    InvalidRatio(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("min_oracle_samples must be at least 1")]
    ZeroQuorum,

    #[error("max_age_ms must be greater than zero")]
    ZeroMaxAge,

    #[error("max_variance_pct {0} is not a finite, non-negative fraction")]
    InvalidVariance(f64),

    #[error(transparent)]
    FixedPoint(#[from] FixedPointError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseKeyError {
    #[error("invalid hex: {0}")]
    Hex(String),

    #[error("expected 32 bytes, got {0}")]
    Length(usize),
}
