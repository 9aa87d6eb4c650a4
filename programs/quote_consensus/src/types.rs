use crate::error::ParseKeyError;
use crate::fixed_point::FixedPoint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// 32-byte identifiers that travel as lowercase hex outside the wire format.
macro_rules! hash_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub const LEN: usize = 32;

            pub const fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                <[u8; 32]>::try_from(bytes).ok().map(Self)
            }

            /// Parse 64 hex characters, with or without a `0x` prefix.
            pub fn from_hex(s: &str) -> Result<Self, ParseKeyError> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(s).map_err(|e| ParseKeyError::Hex(e.to_string()))?;
                Self::from_slice(&bytes).ok_or(ParseKeyError::Length(bytes.len()))
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl FromStr for $name {
            type Err = ParseKeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hash_id!(
    /// Opaque feed identifier, the hash of the feed's definition.
    FeedId
);

hash_id!(
    /// Ed25519 public key of an oracle operator.
    OracleKey
);

hash_id!(
    /// Public key of a queue, the registry of authorized oracles.
    QueueId
);

hash_id!(
    /// Deterministic key of the quote account holding a queue's feeds.
    CanonicalKey
);

impl FeedId {
    /// Derive a feed id from its encoded definition: `SHA-256(definition)`.
    pub fn derive(definition: &[u8]) -> Self {
        Self(Sha256::digest(definition).into())
    }
}

/// `SHA-256(queue || feed_0 || feed_1 || ...)`
///
/// Feed order matters: the same feeds in another order map to another key.
pub fn canonical_quote_key(queue: &QueueId, feeds: &[FeedId]) -> CanonicalKey {
    let mut hasher = Sha256::new();
    hasher.update(queue.as_bytes());
    for feed in feeds {
        hasher.update(feed.as_bytes());
    }
    CanonicalKey(hasher.finalize().into())
}

/// One oracle's observation of one feed, decoded from a verified message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub feed_id: FeedId,
    pub value: FixedPoint,
    pub slot: u64,
    /// Unix milliseconds at which the oracle signed.
    pub timestamp_ms: u64,
    pub oracle: OracleKey,
    /// Number of oracle samples the feed definition asks for.
    pub min_oracle_samples: u8,
}

/// Consensus over one feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub feed_id: FeedId,
    /// Median of the qualifying quotes.
    pub value: FixedPoint,
    /// Timestamp of the freshest contributing quote.
    pub timestamp_ms: u64,
    /// Slot of the freshest contributing quote.
    pub slot: u64,
    pub num_oracles: u32,
    pub min_value: FixedPoint,
    pub max_value: FixedPoint,
}

/// Last accepted aggregate of one feed, as seen by one consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredState {
    pub feed_id: FeedId,
    pub value: FixedPoint,
    pub timestamp_ms: u64,
    pub slot: u64,
    pub num_oracles: u32,
    /// Accepted updates so far, including this one.
    pub update_count: u64,
}

impl StoredState {
    pub fn from_result(result: &AggregateResult, update_count: u64) -> Self {
        Self {
            feed_id: result.feed_id,
            value: result.value,
            timestamp_ms: result.timestamp_ms,
            slot: result.slot,
            num_oracles: result.num_oracles,
            update_count,
        }
    }
}
