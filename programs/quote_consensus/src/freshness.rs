//! Freshness gate
//!
//! Each decoded quote is checked against the consumer's notion of "now"
//! before it may join a consensus pool, so stale entries shrink the pool
//! instead of dragging the median.

use crate::error::FreshnessError;
use crate::types::Quote;
use serde::{Deserialize, Serialize};

/// Default tolerance for oracle clocks running ahead of the consumer.
pub const DEFAULT_MAX_CLOCK_SKEW_MS: u64 = 2_000;

/// Current chain time as seen by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTime {
    pub unix_ms: u64,
    /// Current slot, when the host chain has one.
    pub slot: Option<u64>,
}

impl ChainTime {
    pub fn at(unix_ms: u64) -> Self {
        Self { unix_ms, slot: None }
    }

    pub fn with_slot(unix_ms: u64, slot: u64) -> Self {
        Self {
            unix_ms,
            slot: Some(slot),
        }
    }
}

/// Platform adapter supplying the current time.
pub trait ChainClock {
    fn now(&self) -> ChainTime;
}

/// A clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub ChainTime);

impl ChainClock for FixedClock {
    fn now(&self) -> ChainTime {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessPolicy {
    pub max_age_ms: u64,
    pub max_clock_skew_ms: u64,
    /// Slot window, only enforced when the clock also reports a slot.
    pub max_slot_age: Option<u64>,
}

impl FreshnessPolicy {
    pub fn new(max_age_ms: u64) -> Self {
        Self {
            max_age_ms,
            max_clock_skew_ms: DEFAULT_MAX_CLOCK_SKEW_MS,
            max_slot_age: None,
        }
    }
}

/// Reject a quote that is too old, or dated too far in the future.
///
/// A quote exactly `max_age_ms` old is still fresh.
pub fn check_freshness(
    quote: &Quote,
    now: ChainTime,
    policy: &FreshnessPolicy,
) -> Result<(), FreshnessError> {
    if quote.timestamp_ms > now.unix_ms.saturating_add(policy.max_clock_skew_ms) {
        return Err(FreshnessError::FutureTimestamp {
            timestamp_ms: quote.timestamp_ms,
            now_ms: now.unix_ms,
            max_skew_ms: policy.max_clock_skew_ms,
        });
    }

    let age_ms = now.unix_ms.saturating_sub(quote.timestamp_ms);
    if age_ms > policy.max_age_ms {
        return Err(FreshnessError::StaleQuote {
            age_ms,
            max_age_ms: policy.max_age_ms,
        });
    }

    if let (Some(current_slot), Some(max_slot_age)) = (now.slot, policy.max_slot_age) {
        if quote.slot > current_slot {
            return Err(FreshnessError::FutureSlot {
                slot: quote.slot,
                current_slot,
            });
        }
        if current_slot - quote.slot > max_slot_age {
            return Err(FreshnessError::StaleSlot {
                slot: quote.slot,
                current_slot,
                max_slot_age,
            });
        }
    }

    Ok(())
}
