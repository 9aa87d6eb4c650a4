//! Deviation Guard
//!
//! Even a well-formed consensus can be a jump the consumer should not take in
//! one step, for example the first burst of data after a queue-wide outage.
//! Each new aggregate is compared with the last accepted value of its feed.

use crate::error::DeviationError;
use crate::fixed_point::{wide_div, wide_mul, FixedPoint};
use crate::types::{AggregateResult, StoredState};

/// One basis point is 1/10000.
pub const BPS_DENOMINATOR: u128 = 10_000;

/// Change from `previous` to `new` in basis points, rounded up.
///
/// Rounding up keeps a reported value above the limit whenever the exact
/// move is above it: 1000.5 bps reports as 1001.
///
/// # Formula
/// ```text
/// deviation = |new - previous| / |previous| × 10000
/// ```
///
/// # Example
/// ```text
/// Previous: 50,000
/// New:      50,500
///
/// deviation = 500 / 50000 × 10000 = 100 bps (1%)
/// ```
///
/// Saturates at `u64::MAX`, which is also what any move away from a zero
/// previous value reports.
pub fn deviation_bps(new: FixedPoint, previous: FixedPoint) -> u64 {
    let diff = new.abs_diff(previous);
    if diff == 0 {
        return 0;
    }

    let moved = wide_mul(diff, BPS_DENOMINATOR);
    let magnitude = previous.unsigned_abs();
    wide_div(moved, magnitude)
        .map(|bps| {
            if wide_mul(bps, magnitude) == moved {
                bps
            } else {
                bps.saturating_add(1)
            }
        })
        .and_then(|bps| u64::try_from(bps).ok())
        .unwrap_or(u64::MAX)
}

/// Check a new aggregate against the feed's last accepted state.
///
/// * No previous state: always passes (first update).
/// * An aggregate older than the stored one is `OutOfOrder`. Equal timestamps
///   pass so that replaying the same quotes stays idempotent.
/// * Otherwise fails with `ExcessiveDeviation` when
///   `|new - previous| × 10000 > max_deviation_bps × |previous|`, evaluated
///   exactly. A zero previous value only admits an unchanged value.
pub fn check_deviation(
    result: &AggregateResult,
    previous: Option<&StoredState>,
    max_deviation_bps: u64,
) -> Result<(), DeviationError> {
    let Some(previous) = previous else {
        return Ok(());
    };

    if result.timestamp_ms < previous.timestamp_ms {
        return Err(DeviationError::OutOfOrder {
            timestamp_ms: result.timestamp_ms,
            previous_timestamp_ms: previous.timestamp_ms,
        });
    }

    let diff = result.value.abs_diff(previous.value);
    let moved = wide_mul(diff, BPS_DENOMINATOR);
    let allowed = wide_mul(max_deviation_bps as u128, previous.value.unsigned_abs());

    if moved > allowed {
        return Err(DeviationError::ExcessiveDeviation {
            deviation_bps: deviation_bps(result.value, previous.value),
            max_deviation_bps,
        });
    }

    Ok(())
}
