//! Consensus Aggregator
//!
//! Folds the quotes independent oracles reported for one feed into a single
//! value. The median is manipulation resistant, but a median over a pool that
//! disagrees wildly is still suspicious, so the pool's spread is bounded too.
//!
//! # Architecture
//! ```text
//! oracle A → 100.00 ┐
//! oracle B → 100.05 ├→ [dedupe] → [quorum] → [median] → [spread] → AggregateResult
//! oracle C →  99.90 ┘
//! ```

use crate::error::ConsensusError;
use crate::fixed_point::{FixedPoint, VarianceBound};
use crate::types::{AggregateResult, OracleKey, Quote};
use std::collections::BTreeMap;
use tracing::debug;

/// Keep one quote per oracle: the most recent one.
///
/// "Most recent" is the greatest `(timestamp_ms, slot, value,
/// min_oracle_samples)` tuple, so the survivor never depends on input order.
/// The result is ordered by oracle key.
pub fn latest_per_oracle(quotes: &[Quote]) -> Vec<Quote> {
    let mut latest: BTreeMap<OracleKey, &Quote> = BTreeMap::new();

    for quote in quotes {
        latest
            .entry(quote.oracle)
            .and_modify(|kept| {
                if recency(quote) > recency(kept) {
                    *kept = quote;
                }
            })
            .or_insert(quote);
    }

    latest.into_values().cloned().collect()
}

fn recency(quote: &Quote) -> (u64, u64, FixedPoint, u8) {
    (
        quote.timestamp_ms,
        quote.slot,
        quote.value,
        quote.min_oracle_samples,
    )
}

/// Compute the consensus value of one feed.
///
/// # Algorithm
/// 1. Reject quotes for more than one feed (caller bug)
/// 2. Keep the latest quote per oracle
/// 3. Quorum: at least `max(1, min_oracle_samples)` oracles
/// 4. Sort values; the median is the middle value, or for an even count the
///    floor of the midpoint of the two middle values
/// 5. Spread: `(max - min) / |median|` must not exceed `max_variance`
///
/// The quorum check runs before the spread check.
///
/// # Example
/// ```text
/// Values: [100.0, 100.1, 99.9, 100.05]
/// Sorted: [99.9, 100.0, 100.05, 100.1]
/// Median: (100.0 + 100.05) / 2 = 100.025
/// Spread: (100.1 - 99.9) / 100.025 ≈ 0.002  → within a 0.05 bound ✅
/// ```
///
/// # Errors
/// * `MixedFeeds` - quotes reference different feeds
/// * `InsufficientSamples` - fewer distinct oracles than the quorum
/// * `ExcessiveVariance` - the pool disagrees more than the bound allows
pub fn aggregate(
    quotes: &[Quote],
    min_oracle_samples: u32,
    max_variance: VarianceBound,
) -> Result<AggregateResult, ConsensusError> {
    let required = min_oracle_samples.max(1);

    let Some(first) = quotes.first() else {
        return Err(ConsensusError::InsufficientSamples {
            required,
            available: 0,
        });
    };
    let feed_id = first.feed_id;
    if let Some(other) = quotes.iter().find(|q| q.feed_id != feed_id) {
        return Err(ConsensusError::MixedFeeds {
            expected: feed_id,
            found: other.feed_id,
        });
    }

    let pool = latest_per_oracle(quotes);
    if pool.len() < required as usize {
        return Err(ConsensusError::InsufficientSamples {
            required,
            available: pool.len(),
        });
    }

    let mut values: Vec<FixedPoint> = pool.iter().map(|q| q.value).collect();
    values.sort_unstable();

    let len = values.len();
    let median = if len % 2 == 1 {
        values[len / 2]
    } else {
        FixedPoint::midpoint_floor(values[len / 2 - 1], values[len / 2])
    };
    let min_value = values[0];
    let max_value = values[len - 1];

    if !max_variance.permits(max_value.abs_diff(min_value), median.unsigned_abs()) {
        return Err(ConsensusError::ExcessiveVariance {
            min: min_value,
            max: max_value,
            median,
        });
    }

    // pool is non-empty past the quorum check
    let freshest = pool
        .iter()
        .max_by_key(|q| (q.timestamp_ms, q.slot))
        .unwrap_or(first);

    debug!(
        feed = %feed_id,
        median = %median,
        oracles = len,
        "consensus reached"
    );

    Ok(AggregateResult {
        feed_id,
        value: median,
        timestamp_ms: freshest.timestamp_ms,
        slot: freshest.slot,
        num_oracles: len as u32,
        min_value,
        max_value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FeedId;
    use proptest::prelude::*;

    const FEED: FeedId = FeedId::new([1; 32]);

    fn fp(s: &str) -> FixedPoint {
        s.parse().unwrap()
    }

    fn quote(oracle: u8, value: &str, timestamp_ms: u64) -> Quote {
        Quote {
            feed_id: FEED,
            value: fp(value),
            slot: timestamp_ms / 400,
            timestamp_ms,
            oracle: OracleKey::new([oracle; 32]),
            min_oracle_samples: 1,
        }
    }

    fn five_percent() -> VarianceBound {
        VarianceBound::from_fraction(0.05).unwrap()
    }

    #[test]
    fn test_median_odd_count() {
        let quotes = vec![
            quote(1, "100", 1_000),
            quote(2, "200", 1_000),
            quote(3, "150", 1_000),
        ];

        let result = aggregate(&quotes, 3, VarianceBound::from_fraction(1.0).unwrap()).unwrap();

        // Median of [100, 150, 200] = 150
        assert_eq!(result.value, fp("150"));
        assert_eq!(result.min_value, fp("100"));
        assert_eq!(result.max_value, fp("200"));
        assert_eq!(result.num_oracles, 3);
    }

    #[test]
    fn test_median_even_count() {
        let quotes = vec![
            quote(1, "100.0", 1_000),
            quote(2, "100.1", 1_000),
            quote(3, "99.9", 1_000),
            quote(4, "100.05", 1_000),
        ];

        let result = aggregate(&quotes, 3, five_percent()).unwrap();

        // (100.0 + 100.05) / 2
        assert_eq!(result.value, fp("100.025"));
        assert_eq!(result.num_oracles, 4);
    }

    #[test]
    fn test_even_median_rounds_down() {
        let quote_raw = |oracle: u8, raw: i128| Quote {
            value: FixedPoint::from_raw(raw),
            ..quote(oracle, "0", 1_000)
        };
        let unbounded = VarianceBound::from_raw(u128::MAX);

        let up = aggregate(&[quote_raw(1, 1), quote_raw(2, 2)], 2, unbounded).unwrap();
        assert_eq!(up.value.raw(), 1);

        let down = aggregate(&[quote_raw(1, -1), quote_raw(2, -2)], 2, unbounded).unwrap();
        assert_eq!(down.value.raw(), -2);

        let extremes =
            aggregate(&[quote_raw(1, i128::MAX), quote_raw(2, i128::MAX - 1)], 2, unbounded)
                .unwrap();
        assert_eq!(extremes.value.raw(), i128::MAX - 1);
    }

    #[test]
    fn test_outlier_triggers_excessive_variance() {
        let quotes = vec![
            quote(1, "100.0", 1_000),
            quote(2, "100.1", 1_000),
            quote(3, "99.9", 1_000),
            quote(4, "100.05", 1_000),
            quote(5, "500.0", 1_000),
        ];

        assert_eq!(
            aggregate(&quotes, 3, five_percent()),
            Err(ConsensusError::ExcessiveVariance {
                min: fp("99.9"),
                max: fp("500.0"),
                median: fp("100.05"),
            })
        );
    }

    #[test]
    fn test_spread_exactly_at_bound_passes() {
        // (105 - 100) / 100 = 0.05
        let quotes = vec![quote(1, "100", 1_000), quote(2, "100", 1_000), quote(3, "105", 1_000)];
        assert!(aggregate(&quotes, 3, five_percent()).is_ok());

        let quotes = vec![
            quote(1, "100", 1_000),
            quote(2, "100", 1_000),
            quote(3, "105.000000000000000001", 1_000),
        ];
        assert!(matches!(
            aggregate(&quotes, 3, five_percent()),
            Err(ConsensusError::ExcessiveVariance { .. })
        ));
    }

    #[test]
    fn test_zero_median() {
        let agreeing = vec![quote(1, "0", 1_000), quote(2, "0", 1_000)];
        assert_eq!(aggregate(&agreeing, 2, five_percent()).unwrap().value, FixedPoint::ZERO);

        let split = vec![quote(1, "-1", 1_000), quote(2, "0", 1_000), quote(3, "1", 1_000)];
        assert!(matches!(
            aggregate(&split, 3, five_percent()),
            Err(ConsensusError::ExcessiveVariance { .. })
        ));
    }

    #[test]
    fn test_quorum_checked_before_variance() {
        let quotes = vec![quote(1, "100", 1_000), quote(2, "500", 1_000)];
        assert_eq!(
            aggregate(&quotes, 3, five_percent()),
            Err(ConsensusError::InsufficientSamples {
                required: 3,
                available: 2
            })
        );
    }

    #[test]
    fn test_empty_pool() {
        assert_eq!(
            aggregate(&[], 0, five_percent()),
            Err(ConsensusError::InsufficientSamples {
                required: 1,
                available: 0
            })
        );
    }

    #[test]
    fn test_duplicate_oracle_keeps_latest() {
        let quotes = vec![
            quote(1, "100", 2_000),
            quote(1, "90", 1_000),
            quote(2, "100", 1_000),
        ];

        let pool = latest_per_oracle(&quotes);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool[0].value, fp("100"));
        assert_eq!(pool[0].timestamp_ms, 2_000);

        // a duplicate never counts twice toward quorum
        assert!(matches!(
            aggregate(&quotes, 3, five_percent()),
            Err(ConsensusError::InsufficientSamples { available: 2, .. })
        ));
    }

    #[test]
    fn test_result_carries_freshest_timestamp() {
        let quotes = vec![
            quote(1, "100", 1_000),
            quote(2, "100", 3_000),
            quote(3, "100", 2_000),
        ];
        let result = aggregate(&quotes, 3, five_percent()).unwrap();
        assert_eq!(result.timestamp_ms, 3_000);
        assert_eq!(result.slot, 3_000 / 400);
    }

    #[test]
    fn test_mixed_feeds_rejected() {
        let mut other = quote(2, "100", 1_000);
        other.feed_id = FeedId::new([2; 32]);

        assert!(matches!(
            aggregate(&[quote(1, "100", 1_000), other], 1, five_percent()),
            Err(ConsensusError::MixedFeeds { .. })
        ));
    }

    fn arb_pool() -> impl Strategy<Value = Vec<Quote>> {
        prop::collection::vec((any::<u8>(), -1_000_000i64..1_000_000, 0u64..10_000), 0..12).prop_map(
            |entries| {
                entries
                    .into_iter()
                    .map(|(oracle, value, ts)| Quote {
                        value: FixedPoint::from_integer(value),
                        ..quote(oracle, "0", ts)
                    })
                    .collect()
            },
        )
    }

    proptest! {
        #[test]
        fn prop_below_quorum_never_yields_value(pool in arb_pool(), extra in 1u32..5) {
            let distinct = latest_per_oracle(&pool).len() as u32;
            let result = aggregate(&pool, distinct + extra, VarianceBound::from_raw(u128::MAX));
            let is_insufficient = matches!(result, Err(ConsensusError::InsufficientSamples { .. }));
            prop_assert!(is_insufficient);
        }

        #[test]
        fn prop_median_is_order_independent(pool in arb_pool()) {
            let unbounded = VarianceBound::from_raw(u128::MAX);
            let mut reversed = pool.clone();
            reversed.reverse();
            prop_assert_eq!(aggregate(&pool, 1, unbounded), aggregate(&reversed, 1, unbounded));
        }

        #[test]
        fn prop_median_matches_sorted_middle(pool in arb_pool()) {
            prop_assume!(!pool.is_empty());
            let mut values: Vec<i128> =
                latest_per_oracle(&pool).iter().map(|q| q.value.raw()).collect();
            values.sort();
            let n = values.len();
            let expected = if n % 2 == 1 {
                values[n / 2]
            } else {
                (values[n / 2 - 1] + values[n / 2]).div_euclid(2)
            };
            // a zero median only admits a zero spread
            prop_assume!(expected != 0);

            let result = aggregate(&pool, 1, VarianceBound::from_raw(u128::MAX)).unwrap();
            prop_assert_eq!(result.value.raw(), expected);
            prop_assert!(result.min_value <= result.value && result.value <= result.max_value);
        }
    }
}
