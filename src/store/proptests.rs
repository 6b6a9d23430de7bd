//! Property-Based Tests for the Usage Store
//!
//! Verifies the aggregate invariants of [`RateLimitEntry`] over random
//! record and prune sequences: `total_usage` must always equal the sum of
//! the surviving records' consumption, no matter how records arrive or
//! which retention cutoffs are applied in between.

use proptest::prelude::*;

use super::entry::{RateLimitEntry, UsageKey, UsageRecord};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};

/// One step in a usage history: a recorded amount at a minute offset, or a
/// retention prune at a cutoff offset.
#[derive(Debug, Clone)]
enum Step {
    Record { amount: u64, at_minutes: i64 },
    Prune { cutoff_minutes: i64 },
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0u64..500, 0i64..10_000).prop_map(|(amount, at_minutes)| Step::Record {
            amount,
            at_minutes,
        }),
        1 => (0i64..10_000).prop_map(|cutoff_minutes| Step::Prune { cutoff_minutes }),
    ]
}

proptest! {
    /// `total_usage` equals the sum of surviving records after any mix of
    /// records and prunes.
    #[test]
    fn prop_total_usage_matches_record_sum(steps in prop::collection::vec(arb_step(), 0..60)) {
        let origin = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let key = UsageKey::new("prop_user", "api_calls");
        let mut entry = RateLimitEntry::new(&key);

        for step in steps {
            match step {
                Step::Record { amount, at_minutes } => {
                    let at = origin + ChronoDuration::minutes(at_minutes);
                    entry.record(UsageRecord::new(at, "api_calls", amount));
                }
                Step::Prune { cutoff_minutes } => {
                    entry.prune_older_than(origin + ChronoDuration::minutes(cutoff_minutes));
                }
            }

            let expected: u64 = entry.usage_records.iter().map(|r| r.resource_consumed).sum();
            prop_assert_eq!(entry.total_usage, expected);
        }
    }

    /// Pruning never invents records and reports exactly how many it
    /// dropped.
    #[test]
    fn prop_prune_reports_dropped_count(
        amounts in prop::collection::vec(1u64..100, 1..40),
        cutoff_minutes in 0i64..200,
    ) {
        let origin = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let key = UsageKey::new("prop_user", "api_calls");
        let mut entry = RateLimitEntry::new(&key);

        for (i, amount) in amounts.iter().enumerate() {
            let at = origin + ChronoDuration::minutes(i as i64 * 5);
            entry.record(UsageRecord::new(at, "api_calls", *amount));
        }

        let before = entry.usage_records.len();
        let cutoff = origin + ChronoDuration::minutes(cutoff_minutes);
        let dropped = entry.prune_older_than(cutoff);

        prop_assert_eq!(entry.usage_records.len() + dropped, before);
        prop_assert!(entry.usage_records.iter().all(|r| r.timestamp >= cutoff));
    }

    /// Window sums never exceed the total and respect inclusive bounds.
    #[test]
    fn prop_window_sum_bounded_by_total(
        amounts in prop::collection::vec(1u64..100, 0..40),
        start_minutes in 0i64..200,
        span_minutes in 0i64..200,
    ) {
        let origin = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let key = UsageKey::new("prop_user", "api_calls");
        let mut entry = RateLimitEntry::new(&key);

        for (i, amount) in amounts.iter().enumerate() {
            let at = origin + ChronoDuration::minutes(i as i64 * 3);
            entry.record(UsageRecord::new(at, "api_calls", *amount));
        }

        let start = origin + ChronoDuration::minutes(start_minutes);
        let end = start + ChronoDuration::minutes(span_minutes);
        let windowed = entry.usage_in_window(start, end);

        prop_assert!(windowed <= entry.total_usage);
        let recount: u64 = entry
            .records_in_window(start, end)
            .iter()
            .map(|r| r.resource_consumed)
            .sum();
        prop_assert_eq!(windowed, recount);
    }
}
