//! Property-based tests for the backoff policy.
//!
//! - Caps never decrease with the retry index and clamp to the last entry
//! - Jittered delays stay within `[0, cap)`
//! - A `Retry-After` hint is a lower bound on the delay

#![allow(clippy::unwrap_used)]

use netop_core::retry::{DEFAULT_BACKOFF_TABLE_MS, RetryConfig};
use proptest::prelude::*;
use std::time::Duration;

/// Strategy for valid, non-decreasing backoff tables.
fn backoff_table_strategy() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..100_000, 1..10).prop_map(|mut table| {
        table.sort_unstable();
        table
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_default_caps_are_non_decreasing(a in 0u32..64, b in 0u32..64) {
        let config = RetryConfig::default();
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(config.backoff_cap(low) <= config.backoff_cap(high));
    }

    #[test]
    fn prop_caps_clamp_to_last_entry(table in backoff_table_strategy(), extra in 0u32..100) {
        let config = RetryConfig { backoff_table_ms: table.clone(), ..RetryConfig::default() };
        let last = u32::try_from(table.len() - 1).unwrap();
        let expected = Duration::from_millis(*table.last().unwrap());
        prop_assert_eq!(config.backoff_cap(last + extra), expected);
        prop_assert!(config.validate().is_ok());
    }

    #[test]
    fn prop_jittered_delay_is_below_cap(table in backoff_table_strategy(), index in 0u32..32) {
        let config = RetryConfig { backoff_table_ms: table, jitter: true, ..RetryConfig::default() };
        let cap = config.backoff_cap(index);
        let delay = config.delay_for(index, None);
        prop_assert!(delay < cap, "delay {delay:?} not below cap {cap:?}");
    }

    #[test]
    fn prop_unjittered_delay_equals_cap(index in 0u32..32) {
        let config = RetryConfig { jitter: false, ..RetryConfig::default() };
        prop_assert_eq!(config.delay_for(index, None), config.backoff_cap(index));
    }

    #[test]
    fn prop_retry_after_is_a_floor(index in 0u32..32, secs in 0u64..100_000) {
        let config = RetryConfig::default();
        let hint = Duration::from_secs(secs);
        prop_assert!(config.delay_for(index, Some(hint)) >= hint);
    }
}

#[test]
fn test_default_table_values() {
    let config = RetryConfig::default();
    let caps: Vec<u64> = (0..10)
        .map(|i| u64::try_from(config.backoff_cap(i).as_millis()).unwrap())
        .collect();
    assert_eq!(
        caps,
        [
            1_000, 3_000, 15_000, 27_000, 42_000, 60_000, 3_600_000, 21_600_000, 21_600_000,
            21_600_000
        ]
    );
    assert_eq!(DEFAULT_BACKOFF_TABLE_MS.len(), 8);
}
