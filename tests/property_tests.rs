//! Property-based tests for dbsemaphore's pure-function arithmetic.
//!
//! # Prerequisites
//!
//! - No database or network access required.
//! - These tests are purely computational and always run.
//!
//! # How to run
//!
//! ```bash
//! cargo test --test property_tests
//! PROPTEST_CASES=10000 cargo test --test property_tests
//! ```
//!
//! # Testing strategy
//!
//! Properties are organized by module:
//! - **dbclient**: statement timeout clamping never returns zero or a
//!   rounded-up value.
//! - **config**: the heartbeat deadness threshold scales linearly with the
//!   configured multiplier.

use std::time::Duration;

use dbsemaphore::config::SemaphoreOptions;
use dbsemaphore::dbclient::TxnClient;
use proptest::prelude::*;

proptest! {
    /// `statement_timeout` never rounds a sub-second remaining budget down
    /// to zero: a transaction always gets at least one second to run.
    #[test]
    fn prop_statement_timeout_never_zero(millis in 0u64..120_000) {
        let remaining = Duration::from_millis(millis);
        let timeout = TxnClient::statement_timeout(remaining);
        prop_assert!(timeout.as_secs() >= 1);
    }

    /// `statement_timeout` never exceeds the input it was given, except
    /// when clamped up from sub-second remaining budgets to the 1s floor.
    #[test]
    fn prop_statement_timeout_bounded_above(secs in 1u64..10_000) {
        let remaining = Duration::from_secs(secs);
        let timeout = TxnClient::statement_timeout(remaining);
        prop_assert_eq!(timeout.as_secs(), secs);
    }

    /// The dead-owner threshold scales linearly with the multiplier: doubling
    /// the multiplier doubles the threshold.
    #[test]
    fn prop_heartbeat_deadness_threshold_scales_with_multiplier(
        interval_ms in 1u64..60_000,
        multiplier in 1u32..20,
    ) {
        let single = SemaphoreOptions::new(1)
            .heartbeat_interval(Duration::from_millis(interval_ms))
            .heartbeat_timeout_multiplier(multiplier);
        let doubled = SemaphoreOptions::new(1)
            .heartbeat_interval(Duration::from_millis(interval_ms))
            .heartbeat_timeout_multiplier(multiplier * 2);

        prop_assert_eq!(
            doubled.heartbeat_deadness_threshold(),
            single.heartbeat_deadness_threshold() * 2,
        );
    }

    /// The threshold is always at least as long as a single heartbeat
    /// interval, since the multiplier is never less than 1.
    #[test]
    fn prop_heartbeat_deadness_threshold_at_least_one_interval(
        interval_ms in 1u64..60_000,
        multiplier in 1u32..20,
    ) {
        let interval = Duration::from_millis(interval_ms);
        let options = SemaphoreOptions::new(1)
            .heartbeat_interval(interval)
            .heartbeat_timeout_multiplier(multiplier);
        prop_assert!(options.heartbeat_deadness_threshold() >= interval);
    }
}
