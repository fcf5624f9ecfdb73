// crates/elspeth-core/tests/retry_unit.rs
// ============================================================================
// Module: Retry Manager Tests
// Description: Bounded backoff, hint capping, and pluggable taxonomy.
// ============================================================================
//! ## Overview
//! Verifies that retry decisions are always finite, that backoff respects
//! the configured ceiling and provider hints, and that a fatal classifier
//! short-circuits retries.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::time::Duration;

use elspeth_core::CapacityNotice;
use elspeth_core::ErrorClass;
use elspeth_core::ErrorClassifier;
use elspeth_core::RetryDecision;
use elspeth_core::RetryManager;
use elspeth_core::RetryPolicy;

fn notice(retry_after_ms: Option<u64>) -> CapacityNotice {
    CapacityNotice {
        reason: "over capacity".to_string(),
        retry_after_ms,
    }
}

#[test]
fn retries_stop_at_max_attempts() {
    let manager = RetryManager::new(RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 10,
        max_delay_ms: 1_000,
    });
    assert!(matches!(manager.decide(1, &notice(None)), RetryDecision::RetryAfter(_)));
    assert!(matches!(manager.decide(2, &notice(None)), RetryDecision::RetryAfter(_)));
    assert!(matches!(manager.decide(3, &notice(None)), RetryDecision::GiveUp));
    assert!(matches!(manager.decide(99, &notice(None)), RetryDecision::GiveUp));
}

#[test]
fn backoff_never_exceeds_the_ceiling() {
    let manager = RetryManager::new(RetryPolicy {
        max_attempts: 32,
        base_delay_ms: 100,
        max_delay_ms: 500,
    });
    for attempt in 1 .. 31 {
        match manager.decide(attempt, &notice(None)) {
            RetryDecision::RetryAfter(delay) => {
                assert!(delay <= Duration::from_millis(500));
            }
            RetryDecision::GiveUp => panic!("gave up before max attempts"),
        }
    }
}

#[test]
fn provider_hint_overrides_backoff_but_is_capped() {
    let manager = RetryManager::new(RetryPolicy {
        max_attempts: 4,
        base_delay_ms: 100,
        max_delay_ms: 250,
    });
    match manager.decide(1, &notice(Some(10))) {
        RetryDecision::RetryAfter(delay) => assert_eq!(delay, Duration::from_millis(10)),
        RetryDecision::GiveUp => panic!("unexpected give-up"),
    }
    match manager.decide(1, &notice(Some(10_000))) {
        RetryDecision::RetryAfter(delay) => assert_eq!(delay, Duration::from_millis(250)),
        RetryDecision::GiveUp => panic!("unexpected give-up"),
    }
}

/// Classifier treating every notice as fatal.
struct AlwaysFatal;

impl ErrorClassifier for AlwaysFatal {
    fn classify(&self, _notice: &CapacityNotice) -> ErrorClass {
        ErrorClass::Fatal
    }
}

#[test]
fn fatal_classification_short_circuits() {
    let manager = RetryManager::with_classifier(
        RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 10,
            max_delay_ms: 100,
        },
        AlwaysFatal,
    );
    assert!(matches!(manager.decide(1, &notice(None)), RetryDecision::GiveUp));
}

#[test]
fn zero_base_delay_yields_zero_backoff() {
    let manager = RetryManager::new(RetryPolicy {
        max_attempts: 2,
        base_delay_ms: 0,
        max_delay_ms: 0,
    });
    match manager.decide(1, &notice(None)) {
        RetryDecision::RetryAfter(delay) => assert_eq!(delay, Duration::ZERO),
        RetryDecision::GiveUp => panic!("unexpected give-up"),
    }
}
