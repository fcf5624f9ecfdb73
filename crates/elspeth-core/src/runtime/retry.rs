// crates/elspeth-core/src/runtime/retry.rs
// ============================================================================
// Module: Elspeth Retry Manager
// Description: Bounded exponential backoff with jitter for transient errors.
// Purpose: Bound the wait on capacity-exhausted transforms without starvation.
// Dependencies: crate::interfaces, rand, serde
// ============================================================================

//! ## Overview
//! The retry manager decides whether a capacity-exhausted transform call is
//! retried and how long to wait between attempts. Backoff is exponential
//! with jitter, always finite, and never blocks progress of other tokens
//! beyond the bounded wait of the current one. The transient/fatal taxonomy
//! is pluggable because it is provider-specific.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::interfaces::CapacityNotice;

// ============================================================================
// SECTION: Policy
// ============================================================================

/// Retry policy parameters.
///
/// # Invariants
/// - `max_attempts` >= 1; attempt 1 is the initial call.
/// - `base_delay_ms` <= `max_delay_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts including the initial call.
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single backoff delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

// ============================================================================
// SECTION: Classification
// ============================================================================

/// Transient/fatal classification of a capacity notice.
///
/// # Invariants
/// - Variants are stable and exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry after backoff.
    Transient,
    /// Surface immediately.
    Fatal,
}

/// Pluggable provider-specific error taxonomy.
pub trait ErrorClassifier: Send + Sync {
    /// Classifies a capacity notice.
    fn classify(&self, notice: &CapacityNotice) -> ErrorClass;
}

/// Default taxonomy: every capacity notice is transient.
///
/// # Invariants
/// - Fatal errors surface through the transform error path, not through
///   capacity notices.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorClassifier;

impl ErrorClassifier for DefaultErrorClassifier {
    fn classify(&self, _notice: &CapacityNotice) -> ErrorClass {
        ErrorClass::Transient
    }
}

// ============================================================================
// SECTION: Decisions
// ============================================================================

/// Decision returned for one capacity-exhausted attempt.
///
/// # Invariants
/// - Variants are stable and exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the embedded backoff delay.
    RetryAfter(Duration),
    /// Attempts exhausted or the notice is fatal; surface the failure.
    GiveUp,
}

/// Bounded retry manager.
///
/// # Invariants
/// - Decisions are always finite: at most `max_attempts` calls are made.
#[derive(Debug)]
pub struct RetryManager<C: ErrorClassifier = DefaultErrorClassifier> {
    /// Backoff parameters.
    policy: RetryPolicy,
    /// Provider-specific taxonomy.
    classifier: C,
}

impl RetryManager<DefaultErrorClassifier> {
    /// Creates a retry manager with the default taxonomy.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            classifier: DefaultErrorClassifier,
        }
    }
}

impl<C: ErrorClassifier> RetryManager<C> {
    /// Creates a retry manager with a custom taxonomy.
    #[must_use]
    pub const fn with_classifier(policy: RetryPolicy, classifier: C) -> Self {
        Self {
            policy,
            classifier,
        }
    }

    /// Returns the configured policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decides what to do after a capacity-exhausted attempt.
    ///
    /// `attempt` is 1-based and counts the call that just failed. A notice
    /// carrying `retry_after_ms` overrides the computed backoff, still
    /// capped by `max_delay_ms`.
    #[must_use]
    pub fn decide(&self, attempt: u32, notice: &CapacityNotice) -> RetryDecision {
        if attempt >= self.policy.max_attempts {
            return RetryDecision::GiveUp;
        }
        match self.classifier.classify(notice) {
            ErrorClass::Fatal => RetryDecision::GiveUp,
            ErrorClass::Transient => {
                let delay = notice
                    .retry_after_ms
                    .map_or_else(|| self.backoff_millis(attempt), |hint| hint)
                    .min(self.policy.max_delay_ms);
                RetryDecision::RetryAfter(Duration::from_millis(delay))
            }
        }
    }

    /// Computes the jittered exponential backoff for an attempt.
    fn backoff_millis(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(16);
        let unjittered = self
            .policy
            .base_delay_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.policy.max_delay_ms);
        if unjittered == 0 {
            return 0;
        }
        // Full jitter in [unjittered / 2, unjittered].
        let floor = unjittered / 2;
        rand::thread_rng().gen_range(floor ..= unjittered)
    }
}
