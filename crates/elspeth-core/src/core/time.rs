// crates/elspeth-core/src/core/time.rs
// ============================================================================
// Module: Elspeth Time Model
// Description: Canonical timestamps and the clock seam used by the runtime.
// Purpose: Keep row processing replayable by isolating wall-clock reads.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Elspeth records explicit unix-millisecond timestamps in every audit
//! record. The processor and orchestrator never call the system clock
//! directly; they read time through the [`Clock`] trait so that aggregation
//! timeout behavior is drivable from tests without sleeping.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Timestamp
// ============================================================================

/// Canonical timestamp in unix epoch milliseconds.
///
/// # Invariants
/// - Values are explicitly provided by callers or a [`Clock`]; monotonicity
///   is a caller responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from unix epoch milliseconds.
    #[must_use]
    pub const fn from_unix_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as unix epoch milliseconds.
    #[must_use]
    pub const fn as_unix_millis(self) -> i64 {
        self.0
    }

    /// Returns the elapsed milliseconds since `earlier` (saturating at zero).
    #[must_use]
    pub const fn millis_since(self, earlier: Self) -> i64 {
        let delta = self.0 - earlier.0;
        if delta < 0 { 0 } else { delta }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// SECTION: Clock Seam
// ============================================================================

/// Time source consulted by the runtime for audit records and lazy timeouts.
pub trait Clock: Send + Sync {
    /// Returns the current timestamp.
    fn now(&self) -> Timestamp;
}

/// Production clock backed by the operating system.
///
/// # Invariants
/// - Times before the unix epoch clamp to zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Timestamp::from_unix_millis(i64::try_from(now.as_millis()).unwrap_or(i64::MAX))
    }
}

/// Manually-advanced clock for deterministic tests.
///
/// # Invariants
/// - Time only moves when `advance_millis` or `set_millis` is called.
#[derive(Debug, Default)]
pub struct ManualClock {
    /// Current time in unix epoch milliseconds.
    now_millis: AtomicI64,
}

impl ManualClock {
    /// Creates a manual clock starting at the provided millisecond value.
    #[must_use]
    pub const fn starting_at(millis: i64) -> Self {
        Self {
            now_millis: AtomicI64::new(millis),
        }
    }

    /// Advances the clock by the provided number of milliseconds.
    pub fn advance_millis(&self, millis: i64) {
        self.now_millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute millisecond value.
    pub fn set_millis(&self, millis: i64) {
        self.now_millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_unix_millis(self.now_millis.load(Ordering::SeqCst))
    }
}
