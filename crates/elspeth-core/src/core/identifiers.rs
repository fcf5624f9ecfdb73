// crates/elspeth-core/src/core/identifiers.rs
// ============================================================================
// Module: Elspeth Identifiers
// Description: Canonical opaque identifiers for runs, rows, tokens, and nodes.
// Purpose: Provide strongly typed, serializable identifiers with stable wire forms.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! This module defines the canonical identifiers used throughout Elspeth.
//! Recorder-assigned identifiers are numeric, non-zero, and 1-based; names
//! chosen by pipeline operators (nodes, sinks, routes, branches) are opaque
//! strings. All identifiers serialize transparently on the wire.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::num::NonZeroU64;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Numeric Identifier Macro
// ============================================================================

/// Declares a recorder-assigned numeric identifier newtype.
macro_rules! numeric_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        ///
        /// # Invariants
        /// - Always >= 1 (non-zero, 1-based); assigned by the Landscape
        ///   Recorder and never reused within a run.
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(NonZeroU64);

        impl $name {
            /// Creates a new identifier from a non-zero value.
            #[must_use]
            pub const fn new(id: NonZeroU64) -> Self {
                Self(id)
            }

            /// Creates an identifier from a raw value (returns `None` if zero).
            #[must_use]
            pub fn from_raw(raw: u64) -> Option<Self> {
                NonZeroU64::new(raw).map(Self)
            }

            /// Returns the raw identifier value (always >= 1).
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0.get()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.get().fmt(f)
            }
        }
    };
}

numeric_id!(
    /// Run identifier covering one end-to-end pipeline execution.
    RunId
);
numeric_id!(
    /// Edge identifier within a registered execution graph.
    EdgeId
);
numeric_id!(
    /// Row identifier for a source row admitted to a run.
    RowId
);
numeric_id!(
    /// Token identifier for an in-flight reference to a row.
    TokenId
);
numeric_id!(
    /// Node-state identifier for a token's passage through a node.
    StateId
);
numeric_id!(
    /// Outcome identifier within the token-outcome ledger.
    OutcomeId
);
numeric_id!(
    /// Batch identifier grouping tokens buffered by an aggregation.
    BatchId
);
numeric_id!(
    /// Checkpoint identifier for a durable post-sink recovery marker.
    CheckpointId
);
numeric_id!(
    /// Fork-group identifier linking child tokens emitted by one fork.
    ForkGroupId
);
numeric_id!(
    /// Join-group identifier linking branch tokens awaited by a coalesce.
    JoinGroupId
);
numeric_id!(
    /// Expand-group identifier linking child tokens of a multi-row output.
    ExpandGroupId
);

// ============================================================================
// SECTION: String Identifier Macro
// ============================================================================

/// Declares an operator-chosen opaque string identifier newtype.
macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        ///
        /// # Invariants
        /// - Opaque UTF-8 string; no normalization or validation is applied by
        ///   this type.
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }
    };
}

string_id!(
    /// Node identifier chosen by the pipeline configuration.
    NodeId
);
string_id!(
    /// Sink name referenced by routes and error destinations.
    SinkName
);
string_id!(
    /// Route label attached to a graph edge.
    RouteLabel
);
string_id!(
    /// Branch name attached to a forked child token.
    BranchName
);
string_id!(
    /// Plugin name as declared by the plugin implementation.
    PluginName
);
string_id!(
    /// Operation identifier for lifecycle-scoped external calls.
    OperationId
);
