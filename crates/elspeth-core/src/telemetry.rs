// crates/elspeth-core/src/telemetry.rs
// ============================================================================
// Module: Elspeth Telemetry
// Description: Observability hooks for external calls made by plugins.
// Purpose: Provide event emission without hard backend dependencies.
// Dependencies: crate::core::identifiers, serde
// ============================================================================

//! ## Overview
//! This module exposes a thin telemetry interface for external-call events.
//! It is intentionally dependency-light so downstream deployments can plug
//! in their metrics or tracing backends without redesign. Telemetry counters
//! may be inflated relative to durable output when a crash occurs between
//! processing and sink write; token outcomes are the durable truth.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Serialize;

use crate::core::identifiers::OperationId;
use crate::core::identifiers::PluginName;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;

// ============================================================================
// SECTION: Events
// ============================================================================

/// External-call outcome classification.
///
/// # Invariants
/// - Variants are stable for telemetry labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Call succeeded.
    Ok,
    /// Call failed.
    Error,
}

/// Telemetry events emitted by the core.
///
/// # Invariants
/// - Exactly one of `state_id` (transform context) or `operation_id`
///   (lifecycle context) is set, never both.
/// - `token_id` is included whenever the call occurs in transform context.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// An external call made by a plugin completed.
    ExternalCallCompleted {
        /// Plugin that made the call.
        plugin: PluginName,
        /// Lifecycle operation identifier, outside transform context.
        operation_id: Option<OperationId>,
        /// Node state identifier, in transform context.
        state_id: Option<StateId>,
        /// Token on whose behalf the call was made, when applicable.
        token_id: Option<TokenId>,
        /// Call latency in milliseconds.
        latency_ms: u64,
        /// Call outcome.
        status: CallStatus,
    },
}

impl TelemetryEvent {
    /// Builds an external-call event in transform context.
    #[must_use]
    pub const fn external_call_transform(
        plugin: PluginName,
        state_id: StateId,
        token_id: Option<TokenId>,
        latency_ms: u64,
        status: CallStatus,
    ) -> Self {
        Self::ExternalCallCompleted {
            plugin,
            operation_id: None,
            state_id: Some(state_id),
            token_id,
            latency_ms,
            status,
        }
    }

    /// Builds an external-call event in lifecycle context.
    #[must_use]
    pub const fn external_call_lifecycle(
        plugin: PluginName,
        operation_id: OperationId,
        latency_ms: u64,
        status: CallStatus,
    ) -> Self {
        Self::ExternalCallCompleted {
            plugin,
            operation_id: Some(operation_id),
            state_id: None,
            token_id: None,
            latency_ms,
            status,
        }
    }
}

// ============================================================================
// SECTION: Trait
// ============================================================================

/// Telemetry sink for core events.
pub trait Telemetry: Send + Sync {
    /// Records a telemetry event.
    fn emit(&self, event: &TelemetryEvent);
}

/// No-op telemetry sink.
///
/// # Invariants
/// - Events are intentionally discarded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn emit(&self, _event: &TelemetryEvent) {}
}
