// crates/elspeth-core/src/interfaces/mod.rs
// ============================================================================
// Module: Elspeth Interfaces
// Description: Backend-agnostic contracts for plugins, recording, and payloads.
// Purpose: Define the surfaces the orchestration core consumes and exposes.
// Dependencies: crate::core, crate::graph, crate::telemetry, serde, thiserror
// ============================================================================

//! ## Overview
//! Interfaces define how the orchestration core integrates with sources,
//! transforms, gates, sinks, the Landscape Recorder, the payload store, and
//! secrets providers without embedding backend-specific details.
//! Implementations must fail closed on missing or invalid data; the
//! recorder is the only mutable shared resource and all mutations flow
//! through its transactional API.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

use crate::core::hashing::HashDigest;
use crate::core::identifiers::BatchId;
use crate::core::identifiers::BranchName;
use crate::core::identifiers::EdgeId;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::OutcomeId;
use crate::core::identifiers::RouteLabel;
use crate::core::identifiers::RowId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::SinkName;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;
use crate::core::outcome::BatchMemberRecord;
use crate::core::outcome::BatchMemberRole;
use crate::core::outcome::BatchRecord;
use crate::core::outcome::BatchStatus;
use crate::core::outcome::CheckpointRecord;
use crate::core::outcome::CheckpointRequest;
use crate::core::outcome::NodeRegistration;
use crate::core::outcome::NodeStateStatus;
use crate::core::outcome::OutcomeContext;
use crate::core::outcome::OutcomeKind;
use crate::core::outcome::RowRecord;
use crate::core::outcome::RunConfig;
use crate::core::outcome::RunRecord;
use crate::core::outcome::RunStatus;
use crate::core::outcome::TokenOutcomeRecord;
use crate::core::outcome::TriggerReason;
use crate::core::row::PipelineRow;
use crate::core::row::QuarantinedRow;
use crate::core::row::SchemaContract;
use crate::core::time::Timestamp;
use crate::graph::ErrorSinkTarget;
use crate::telemetry::Telemetry;

// ============================================================================
// SECTION: Plugin Context
// ============================================================================

/// Context handed to plugins for audited external calls.
///
/// # Invariants
/// - `state_id` is set in transform context; `token_id` is set whenever the
///   call occurs on behalf of a token.
pub struct PluginContext<'a> {
    /// Run the plugin is executing within.
    pub run_id: RunId,
    /// Node state of the current execution, in transform context.
    pub state_id: Option<StateId>,
    /// Token being processed, when applicable.
    pub token_id: Option<TokenId>,
    /// Landscape recorder for audited writes.
    pub landscape: &'a dyn Landscape,
    /// Telemetry sink for external-call events.
    pub telemetry: &'a dyn Telemetry,
}

// ============================================================================
// SECTION: Source Plugin
// ============================================================================

/// Source plugin errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Source I/O error.
    #[error("source io error: {0}")]
    Io(String),
    /// Source data could not be parsed.
    #[error("source parse error: {0}")]
    Parse(String),
    /// The source signalled cancellation.
    #[error("source cancelled: {0}")]
    Cancelled(String),
    /// Schema contract violation during source initialization.
    #[error("source contract error: {0}")]
    Contract(String),
}

/// One row yielded by a source.
///
/// # Invariants
/// - Quarantined rows never carry a schema contract.
#[derive(Debug, Clone)]
pub enum SourceRow {
    /// A valid row ready for admission.
    Valid {
        /// Raw row data keyed by original field names.
        raw: Map<String, Value>,
        /// Optional per-row contract override (for example a CSV header).
        contract: Option<SchemaContract>,
    },
    /// A row rejected by source validation.
    Quarantined {
        /// The quarantined row and its validation error.
        row: QuarantinedRow,
        /// Optional per-row destination override.
        destination: Option<ErrorSinkTarget>,
    },
}

/// Source of a lazy, finite sequence of rows.
pub trait SourcePlugin {
    /// Binds the plugin to its registered graph node.
    fn bind_node(&mut self, node_id: NodeId);

    /// Returns the bound graph node, when assigned.
    fn node_id(&self) -> Option<&NodeId>;

    /// Prepares the source for iteration.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] when the source cannot be opened.
    fn open(&mut self, _ctx: &PluginContext<'_>) -> Result<(), SourceError> {
        Ok(())
    }

    /// Yields the next row, or `None` at end of source.
    fn next_row(&mut self, ctx: &PluginContext<'_>) -> Option<Result<SourceRow, SourceError>>;

    /// Returns the current schema contract.
    fn schema_contract(&self) -> &SchemaContract;

    /// Replaces the schema contract (used when the first valid row infers
    /// and locks the contract).
    fn set_schema_contract(&mut self, contract: SchemaContract);

    /// Releases source resources deterministically.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] when cleanup fails.
    fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

// ============================================================================
// SECTION: Transform Plugin
// ============================================================================

/// Failure payload for a transform error result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformFailure {
    /// Human-readable failure reason.
    pub reason: String,
    /// Optional structured failure details.
    pub details: Option<Value>,
}

/// Capacity-exhaustion notice consulted by the retry manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityNotice {
    /// Human-readable exhaustion reason.
    pub reason: String,
    /// Suggested retry delay in milliseconds.
    pub retry_after_ms: Option<u64>,
}

/// Result of one transform invocation.
///
/// # Invariants
/// - Variants are stable and exhaustive; the processor matches on enum
///   identity.
#[derive(Debug, Clone)]
pub enum TransformResult {
    /// One row forward.
    Success(PipelineRow),
    /// Batch output; each row becomes a child token via an expand group.
    SuccessMulti(Vec<PipelineRow>),
    /// Per-row failure routed to the transform's error destination.
    Error(TransformFailure),
    /// Transient exhaustion; the retry manager decides what happens next.
    CapacityExhausted(CapacityNotice),
}

/// Row transform plugin.
pub trait TransformPlugin {
    /// Binds the plugin to its registered graph node.
    fn bind_node(&mut self, node_id: NodeId);

    /// Returns the bound graph node, when assigned.
    fn node_id(&self) -> Option<&NodeId>;

    /// Returns `true` when the transform accepts whole batches.
    fn is_batch_aware(&self) -> bool {
        false
    }

    /// Processes one row.
    fn process(&mut self, row: PipelineRow, ctx: &PluginContext<'_>) -> TransformResult;

    /// Processes a batch of rows (batch-aware transforms only).
    fn process_batch(
        &mut self,
        _rows: Vec<PipelineRow>,
        _ctx: &PluginContext<'_>,
    ) -> TransformResult {
        TransformResult::Error(TransformFailure {
            reason: "transform is not batch-aware".to_string(),
            details: None,
        })
    }

    /// Releases per-run client handles deterministically.
    fn close(&mut self) {}
}

// ============================================================================
// SECTION: Gate Plugin
// ============================================================================

/// Gate plugin errors, treated as transform errors of the gate node.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum GateError {
    /// Gate evaluation failed.
    #[error("gate evaluation error: {0}")]
    Evaluation(String),
}

/// Destination of one fork path.
///
/// # Invariants
/// - Variants are stable and exhaustive; comparisons use enum identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkDestination {
    /// The branch continues along the remaining main path.
    Continue,
    /// The branch routes directly to a named sink.
    Sink(SinkName),
}

/// One declared fork path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkPath {
    /// Branch name assigned to the child token.
    pub branch: BranchName,
    /// Destination of the branch.
    pub destination: ForkDestination,
}

/// Routing decision returned by a gate.
///
/// # Invariants
/// - Variants are stable and exhaustive; comparisons use enum identity,
///   never string literals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingAction {
    /// Continue along the main path.
    Continue,
    /// Route the token to a named sink.
    Route(SinkName),
    /// Fork the token into child tokens, one per path.
    ForkToPaths(Vec<ForkPath>),
}

/// Routing gate plugin.
pub trait GatePlugin {
    /// Binds the plugin to its registered graph node.
    fn bind_node(&mut self, node_id: NodeId);

    /// Returns the bound graph node, when assigned.
    fn node_id(&self) -> Option<&NodeId>;

    /// Evaluates the gate for one row.
    ///
    /// # Errors
    ///
    /// Returns [`GateError`] when evaluation fails; the processor treats
    /// this as a transform error of the gate node.
    fn evaluate(
        &mut self,
        row: &PipelineRow,
        ctx: &PluginContext<'_>,
    ) -> Result<RoutingAction, GateError>;
}

// ============================================================================
// SECTION: Sink Plugin
// ============================================================================

/// Sink plugin errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Sink I/O error.
    #[error("sink io error: {0}")]
    Io(String),
    /// Sink write failed.
    #[error("sink write error: {0}")]
    Write(String),
    /// The sink does not support the requested mode.
    #[error("sink mode unsupported: {0}")]
    Unsupported(String),
}

/// Sink open mode.
///
/// # Invariants
/// - Variants are stable for serialization; resume always uses `Append`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkMode {
    /// Start a fresh output artifact.
    Write,
    /// Extend an existing output artifact, preserving its header/schema.
    Append,
}

/// Payload carried by a token into a sink.
///
/// # Invariants
/// - Quarantined payloads never carry a schema contract.
#[derive(Debug, Clone)]
pub enum SinkPayload {
    /// A processed pipeline row.
    Row(PipelineRow),
    /// A quarantined raw row with its validation error.
    Quarantined(QuarantinedRow),
}

/// One token pending durable write at a sink.
#[derive(Debug, Clone)]
pub struct SinkToken {
    /// Token being written.
    pub token_id: TokenId,
    /// Payload to write.
    pub payload: SinkPayload,
}

/// Descriptor of the artifact a sink produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Opaque artifact URI (path or external locator).
    pub uri: String,
    /// Content type, when known.
    pub content_type: Option<String>,
    /// Bytes written, when known.
    pub bytes_written: Option<u64>,
}

/// Write context collecting per-token durability confirmations.
///
/// # Invariants
/// - A token reported via `token_written` has been durably persisted by the
///   sink at the moment of the call.
pub struct SinkWriteContext<'a> {
    /// Run the write belongs to.
    pub run_id: RunId,
    /// Landscape recorder for audited writes.
    pub landscape: &'a dyn Landscape,
    /// Telemetry sink for external-call events.
    pub telemetry: &'a dyn Telemetry,
    /// Tokens confirmed durably written, in write order.
    written: Vec<TokenId>,
}

impl<'a> SinkWriteContext<'a> {
    /// Creates a write context for one sink write call.
    #[must_use]
    pub const fn new(
        run_id: RunId,
        landscape: &'a dyn Landscape,
        telemetry: &'a dyn Telemetry,
    ) -> Self {
        Self {
            run_id,
            landscape,
            telemetry,
            written: Vec::new(),
        }
    }

    /// Confirms one token as durably written.
    pub fn token_written(&mut self, token_id: TokenId) {
        self.written.push(token_id);
    }

    /// Returns the tokens confirmed durably written, in write order.
    #[must_use]
    pub fn written(&self) -> &[TokenId] {
        &self.written
    }
}

/// Terminal sink plugin.
pub trait SinkPlugin {
    /// Binds the plugin to its registered graph node.
    fn bind_node(&mut self, node_id: NodeId);

    /// Returns the bound graph node, when assigned.
    fn node_id(&self) -> Option<&NodeId>;

    /// Prepares the sink in the requested mode.
    ///
    /// Sinks that cannot append must fail fast here when given
    /// [`SinkMode::Append`].
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Unsupported`] when the mode is not supported,
    /// or [`SinkError::Io`] when preparation fails.
    fn prepare(&mut self, mode: SinkMode) -> Result<(), SinkError>;

    /// Writes a batch of tokens, confirming each durably-written token via
    /// [`SinkWriteContext::token_written`].
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the write fails; tokens confirmed before
    /// the failure still count as durably written.
    fn write(
        &mut self,
        tokens: &[SinkToken],
        ctx: &mut SinkWriteContext<'_>,
    ) -> Result<ArtifactDescriptor, SinkError>;

    /// Flushes buffered output.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when flushing fails.
    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Releases sink resources deterministically.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when cleanup fails.
    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

// ============================================================================
// SECTION: Landscape Recorder
// ============================================================================

/// Landscape recorder errors.
///
/// # Invariants
/// - `DuplicateTerminalOutcome` is never swallowed; it indicates an
///   audit-integrity violation.
#[derive(Debug, Error)]
pub enum LandscapeError {
    /// Recorder I/O error.
    #[error("landscape io error: {0}")]
    Io(String),
    /// Database engine error.
    #[error("landscape db error: {0}")]
    Db(String),
    /// Invalid recorder data or arguments.
    #[error("landscape invalid data: {0}")]
    Invalid(String),
    /// Recorder corruption or integrity-check failure.
    #[error("landscape corruption: {0}")]
    Corrupt(String),
    /// Recorder schema version mismatch.
    #[error("landscape version mismatch: {0}")]
    VersionMismatch(String),
    /// A second terminal outcome was attempted for a token.
    #[error("duplicate terminal outcome for token {token_id}")]
    DuplicateTerminalOutcome {
        /// The token with an existing terminal outcome.
        token_id: TokenId,
    },
    /// The fingerprint key for export signing is unavailable.
    #[error("fingerprint key unavailable: {0}")]
    FingerprintKeyUnavailable(String),
}

/// Row creation payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRow {
    /// Run admitting the row.
    pub run_id: RunId,
    /// Source node that admitted the row.
    pub source_node_id: NodeId,
    /// Dense admission index within the run.
    pub row_index: u64,
    /// Canonical hash of the source data.
    pub source_data_hash: HashDigest,
    /// Payload-store key for the source data.
    pub source_data_ref: String,
    /// Admission timestamp.
    pub created_at: Timestamp,
}

/// Signed audit-trail export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedExport {
    /// Run the export covers.
    pub run_id: RunId,
    /// Full audit trail as canonical-ready JSON.
    pub payload: Value,
    /// Canonical hash of the payload.
    pub payload_hash: HashDigest,
    /// Keyed fingerprint over the payload (lowercase hex).
    pub signature: String,
    /// Identifier of the signing key, when the provider names one.
    pub key_id: Option<String>,
}

/// Transactional audit store owning all persistent run state.
pub trait Landscape: Send + Sync {
    /// Begins a run.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the run cannot be created.
    fn begin_run(&self, config: &RunConfig) -> Result<RunRecord, LandscapeError>;

    /// Updates a run's lifecycle status.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the run is unknown or the write fails.
    fn update_run_status(&self, run_id: RunId, status: RunStatus) -> Result<(), LandscapeError>;

    /// Completes a run with a final status.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the run is unknown or the write fails.
    fn complete_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        completed_at: Timestamp,
    ) -> Result<(), LandscapeError>;

    /// Registers a node; `(run_id, node_id)` must be unique.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on duplicates or write failure.
    fn register_node(
        &self,
        run_id: RunId,
        registration: &NodeRegistration,
        registered_at: Timestamp,
    ) -> Result<(), LandscapeError>;

    /// Registers a labeled edge.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when an endpoint is unknown or the write
    /// fails.
    fn register_edge(
        &self,
        run_id: RunId,
        from: &NodeId,
        to: &NodeId,
        label: &RouteLabel,
        created_at: Timestamp,
    ) -> Result<EdgeId, LandscapeError>;

    /// Creates a row admitted by the source.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the write fails.
    fn create_row(&self, row: &NewRow) -> Result<RowId, LandscapeError>;

    /// Creates a token referencing a row.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the row is unknown or the write
    /// fails.
    fn create_token(
        &self,
        row_id: RowId,
        parent: Option<TokenId>,
        branch: Option<&BranchName>,
        created_at: Timestamp,
    ) -> Result<TokenId, LandscapeError>;

    /// Records a token entering a node (status `executing`).
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the write fails.
    fn record_node_state(
        &self,
        run_id: RunId,
        token_id: TokenId,
        node_id: &NodeId,
        started_at: Timestamp,
    ) -> Result<StateId, LandscapeError>;

    /// Completes a node state with a final status.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the state is unknown or the write
    /// fails.
    fn complete_node_state(
        &self,
        state_id: StateId,
        status: NodeStateStatus,
        completed_at: Timestamp,
        error_hash: Option<&HashDigest>,
    ) -> Result<(), LandscapeError>;

    /// Records a token outcome, enforcing terminal uniqueness.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::DuplicateTerminalOutcome`] when a second
    /// terminal record is attempted for the token.
    fn record_token_outcome(
        &self,
        run_id: RunId,
        token_id: TokenId,
        outcome: OutcomeKind,
        context: &OutcomeContext,
        recorded_at: Timestamp,
    ) -> Result<OutcomeId, LandscapeError>;

    /// Returns the latest outcome for a token, terminal-preferred.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the query fails.
    fn get_token_outcome(
        &self,
        token_id: TokenId,
    ) -> Result<Option<TokenOutcomeRecord>, LandscapeError>;

    /// Opens a draft batch for an aggregation node.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the write fails.
    fn create_batch(
        &self,
        run_id: RunId,
        aggregation_node_id: &NodeId,
        opened_at: Timestamp,
    ) -> Result<BatchId, LandscapeError>;

    /// Adds a token to a batch with a membership role.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the batch is unknown or the write
    /// fails.
    fn add_batch_member(
        &self,
        batch_id: BatchId,
        token_id: TokenId,
        role: BatchMemberRole,
    ) -> Result<(), LandscapeError>;

    /// Updates a batch's lifecycle status.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the batch is unknown or the write
    /// fails.
    fn update_batch_status(
        &self,
        batch_id: BatchId,
        status: BatchStatus,
        trigger_reason: Option<TriggerReason>,
        closed_at: Option<Timestamp>,
        state_id: Option<StateId>,
    ) -> Result<(), LandscapeError>;

    /// Increments a batch's attempt counter for a retry, returning the new
    /// attempt number.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the batch is unknown or the write
    /// fails.
    fn retry_batch(&self, batch_id: BatchId) -> Result<u32, LandscapeError>;

    /// Returns batches that are not yet completed.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the query fails.
    fn get_incomplete_batches(&self, run_id: RunId) -> Result<Vec<BatchRecord>, LandscapeError>;

    /// Returns the members of a batch.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the query fails.
    fn get_batch_members(
        &self,
        batch_id: BatchId,
    ) -> Result<Vec<BatchMemberRecord>, LandscapeError>;

    /// Creates a checkpoint for a durably-written token.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the write fails.
    fn create_checkpoint(
        &self,
        request: &CheckpointRequest,
    ) -> Result<CheckpointRecord, LandscapeError>;

    /// Deletes all checkpoints of a run, returning the count removed.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the write fails.
    fn delete_checkpoints(&self, run_id: RunId) -> Result<u64, LandscapeError>;

    /// Lists checkpoints of a run in sequence order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the query fails.
    fn list_checkpoints(&self, run_id: RunId) -> Result<Vec<CheckpointRecord>, LandscapeError>;

    /// Returns rows whose tokens have no terminal outcome and no sink-node
    /// checkpoint, in admission order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the query fails.
    fn get_unprocessed_row_ids(&self, run_id: RunId) -> Result<Vec<RowId>, LandscapeError>;

    /// Returns row records for the requested identifiers, in admission
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the query fails.
    fn get_rows(&self, run_id: RunId, row_ids: &[RowId]) -> Result<Vec<RowRecord>, LandscapeError>;

    /// Returns the initial (unforked, parentless) token of a row.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the query fails.
    fn get_initial_token(&self, row_id: RowId) -> Result<Option<TokenId>, LandscapeError>;

    /// Returns the run record, if present.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the query fails.
    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, LandscapeError>;

    /// Lists all runs, most recent first.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the query fails.
    fn list_runs(&self) -> Result<Vec<RunRecord>, LandscapeError>;

    /// Produces a signed export of a run's audit trail.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::FingerprintKeyUnavailable`] when the
    /// secrets provider cannot supply the fingerprint key.
    fn export_run(
        &self,
        run_id: RunId,
        secrets: &dyn SecretsProvider,
    ) -> Result<SignedExport, LandscapeError>;
}

// ============================================================================
// SECTION: Payload Store
// ============================================================================

/// Payload store errors.
///
/// # Invariants
/// - `Purged` is surfaced unmodified; it is fatal during resume.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The payload for the hash is not present in the store.
    #[error("payload purged: {0}")]
    Purged(String),
    /// Store I/O error.
    #[error("payload io error: {0}")]
    Io(String),
    /// Invalid payload key or data.
    #[error("payload invalid: {0}")]
    Invalid(String),
}

/// Content-address of a stored payload.
///
/// # Invariants
/// - Lowercase hexadecimal SHA-256 of the payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadHash(String);

impl PayloadHash {
    /// Creates a payload hash from its hexadecimal form.
    #[must_use]
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Returns the hexadecimal form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PayloadHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Content-addressed, append-only byte store.
pub trait PayloadStore: Send + Sync {
    /// Stores bytes, returning their content address. Idempotent: storing
    /// the same bytes twice returns the same hash.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError`] when the store rejects the write.
    fn store(&self, bytes: &[u8]) -> Result<PayloadHash, PayloadError>;

    /// Retrieves bytes by content address.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Purged`] when the hash is not present.
    fn retrieve(&self, hash: &PayloadHash) -> Result<Vec<u8>, PayloadError>;
}

// ============================================================================
// SECTION: Secrets Provider
// ============================================================================

/// Secrets provider errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum SecretsError {
    /// No key is configured.
    #[error("secret unavailable: {0}")]
    Unavailable(String),
    /// The provider failed while fetching the key.
    #[error("secrets provider error: {0}")]
    Provider(String),
}

/// Fingerprint key material for export signing.
///
/// # Invariants
/// - Material is never empty and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct FingerprintKey {
    /// Identifier of the key, when the provider names one.
    pub key_id: Option<String>,
    /// Raw key material.
    material: Vec<u8>,
}

impl FingerprintKey {
    /// Creates a fingerprint key; returns `None` for empty material.
    #[must_use]
    pub fn new(key_id: Option<String>, material: Vec<u8>) -> Option<Self> {
        if material.is_empty() {
            return None;
        }
        Some(Self {
            key_id,
            material,
        })
    }

    /// Returns the raw key material.
    #[must_use]
    pub fn material(&self) -> &[u8] {
        &self.material
    }
}

impl fmt::Debug for FingerprintKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintKey")
            .field("key_id", &self.key_id)
            .field("material", &"<redacted>")
            .finish()
    }
}

/// Provider of the fingerprint key used for export signing.
pub trait SecretsProvider: Send + Sync {
    /// Returns the fingerprint key.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::Unavailable`] when no key is configured, or
    /// [`SecretsError::Provider`] when retrieval fails. Implementations
    /// must never return an empty key.
    fn fingerprint_key(&self) -> Result<FingerprintKey, SecretsError>;
}
