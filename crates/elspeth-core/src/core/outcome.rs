// crates/elspeth-core/src/core/outcome.rs
// ============================================================================
// Module: Elspeth Audit Records
// Description: Runs, nodes, rows, tokens, outcomes, batches, and checkpoints.
// Purpose: Capture the closed vocabulary and record shapes of the audit trail.
// Dependencies: crate::core::{hashing, identifiers, time}, serde
// ============================================================================

//! ## Overview
//! These are the durable record shapes owned by the Landscape Recorder. All
//! status vocabularies are closed enumerations with stable snake_case wire
//! forms; cross-subsystem comparisons use enum identity, never string
//! literals. The token-outcome ledger enforces at most one terminal outcome
//! per token.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::core::hashing::HashDigest;
use crate::core::identifiers::BatchId;
use crate::core::identifiers::BranchName;
use crate::core::identifiers::CheckpointId;
use crate::core::identifiers::EdgeId;
use crate::core::identifiers::ExpandGroupId;
use crate::core::identifiers::ForkGroupId;
use crate::core::identifiers::JoinGroupId;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::OutcomeId;
use crate::core::identifiers::PluginName;
use crate::core::identifiers::RouteLabel;
use crate::core::identifiers::RowId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::SinkName;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Run Records
// ============================================================================

/// Run lifecycle status.
///
/// # Invariants
/// - Variants are stable for serialization and audit queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run is actively pumping rows.
    Running,
    /// Run completed successfully.
    Completed,
    /// Run failed; checkpoints remain for resume.
    Failed,
    /// Run was cancelled by the operator or source.
    Cancelled,
}

/// Audit-trail export status for a run.
///
/// # Invariants
/// - Variants are stable for serialization and audit queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    /// No export has been requested.
    NotExported,
    /// A signed export was produced.
    Exported,
}

/// Configuration captured at run begin.
///
/// # Invariants
/// - `config_hash` covers the canonical settings the run was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Canonical hash of the run's configuration.
    pub config_hash: HashDigest,
    /// Canonical serialization format version.
    pub canonical_version: String,
    /// Run start timestamp.
    pub started_at: Timestamp,
}

/// A persisted run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run identifier.
    pub run_id: RunId,
    /// Run start timestamp.
    pub started_at: Timestamp,
    /// Canonical hash of the run's configuration.
    pub config_hash: HashDigest,
    /// Canonical serialization format version.
    pub canonical_version: String,
    /// Run lifecycle status.
    pub status: RunStatus,
    /// Audit-trail export status.
    pub export_status: ExportStatus,
}

// ============================================================================
// SECTION: Node & Edge Records
// ============================================================================

/// Node role within the execution graph.
///
/// # Invariants
/// - Variants are stable for serialization; ordering follows topological
///   tie-break priority (source < transform < gate < sink).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Row source.
    Source,
    /// Row transform (including aggregations and coalesces).
    Transform,
    /// Routing gate.
    Gate,
    /// Terminal sink.
    Sink,
}

/// Reproducibility classification for replay.
///
/// # Invariants
/// - Variants are stable for serialization and audit queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Determinism {
    /// Output depends only on input.
    Deterministic,
    /// Output may vary between invocations.
    NonDeterministic,
    /// Reads external state.
    IoRead,
    /// Writes external state.
    IoWrite,
}

/// Node registration payload.
///
/// # Invariants
/// - `(run_id, node_id)` is unique; nodes are immutable after registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRegistration {
    /// Node identifier.
    pub node_id: NodeId,
    /// Plugin implementing the node.
    pub plugin_name: PluginName,
    /// Node role.
    pub node_type: NodeType,
    /// Plugin version string.
    pub plugin_version: String,
    /// Reproducibility classification.
    pub determinism: Determinism,
    /// Canonical hash of the node's configuration.
    pub config_hash: HashDigest,
    /// Optional schema configuration as JSON.
    pub schema_config_json: Option<Value>,
}

/// A registered node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Run owning the node.
    pub run_id: RunId,
    /// Registration payload.
    pub registration: NodeRegistration,
    /// Registration timestamp.
    pub registered_at: Timestamp,
}

/// A registered edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// Edge identifier.
    pub edge_id: EdgeId,
    /// Run owning the edge.
    pub run_id: RunId,
    /// Origin node.
    pub from_node_id: NodeId,
    /// Destination node.
    pub to_node_id: NodeId,
    /// Route label.
    pub label: RouteLabel,
    /// Registration timestamp.
    pub created_at: Timestamp,
}

// ============================================================================
// SECTION: Row & Token Records
// ============================================================================

/// A persisted source row.
///
/// # Invariants
/// - `row_index` is dense and strictly monotonic within a run.
/// - `source_data_ref` is a key into the payload store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRecord {
    /// Row identifier.
    pub row_id: RowId,
    /// Run owning the row.
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

/// A persisted token (in-flight reference to a row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Token identifier.
    pub token_id: TokenId,
    /// Row the token references.
    pub row_id: RowId,
    /// Branch name when the token was created by a fork.
    pub branch_name: Option<BranchName>,
    /// Parent token for lineage queries (weak reference).
    pub parent_token_id: Option<TokenId>,
    /// Creation timestamp.
    pub created_at: Timestamp,
}

// ============================================================================
// SECTION: Node States
// ============================================================================

/// Status of a token's passage through a node.
///
/// # Invariants
/// - Variants are stable for serialization and audit queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStateStatus {
    /// The node is currently executing for the token.
    Executing,
    /// The node completed successfully.
    Completed,
    /// The node failed.
    Failed,
    /// The node routed the token elsewhere.
    Routed,
    /// The token was quarantined at the node.
    Quarantined,
}

/// A recorded node state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStateRecord {
    /// State identifier.
    pub state_id: StateId,
    /// Run owning the state.
    pub run_id: RunId,
    /// Token passing through the node.
    pub token_id: TokenId,
    /// Node being executed.
    pub node_id: NodeId,
    /// Passage status.
    pub status: NodeStateStatus,
    /// Execution start timestamp.
    pub started_at: Timestamp,
    /// Execution end timestamp, when finished.
    pub completed_at: Option<Timestamp>,
    /// Canonical hash of the error, when failed.
    pub error_hash: Option<HashDigest>,
}

// ============================================================================
// SECTION: Token Outcomes
// ============================================================================

/// Outcome kind in the token-outcome ledger.
///
/// # Invariants
/// - [`OutcomeKind::Buffered`] is the only non-terminal kind.
/// - Variants are stable for serialization and audit queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// The token reached a sink through the main path.
    Completed,
    /// The token was routed to a named sink by a gate.
    Routed,
    /// The token forked into child tokens.
    Forked,
    /// The token merged into a coalesced child token.
    Coalesced,
    /// The token expanded into multiple child tokens.
    Expanded,
    /// The token is buffered in an aggregation (non-terminal).
    Buffered,
    /// The token was consumed as input to an executed batch.
    ConsumedInBatch,
    /// The token failed.
    Failed,
    /// The token was quarantined at the source.
    Quarantined,
}

impl OutcomeKind {
    /// Returns `true` when the outcome is terminal for its token.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Buffered)
    }
}

/// Context attached to a token outcome.
///
/// # Invariants
/// - Group identifiers are set only for the outcome kinds that define them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeContext {
    /// Sink the token was durably written to.
    pub sink_name: Option<SinkName>,
    /// Batch the token joined.
    pub batch_id: Option<BatchId>,
    /// Fork group the token belongs to.
    pub fork_group_id: Option<ForkGroupId>,
    /// Join group the token belongs to.
    pub join_group_id: Option<JoinGroupId>,
    /// Expand group the token belongs to.
    pub expand_group_id: Option<ExpandGroupId>,
    /// Canonical hash of the causing error, when failed.
    pub error_hash: Option<HashDigest>,
    /// Free-form audit context.
    pub context_json: Option<Value>,
}

/// A recorded token outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenOutcomeRecord {
    /// Outcome identifier.
    pub outcome_id: OutcomeId,
    /// Run owning the outcome.
    pub run_id: RunId,
    /// Token the outcome belongs to.
    pub token_id: TokenId,
    /// Outcome kind.
    pub outcome: OutcomeKind,
    /// Whether the outcome is terminal.
    pub is_terminal: bool,
    /// Recording timestamp.
    pub recorded_at: Timestamp,
    /// Outcome context.
    pub context: OutcomeContext,
}

// ============================================================================
// SECTION: Batches
// ============================================================================

/// Batch lifecycle status.
///
/// # Invariants
/// - Variants are stable for serialization and audit queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Open and accepting members.
    Draft,
    /// Batch transform is executing.
    Executing,
    /// Batch transform failed.
    Failed,
    /// Batch completed.
    Completed,
}

/// Why an aggregation flushed a batch.
///
/// # Invariants
/// - Variants are stable for serialization and audit queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    /// Buffered count reached the configured threshold.
    Count,
    /// Lazy wall-clock timeout fired.
    WallClockTimeout,
    /// End-of-source flush.
    EndOfSource,
}

/// Membership role inside a batch.
///
/// # Invariants
/// - Variants are stable for serialization and audit queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMemberRole {
    /// Buffered input token.
    Input,
    /// Token produced by the batch.
    Output,
}

/// A persisted batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    /// Batch identifier.
    pub batch_id: BatchId,
    /// Run owning the batch.
    pub run_id: RunId,
    /// Aggregation node that opened the batch.
    pub aggregation_node_id: NodeId,
    /// Batch status.
    pub status: BatchStatus,
    /// Execution attempt counter (1-based).
    pub attempt: u32,
    /// Why the batch was flushed.
    pub trigger_reason: Option<TriggerReason>,
    /// Opening timestamp.
    pub opened_at: Timestamp,
    /// Closing timestamp, when closed.
    pub closed_at: Option<Timestamp>,
    /// Node state of the batch execution, when executed.
    pub state_id: Option<StateId>,
}

/// A batch membership link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMemberRecord {
    /// Batch the token belongs to.
    pub batch_id: BatchId,
    /// Member token.
    pub token_id: TokenId,
    /// Membership role.
    pub role: BatchMemberRole,
}

// ============================================================================
// SECTION: Checkpoints
// ============================================================================

/// Checkpoint payload format version.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Checkpoint creation request.
///
/// # Invariants
/// - `node_id` is the sink node the token was durably written to, never an
///   upstream transform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRequest {
    /// Run owning the checkpoint.
    pub run_id: RunId,
    /// Token durably written to the sink.
    pub token_id: TokenId,
    /// Sink node the token was written to.
    pub node_id: NodeId,
    /// Canonical hash of the full upstream topology.
    pub upstream_topology_hash: HashDigest,
    /// Canonical hash of the checkpoint node's configuration.
    pub checkpoint_node_config_hash: HashDigest,
    /// Serialized aggregation state, opaque to the orchestrator.
    pub aggregation_state_json: Option<Value>,
    /// Checkpoint payload format version.
    pub format_version: u32,
    /// Creation timestamp.
    pub created_at: Timestamp,
}

/// A persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Checkpoint identifier.
    pub checkpoint_id: CheckpointId,
    /// Monotonic sequence within the run.
    pub sequence_number: u64,
    /// Creation request payload.
    pub request: CheckpointRequest,
}
