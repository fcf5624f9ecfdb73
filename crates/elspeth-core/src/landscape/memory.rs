// crates/elspeth-core/src/landscape/memory.rs
// ============================================================================
// Module: Elspeth In-Memory Landscape
// Description: Invariant-enforcing in-memory recorder for tests and embedding.
// Purpose: Provide a Landscape implementation without a database.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! The in-memory landscape keeps the same table shapes and enforces the same
//! invariants as the durable SQLite recorder, most importantly terminal
//! outcome uniqueness, without persistence. It backs processor and
//! orchestrator unit tests and is usable by embedders that do not need a
//! durable audit trail.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::PoisonError;

use serde_json::json;

use crate::core::hashing::DEFAULT_HASH_ALGORITHM;
use crate::core::hashing::HashDigest;
use crate::core::hashing::canonical_json_bytes;
use crate::core::hashing::hash_bytes;
use crate::core::identifiers::BatchId;
use crate::core::identifiers::BranchName;
use crate::core::identifiers::CheckpointId;
use crate::core::identifiers::EdgeId;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::OutcomeId;
use crate::core::identifiers::RouteLabel;
use crate::core::identifiers::RowId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;
use crate::core::outcome::BatchMemberRecord;
use crate::core::outcome::BatchMemberRole;
use crate::core::outcome::BatchRecord;
use crate::core::outcome::BatchStatus;
use crate::core::outcome::CheckpointRecord;
use crate::core::outcome::CheckpointRequest;
use crate::core::outcome::EdgeRecord;
use crate::core::outcome::ExportStatus;
use crate::core::outcome::NodeRecord;
use crate::core::outcome::NodeRegistration;
use crate::core::outcome::NodeStateRecord;
use crate::core::outcome::NodeStateStatus;
use crate::core::outcome::OutcomeContext;
use crate::core::outcome::OutcomeKind;
use crate::core::outcome::RowRecord;
use crate::core::outcome::RunConfig;
use crate::core::outcome::RunRecord;
use crate::core::outcome::RunStatus;
use crate::core::outcome::TokenOutcomeRecord;
use crate::core::outcome::TokenRecord;
use crate::core::outcome::TriggerReason;
use crate::core::time::Timestamp;
use crate::interfaces::Landscape;
use crate::interfaces::LandscapeError;
use crate::interfaces::NewRow;
use crate::interfaces::SecretsProvider;
use crate::interfaces::SignedExport;

// ============================================================================
// SECTION: State
// ============================================================================

/// Mutable table state behind the mutex.
#[derive(Debug, Default)]
struct MemoryState {
    /// Monotonic identifier counter shared by all tables.
    next_id: u64,
    /// Runs keyed by identifier.
    runs: BTreeMap<RunId, RunRecord>,
    /// Nodes keyed by `(run, node)`.
    nodes: BTreeMap<(RunId, NodeId), NodeRecord>,
    /// Edges in registration order.
    edges: Vec<EdgeRecord>,
    /// Rows keyed by identifier.
    rows: BTreeMap<RowId, RowRecord>,
    /// Tokens keyed by identifier.
    tokens: BTreeMap<TokenId, TokenRecord>,
    /// Node states keyed by identifier.
    node_states: BTreeMap<StateId, NodeStateRecord>,
    /// Token outcomes in recording order.
    outcomes: Vec<TokenOutcomeRecord>,
    /// Batches keyed by identifier.
    batches: BTreeMap<BatchId, BatchRecord>,
    /// Batch members in insertion order.
    batch_members: Vec<BatchMemberRecord>,
    /// Checkpoints in sequence order.
    checkpoints: Vec<CheckpointRecord>,
}

impl MemoryState {
    /// Allocates the next non-zero identifier.
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory landscape recorder.
///
/// # Invariants
/// - Terminal outcome uniqueness is enforced exactly as in the durable
///   recorder.
#[derive(Debug, Default)]
pub struct MemoryLandscape {
    /// Table state.
    state: Mutex<MemoryState>,
}

impl MemoryLandscape {
    /// Creates an empty in-memory landscape.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the state, recovering from poisoning.
    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns all recorded outcomes for inspection in tests.
    #[must_use]
    pub fn outcomes(&self) -> Vec<TokenOutcomeRecord> {
        self.lock().outcomes.clone()
    }

    /// Returns all recorded node states for inspection in tests.
    #[must_use]
    pub fn node_states(&self) -> Vec<NodeStateRecord> {
        self.lock().node_states.values().cloned().collect()
    }

    /// Returns all tokens for inspection in tests.
    #[must_use]
    pub fn tokens(&self) -> Vec<TokenRecord> {
        self.lock().tokens.values().cloned().collect()
    }
}

// ============================================================================
// SECTION: Landscape Implementation
// ============================================================================

impl Landscape for MemoryLandscape {
    fn begin_run(&self, config: &RunConfig) -> Result<RunRecord, LandscapeError> {
        let mut state = self.lock();
        let run_id = RunId::from_raw(state.next())
            .ok_or_else(|| LandscapeError::Invalid("run id overflow".to_string()))?;
        let record = RunRecord {
            run_id,
            started_at: config.started_at,
            config_hash: config.config_hash.clone(),
            canonical_version: config.canonical_version.clone(),
            status: RunStatus::Running,
            export_status: ExportStatus::NotExported,
        };
        state.runs.insert(run_id, record.clone());
        Ok(record)
    }

    fn update_run_status(&self, run_id: RunId, status: RunStatus) -> Result<(), LandscapeError> {
        let mut state = self.lock();
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| LandscapeError::Invalid(format!("unknown run: {run_id}")))?;
        run.status = status;
        Ok(())
    }

    fn complete_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        _completed_at: Timestamp,
    ) -> Result<(), LandscapeError> {
        self.update_run_status(run_id, status)
    }

    fn register_node(
        &self,
        run_id: RunId,
        registration: &NodeRegistration,
        registered_at: Timestamp,
    ) -> Result<(), LandscapeError> {
        let mut state = self.lock();
        if !state.runs.contains_key(&run_id) {
            return Err(LandscapeError::Invalid(format!("unknown run: {run_id}")));
        }
        let key = (run_id, registration.node_id.clone());
        if state.nodes.contains_key(&key) {
            return Err(LandscapeError::Invalid(format!(
                "node already registered: {}",
                registration.node_id
            )));
        }
        state.nodes.insert(key, NodeRecord {
            run_id,
            registration: registration.clone(),
            registered_at,
        });
        Ok(())
    }

    fn register_edge(
        &self,
        run_id: RunId,
        from: &NodeId,
        to: &NodeId,
        label: &RouteLabel,
        created_at: Timestamp,
    ) -> Result<EdgeId, LandscapeError> {
        let mut state = self.lock();
        for node in [from, to] {
            if !state.nodes.contains_key(&(run_id, node.clone())) {
                return Err(LandscapeError::Invalid(format!("unknown node in edge: {node}")));
            }
        }
        let edge_id = EdgeId::from_raw(state.next())
            .ok_or_else(|| LandscapeError::Invalid("edge id overflow".to_string()))?;
        state.edges.push(EdgeRecord {
            edge_id,
            run_id,
            from_node_id: from.clone(),
            to_node_id: to.clone(),
            label: label.clone(),
            created_at,
        });
        Ok(edge_id)
    }

    fn create_row(&self, row: &NewRow) -> Result<RowId, LandscapeError> {
        let mut state = self.lock();
        if !state.runs.contains_key(&row.run_id) {
            return Err(LandscapeError::Invalid(format!("unknown run: {}", row.run_id)));
        }
        let row_id = RowId::from_raw(state.next())
            .ok_or_else(|| LandscapeError::Invalid("row id overflow".to_string()))?;
        state.rows.insert(row_id, RowRecord {
            row_id,
            run_id: row.run_id,
            source_node_id: row.source_node_id.clone(),
            row_index: row.row_index,
            source_data_hash: row.source_data_hash.clone(),
            source_data_ref: row.source_data_ref.clone(),
            created_at: row.created_at,
        });
        Ok(row_id)
    }

    fn create_token(
        &self,
        row_id: RowId,
        parent: Option<TokenId>,
        branch: Option<&BranchName>,
        created_at: Timestamp,
    ) -> Result<TokenId, LandscapeError> {
        let mut state = self.lock();
        if !state.rows.contains_key(&row_id) {
            return Err(LandscapeError::Invalid(format!("unknown row: {row_id}")));
        }
        let token_id = TokenId::from_raw(state.next())
            .ok_or_else(|| LandscapeError::Invalid("token id overflow".to_string()))?;
        state.tokens.insert(token_id, TokenRecord {
            token_id,
            row_id,
            branch_name: branch.cloned(),
            parent_token_id: parent,
            created_at,
        });
        Ok(token_id)
    }

    fn record_node_state(
        &self,
        run_id: RunId,
        token_id: TokenId,
        node_id: &NodeId,
        started_at: Timestamp,
    ) -> Result<StateId, LandscapeError> {
        let mut state = self.lock();
        if !state.tokens.contains_key(&token_id) {
            return Err(LandscapeError::Invalid(format!("unknown token: {token_id}")));
        }
        let state_id = StateId::from_raw(state.next())
            .ok_or_else(|| LandscapeError::Invalid("state id overflow".to_string()))?;
        state.node_states.insert(state_id, NodeStateRecord {
            state_id,
            run_id,
            token_id,
            node_id: node_id.clone(),
            status: NodeStateStatus::Executing,
            started_at,
            completed_at: None,
            error_hash: None,
        });
        Ok(state_id)
    }

    fn complete_node_state(
        &self,
        state_id: StateId,
        status: NodeStateStatus,
        completed_at: Timestamp,
        error_hash: Option<&HashDigest>,
    ) -> Result<(), LandscapeError> {
        let mut state = self.lock();
        let record = state
            .node_states
            .get_mut(&state_id)
            .ok_or_else(|| LandscapeError::Invalid(format!("unknown node state: {state_id}")))?;
        record.status = status;
        record.completed_at = Some(completed_at);
        record.error_hash = error_hash.cloned();
        Ok(())
    }

    fn record_token_outcome(
        &self,
        run_id: RunId,
        token_id: TokenId,
        outcome: OutcomeKind,
        context: &OutcomeContext,
        recorded_at: Timestamp,
    ) -> Result<OutcomeId, LandscapeError> {
        let mut state = self.lock();
        if !state.tokens.contains_key(&token_id) {
            return Err(LandscapeError::Invalid(format!("unknown token: {token_id}")));
        }
        if outcome.is_terminal()
            && state
                .outcomes
                .iter()
                .any(|record| record.token_id == token_id && record.is_terminal)
        {
            return Err(LandscapeError::DuplicateTerminalOutcome {
                token_id,
            });
        }
        let outcome_id = OutcomeId::from_raw(state.next())
            .ok_or_else(|| LandscapeError::Invalid("outcome id overflow".to_string()))?;
        state.outcomes.push(TokenOutcomeRecord {
            outcome_id,
            run_id,
            token_id,
            outcome,
            is_terminal: outcome.is_terminal(),
            recorded_at,
            context: context.clone(),
        });
        Ok(outcome_id)
    }

    fn get_token_outcome(
        &self,
        token_id: TokenId,
    ) -> Result<Option<TokenOutcomeRecord>, LandscapeError> {
        let state = self.lock();
        let terminal = state
            .outcomes
            .iter()
            .rev()
            .find(|record| record.token_id == token_id && record.is_terminal);
        if let Some(record) = terminal {
            return Ok(Some(record.clone()));
        }
        Ok(state
            .outcomes
            .iter()
            .rev()
            .find(|record| record.token_id == token_id)
            .cloned())
    }

    fn create_batch(
        &self,
        run_id: RunId,
        aggregation_node_id: &NodeId,
        opened_at: Timestamp,
    ) -> Result<BatchId, LandscapeError> {
        let mut state = self.lock();
        let batch_id = BatchId::from_raw(state.next())
            .ok_or_else(|| LandscapeError::Invalid("batch id overflow".to_string()))?;
        state.batches.insert(batch_id, BatchRecord {
            batch_id,
            run_id,
            aggregation_node_id: aggregation_node_id.clone(),
            status: BatchStatus::Draft,
            attempt: 1,
            trigger_reason: None,
            opened_at,
            closed_at: None,
            state_id: None,
        });
        Ok(batch_id)
    }

    fn add_batch_member(
        &self,
        batch_id: BatchId,
        token_id: TokenId,
        role: BatchMemberRole,
    ) -> Result<(), LandscapeError> {
        let mut state = self.lock();
        if !state.batches.contains_key(&batch_id) {
            return Err(LandscapeError::Invalid(format!("unknown batch: {batch_id}")));
        }
        state.batch_members.push(BatchMemberRecord {
            batch_id,
            token_id,
            role,
        });
        Ok(())
    }

    fn update_batch_status(
        &self,
        batch_id: BatchId,
        status: BatchStatus,
        trigger_reason: Option<TriggerReason>,
        closed_at: Option<Timestamp>,
        state_id: Option<StateId>,
    ) -> Result<(), LandscapeError> {
        let mut state = self.lock();
        let batch = state
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| LandscapeError::Invalid(format!("unknown batch: {batch_id}")))?;
        batch.status = status;
        if trigger_reason.is_some() {
            batch.trigger_reason = trigger_reason;
        }
        if closed_at.is_some() {
            batch.closed_at = closed_at;
        }
        if state_id.is_some() {
            batch.state_id = state_id;
        }
        Ok(())
    }

    fn retry_batch(&self, batch_id: BatchId) -> Result<u32, LandscapeError> {
        let mut state = self.lock();
        let batch = state
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| LandscapeError::Invalid(format!("unknown batch: {batch_id}")))?;
        batch.attempt += 1;
        Ok(batch.attempt)
    }

    fn get_incomplete_batches(&self, run_id: RunId) -> Result<Vec<BatchRecord>, LandscapeError> {
        let state = self.lock();
        Ok(state
            .batches
            .values()
            .filter(|batch| {
                batch.run_id == run_id && batch.status != BatchStatus::Completed
            })
            .cloned()
            .collect())
    }

    fn get_batch_members(
        &self,
        batch_id: BatchId,
    ) -> Result<Vec<BatchMemberRecord>, LandscapeError> {
        let state = self.lock();
        Ok(state
            .batch_members
            .iter()
            .filter(|member| member.batch_id == batch_id)
            .cloned()
            .collect())
    }

    fn create_checkpoint(
        &self,
        request: &CheckpointRequest,
    ) -> Result<CheckpointRecord, LandscapeError> {
        let mut state = self.lock();
        // Checkpoints follow their token's terminal outcome, never precede it.
        let has_terminal = state
            .outcomes
            .iter()
            .any(|record| record.token_id == request.token_id && record.is_terminal);
        if !has_terminal {
            return Err(LandscapeError::Invalid(format!(
                "checkpoint for token {} without terminal outcome",
                request.token_id
            )));
        }
        let sequence_number = state
            .checkpoints
            .iter()
            .filter(|checkpoint| checkpoint.request.run_id == request.run_id)
            .count() as u64
            + 1;
        let checkpoint_id = CheckpointId::from_raw(state.next())
            .ok_or_else(|| LandscapeError::Invalid("checkpoint id overflow".to_string()))?;
        let record = CheckpointRecord {
            checkpoint_id,
            sequence_number,
            request: request.clone(),
        };
        state.checkpoints.push(record.clone());
        Ok(record)
    }

    fn delete_checkpoints(&self, run_id: RunId) -> Result<u64, LandscapeError> {
        let mut state = self.lock();
        let before = state.checkpoints.len();
        state.checkpoints.retain(|checkpoint| checkpoint.request.run_id != run_id);
        Ok((before - state.checkpoints.len()) as u64)
    }

    fn list_checkpoints(&self, run_id: RunId) -> Result<Vec<CheckpointRecord>, LandscapeError> {
        let state = self.lock();
        Ok(state
            .checkpoints
            .iter()
            .filter(|checkpoint| checkpoint.request.run_id == run_id)
            .cloned()
            .collect())
    }

    fn get_unprocessed_row_ids(&self, run_id: RunId) -> Result<Vec<RowId>, LandscapeError> {
        let state = self.lock();
        let mut rows: Vec<&RowRecord> =
            state.rows.values().filter(|row| row.run_id == run_id).collect();
        rows.sort_by_key(|row| row.row_index);
        let mut unprocessed = Vec::new();
        for row in rows {
            let tokens: Vec<TokenId> = state
                .tokens
                .values()
                .filter(|token| token.row_id == row.row_id)
                .map(|token| token.token_id)
                .collect();
            let has_terminal = state
                .outcomes
                .iter()
                .any(|record| tokens.contains(&record.token_id) && record.is_terminal);
            let has_checkpoint = state
                .checkpoints
                .iter()
                .any(|checkpoint| tokens.contains(&checkpoint.request.token_id));
            if !has_terminal && !has_checkpoint {
                unprocessed.push(row.row_id);
            }
        }
        Ok(unprocessed)
    }

    fn get_rows(&self, run_id: RunId, row_ids: &[RowId]) -> Result<Vec<RowRecord>, LandscapeError> {
        let state = self.lock();
        let mut rows: Vec<RowRecord> = state
            .rows
            .values()
            .filter(|row| row.run_id == run_id && row_ids.contains(&row.row_id))
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.row_index);
        Ok(rows)
    }

    fn get_initial_token(&self, row_id: RowId) -> Result<Option<TokenId>, LandscapeError> {
        let state = self.lock();
        Ok(state
            .tokens
            .values()
            .filter(|token| {
                token.row_id == row_id
                    && token.parent_token_id.is_none()
                    && token.branch_name.is_none()
            })
            .map(|token| token.token_id)
            .min())
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, LandscapeError> {
        Ok(self.lock().runs.get(&run_id).cloned())
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>, LandscapeError> {
        let state = self.lock();
        let mut runs: Vec<RunRecord> = state.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.run_id.cmp(&a.run_id));
        Ok(runs)
    }

    fn export_run(
        &self,
        run_id: RunId,
        secrets: &dyn SecretsProvider,
    ) -> Result<SignedExport, LandscapeError> {
        let key = secrets
            .fingerprint_key()
            .map_err(|err| LandscapeError::FingerprintKeyUnavailable(err.to_string()))?;
        let mut state = self.lock();
        let run = state
            .runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| LandscapeError::Invalid(format!("unknown run: {run_id}")))?;
        let payload = json!({
            "run": run,
            "nodes": state
                .nodes
                .values()
                .filter(|node| node.run_id == run_id)
                .collect::<Vec<_>>(),
            "edges": state
                .edges
                .iter()
                .filter(|edge| edge.run_id == run_id)
                .collect::<Vec<_>>(),
            "rows": state
                .rows
                .values()
                .filter(|row| row.run_id == run_id)
                .collect::<Vec<_>>(),
            "outcomes": state
                .outcomes
                .iter()
                .filter(|outcome| outcome.run_id == run_id)
                .collect::<Vec<_>>(),
            "checkpoints": state
                .checkpoints
                .iter()
                .filter(|checkpoint| checkpoint.request.run_id == run_id)
                .collect::<Vec<_>>(),
        });
        let bytes = canonical_json_bytes(&payload)
            .map_err(|err| LandscapeError::Invalid(err.to_string()))?;
        let payload_hash = hash_bytes(DEFAULT_HASH_ALGORITHM, &bytes);
        let mut keyed = key.material().to_vec();
        keyed.push(0);
        keyed.extend_from_slice(&bytes);
        let signature = hash_bytes(DEFAULT_HASH_ALGORITHM, &keyed).value;
        if let Some(run) = state.runs.get_mut(&run_id) {
            run.export_status = ExportStatus::Exported;
        }
        Ok(SignedExport {
            run_id,
            payload,
            payload_hash,
            signature,
            key_id: key.key_id.clone(),
        })
    }
}
