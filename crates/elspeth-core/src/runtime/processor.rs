// crates/elspeth-core/src/runtime/processor.rs
// ============================================================================
// Module: Elspeth Row Processor
// Description: Per-row state machine over transforms, gates, and aggregations.
// Purpose: Drive tokens from admission to sink queues with full audit records.
// Dependencies: crate::core, crate::graph, crate::interfaces, crate::runtime::retry
// ============================================================================

//! ## Overview
//! The row processor drives a token through the pipeline's ordered steps
//! until it terminates at a sink queue or a non-terminal buffered state.
//! It is single-threaded per run. Work is drained from a bounded FIFO queue
//! guarded by [`MAX_WORK_QUEUE_ITERATIONS`] per admitted row; the guard
//! exists for pathological configurations, never legitimate pipelines.
//! Aggregation timeouts fire lazily: on the next row's admission (before it
//! is buffered) and at end-of-source flush. True idle never fires them.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::thread;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::hashing::DEFAULT_HASH_ALGORITHM;
use crate::core::hashing::HashDigest;
use crate::core::hashing::hash_canonical_json;
use crate::core::identifiers::BatchId;
use crate::core::identifiers::BranchName;
use crate::core::identifiers::ExpandGroupId;
use crate::core::identifiers::ForkGroupId;
use crate::core::identifiers::JoinGroupId;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::RowId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::SinkName;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;
use crate::core::outcome::BatchMemberRole;
use crate::core::outcome::BatchStatus;
use crate::core::outcome::NodeStateStatus;
use crate::core::outcome::OutcomeContext;
use crate::core::outcome::OutcomeKind;
use crate::core::outcome::TriggerReason;
use crate::core::row::PipelineRow;
use crate::core::time::Clock;
use crate::core::time::Timestamp;
use crate::graph::ErrorSinkTarget;
use crate::interfaces::GatePlugin;
use crate::interfaces::Landscape;
use crate::interfaces::LandscapeError;
use crate::interfaces::PluginContext;
use crate::interfaces::RoutingAction;
use crate::interfaces::TransformFailure;
use crate::interfaces::TransformPlugin;
use crate::interfaces::TransformResult;
use crate::runtime::retry::RetryDecision;
use crate::runtime::retry::RetryManager;
use crate::telemetry::Telemetry;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Work-queue iteration guard per admitted row.
///
/// Exceeding this bound fails the run with
/// [`ProcessorError::WorkQueueExceeded`]; it guards misconfigured loops and
/// is never approached by legitimate pipelines.
pub const MAX_WORK_QUEUE_ITERATIONS: usize = 10_000;

/// Aggregation-state serialization format version.
const AGGREGATION_STATE_VERSION: u32 = 1;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Row processor errors.
///
/// # Invariants
/// - Every variant is fatal to the run; per-row failures are handled through
///   error routing, not through this type.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The work queue exceeded its iteration guard.
    #[error("work queue exceeded {iterations} iterations for row {row_index}")]
    WorkQueueExceeded {
        /// Row index being processed when the guard tripped.
        row_index: u64,
        /// Iterations consumed.
        iterations: usize,
    },
    /// Landscape recorder failure.
    #[error(transparent)]
    Landscape(#[from] LandscapeError),
    /// A runtime invariant was violated.
    #[error("processor invariant violation: {0}")]
    Invariant(String),
    /// Aggregation state could not be serialized or restored.
    #[error("aggregation state error: {0}")]
    AggregationState(String),
}

// ============================================================================
// SECTION: Aggregation Policy
// ============================================================================

/// Aggregation flush triggers. End-of-source always flushes.
///
/// # Invariants
/// - At least one of `max_count` / `wall_clock_timeout_ms` may be unset;
///   end-of-source remains a guaranteed trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationTrigger {
    /// Flush when this many rows are buffered.
    pub max_count: Option<usize>,
    /// Flush lazily after this many milliseconds have passed since the
    /// buffer opened.
    pub wall_clock_timeout_ms: Option<i64>,
}

/// How an aggregation turns its buffer into output tokens.
///
/// # Invariants
/// - Variants are stable and exhaustive; comparisons use enum identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// One output row per batch; inputs become consumed-in-batch.
    Single,
    /// The batch transform emits new rows; each becomes a token linked by
    /// the batch.
    Transform,
    /// Inputs are released unchanged after transiting the aggregation.
    Passthrough,
}

/// Full aggregation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationPolicy {
    /// Flush triggers.
    pub trigger: AggregationTrigger,
    /// Output mode.
    pub output_mode: OutputMode,
}

// ============================================================================
// SECTION: Pipeline Steps
// ============================================================================

/// Aggregation step: a buffering policy plus an optional batch transform.
///
/// # Invariants
/// - `transform` is required unless `output_mode` is
///   [`OutputMode::Passthrough`].
pub struct AggregationStep {
    /// Batch-aware transform executed at flush.
    pub transform: Option<Box<dyn TransformPlugin>>,
    /// Buffering and output policy.
    pub policy: AggregationPolicy,
}

/// Coalesce step awaiting a declared set of branches.
#[derive(Debug, Clone)]
pub struct CoalesceStep {
    /// Branch names the coalesce waits for, in merge order.
    pub awaited: Vec<BranchName>,
}

/// Behavior of one pipeline step.
pub enum StepBody {
    /// Row transform.
    Transform(Box<dyn TransformPlugin>),
    /// Routing gate.
    Gate(Box<dyn GatePlugin>),
    /// Branch coalesce.
    Coalesce(CoalesceStep),
    /// Buffering aggregation.
    Aggregation(AggregationStep),
}

/// One ordered pipeline step bound to its graph node.
pub struct PipelineStep {
    /// Graph node the step executes as.
    pub node_id: NodeId,
    /// Step behavior.
    pub body: StepBody,
}

// ============================================================================
// SECTION: Tokens In Flight
// ============================================================================

/// In-process token context moving through the steps.
///
/// # Invariants
/// - Group identifiers are set only when the token was created by the
///   corresponding operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCtx {
    /// Recorder-assigned token identifier.
    pub token_id: TokenId,
    /// Row the token references.
    pub row_id: RowId,
    /// Admission index of the row.
    pub row_index: u64,
    /// Branch name when created by a fork.
    pub branch: Option<BranchName>,
    /// Fork group when created by a fork.
    pub fork_group: Option<ForkGroupId>,
    /// Expand group when created by a multi-row output.
    pub expand_group: Option<ExpandGroupId>,
}

impl TokenCtx {
    /// Creates the initial token context for an admitted row.
    #[must_use]
    pub const fn initial(token_id: TokenId, row_id: RowId, row_index: u64) -> Self {
        Self {
            token_id,
            row_id,
            row_index,
            branch: None,
            fork_group: None,
            expand_group: None,
        }
    }

    /// Builds the outcome context carrying this token's group links.
    fn outcome_context(&self) -> OutcomeContext {
        OutcomeContext {
            fork_group_id: self.fork_group,
            join_group_id: self.fork_group.and_then(|group| JoinGroupId::from_raw(group.get())),
            expand_group_id: self.expand_group,
            ..OutcomeContext::default()
        }
    }
}

/// Step discriminant used to dispatch without holding a step borrow.
#[derive(Debug, Clone, Copy)]
enum StepKind {
    /// Row transform.
    Transform,
    /// Routing gate.
    Gate,
    /// Branch coalesce.
    Coalesce,
    /// Buffering aggregation.
    Aggregation,
}

/// One queued unit of work.
struct WorkItem {
    /// Token being advanced.
    token: TokenCtx,
    /// Row payload at the current step.
    row: PipelineRow,
    /// Index of the next step to execute.
    step_index: usize,
}

// ============================================================================
// SECTION: Output
// ============================================================================

/// A token pending durable write at a named sink.
#[derive(Debug, Clone)]
pub struct PendingEmit {
    /// Destination sink.
    pub sink: SinkName,
    /// Token context.
    pub token: TokenCtx,
    /// Row payload to write.
    pub row: PipelineRow,
    /// Terminal outcome to record after the durable write.
    pub outcome: OutcomeKind,
    /// Outcome context to record with it.
    pub context: OutcomeContext,
}

/// Result of one processor invocation.
#[derive(Debug, Default)]
pub struct RowOutput {
    /// Tokens queued for sinks, in emission order.
    pub pending: Vec<PendingEmit>,
    /// Failures discarded without a sink (already terminally recorded).
    pub discarded: u32,
}

impl RowOutput {
    /// Merges another output into this one, preserving order.
    pub fn absorb(&mut self, other: Self) {
        self.pending.extend(other.pending);
        self.discarded += other.discarded;
    }
}

// ============================================================================
// SECTION: Run Environment
// ============================================================================

/// Run-scoped collaborators the processor records through.
pub struct ProcessEnv<'a> {
    /// Run being executed.
    pub run_id: RunId,
    /// Landscape recorder.
    pub landscape: &'a dyn Landscape,
    /// Telemetry sink.
    pub telemetry: &'a dyn Telemetry,
    /// Time source for audit records and lazy timeouts.
    pub clock: &'a dyn Clock,
}

impl ProcessEnv<'_> {
    /// Returns the current timestamp.
    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Builds a plugin context for a node-state execution.
    fn plugin_ctx(&self, state_id: StateId, token_id: TokenId) -> PluginContext<'_> {
        PluginContext {
            run_id: self.run_id,
            state_id: Some(state_id),
            token_id: Some(token_id),
            landscape: self.landscape,
            telemetry: self.telemetry,
        }
    }
}

// ============================================================================
// SECTION: Internal State
// ============================================================================

/// One buffered aggregation entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BufferedEntry {
    /// Buffered token.
    token: TokenCtx,
    /// Row as it arrived at the aggregation.
    row: PipelineRow,
}

/// Aggregation buffer owned by the processor.
#[derive(Debug, Default)]
struct AggregationBuffer {
    /// Open draft batch, once the first row buffered.
    batch_id: Option<BatchId>,
    /// Buffered entries in arrival order.
    entries: Vec<BufferedEntry>,
    /// When the buffer opened (first row buffered).
    opened_at: Option<Timestamp>,
}

/// Collector for one coalesce join group.
#[derive(Debug, Default)]
struct CoalesceAccumulator {
    /// Arrived branches with their tokens and rows.
    arrived: BTreeMap<BranchName, (TokenCtx, PipelineRow)>,
}

/// Serialized aggregation state document.
#[derive(Debug, Serialize, Deserialize)]
struct AggregationStateDoc {
    /// Serialization format version.
    version: u32,
    /// Buffers keyed by aggregation node identifier.
    buffers: BTreeMap<String, BufferDoc>,
}

/// Serialized buffer for one aggregation node.
#[derive(Debug, Serialize, Deserialize)]
struct BufferDoc {
    /// Open draft batch identifier.
    batch_id: Option<BatchId>,
    /// When the buffer opened.
    opened_at: Option<Timestamp>,
    /// Buffered entries in arrival order.
    entries: Vec<BufferedEntry>,
}

// ============================================================================
// SECTION: Row Processor
// ============================================================================

/// Per-run row state machine.
///
/// # Invariants
/// - Single-threaded: one invocation at a time per run.
/// - In-memory state (buffers, fork groups, collectors) is reconstructible
///   from the recorder plus the payload store on resume.
pub struct RowProcessor {
    /// Ordered pipeline steps.
    steps: Vec<PipelineStep>,
    /// Sink receiving tokens that complete the main path.
    default_sink: SinkName,
    /// Error destinations per transform/gate/aggregation node.
    error_routes: BTreeMap<NodeId, ErrorSinkTarget>,
    /// Retry manager for capacity-exhausted transforms.
    retry: RetryManager,
    /// Monotonic group-identifier counter (fork/join/expand), 1-based.
    group_seq: u64,
    /// Coalesce collectors keyed by `(step index, join group)`.
    coalescers: BTreeMap<(usize, JoinGroupId), CoalesceAccumulator>,
    /// Aggregation buffers keyed by step index.
    buffers: BTreeMap<usize, AggregationBuffer>,
}

impl RowProcessor {
    /// Creates a processor over ordered steps.
    #[must_use]
    pub fn new(
        steps: Vec<PipelineStep>,
        default_sink: SinkName,
        error_routes: BTreeMap<NodeId, ErrorSinkTarget>,
        retry: RetryManager,
    ) -> Self {
        Self {
            steps,
            default_sink,
            error_routes,
            retry,
            group_seq: 0,
            coalescers: BTreeMap::new(),
            buffers: BTreeMap::new(),
        }
    }

    /// Returns the ordered step node identifiers.
    #[must_use]
    pub fn step_node_ids(&self) -> Vec<NodeId> {
        self.steps.iter().map(|step| step.node_id.clone()).collect()
    }

    /// Binds each step plugin to its node identifier.
    pub fn bind_nodes(&mut self) {
        for step in &mut self.steps {
            match &mut step.body {
                StepBody::Transform(plugin) => plugin.bind_node(step.node_id.clone()),
                StepBody::Gate(plugin) => plugin.bind_node(step.node_id.clone()),
                StepBody::Aggregation(aggregation) => {
                    if let Some(plugin) = aggregation.transform.as_mut() {
                        plugin.bind_node(step.node_id.clone());
                    }
                }
                StepBody::Coalesce(_) => {}
            }
        }
    }

    /// Verifies every step plugin carries its node binding.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Invariant`] when a plugin is unbound; a
    /// missing assignment is an invariant violation, never a silent
    /// default.
    pub fn verify_bindings(&self) -> Result<(), ProcessorError> {
        for step in &self.steps {
            let bound = match &step.body {
                StepBody::Transform(plugin) => plugin.node_id().is_some(),
                StepBody::Gate(plugin) => plugin.node_id().is_some(),
                StepBody::Aggregation(aggregation) => {
                    aggregation.transform.as_ref().is_none_or(|plugin| plugin.node_id().is_some())
                }
                StepBody::Coalesce(_) => true,
            };
            if !bound {
                return Err(ProcessorError::Invariant(format!(
                    "plugin for node '{}' has no node binding",
                    step.node_id
                )));
            }
        }
        Ok(())
    }

    /// Releases step plugin resources deterministically.
    pub fn close(&mut self) {
        for step in &mut self.steps {
            match &mut step.body {
                StepBody::Transform(plugin) => plugin.close(),
                StepBody::Aggregation(aggregation) => {
                    if let Some(plugin) = aggregation.transform.as_mut() {
                        plugin.close();
                    }
                }
                StepBody::Gate(_) | StepBody::Coalesce(_) => {}
            }
        }
    }

    /// Processes one admitted row from the first step.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError`] on fatal failures; per-row errors are
    /// routed, not raised.
    pub fn process_row(
        &mut self,
        env: &ProcessEnv<'_>,
        token: TokenCtx,
        row: PipelineRow,
    ) -> Result<RowOutput, ProcessorError> {
        let row_index = token.row_index;
        let seed = WorkItem {
            token,
            row,
            step_index: 0,
        };
        self.drain(env, vec![seed], row_index)
    }

    /// Fires lazy aggregation timeouts. Called before each row's admission.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError`] on fatal failures.
    pub fn check_timeouts(&mut self, env: &ProcessEnv<'_>) -> Result<RowOutput, ProcessorError> {
        let now = env.now();
        let mut due = Vec::new();
        for (index, step) in self.steps.iter().enumerate() {
            if let StepBody::Aggregation(aggregation) = &step.body
                && let Some(timeout) = aggregation.policy.trigger.wall_clock_timeout_ms
                && let Some(buffer) = self.buffers.get(&index)
                && let Some(opened_at) = buffer.opened_at
                && !buffer.entries.is_empty()
                && now.millis_since(opened_at) >= timeout
            {
                due.push(index);
            }
        }
        let mut output = RowOutput::default();
        for index in due {
            let flushed = self.flush_step(env, index, TriggerReason::WallClockTimeout)?;
            output.absorb(flushed);
        }
        Ok(output)
    }

    /// Flushes every aggregation buffer at end of source.
    ///
    /// Always runs, even when zero valid rows were admitted.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError`] on fatal failures.
    pub fn flush_all(&mut self, env: &ProcessEnv<'_>) -> Result<RowOutput, ProcessorError> {
        let mut output = RowOutput::default();
        let indices: Vec<usize> = self
            .steps
            .iter()
            .enumerate()
            .filter(|(_, step)| matches!(step.body, StepBody::Aggregation(_)))
            .map(|(index, _)| index)
            .collect();
        for index in indices {
            let flushed = self.flush_step(env, index, TriggerReason::EndOfSource)?;
            output.absorb(flushed);
        }
        Ok(output)
    }

    /// Serializes the aggregation buffers for checkpointing.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::AggregationState`] when serialization
    /// fails.
    pub fn aggregation_state(&self) -> Result<Option<Value>, ProcessorError> {
        if self.buffers.values().all(|buffer| buffer.entries.is_empty()) {
            return Ok(None);
        }
        let mut buffers = BTreeMap::new();
        for (index, buffer) in &self.buffers {
            if buffer.entries.is_empty() {
                continue;
            }
            let Some(step) = self.steps.get(*index) else {
                continue;
            };
            buffers.insert(
                step.node_id.as_str().to_string(),
                BufferDoc {
                    batch_id: buffer.batch_id,
                    opened_at: buffer.opened_at,
                    entries: buffer.entries.clone(),
                },
            );
        }
        let doc = AggregationStateDoc {
            version: AGGREGATION_STATE_VERSION,
            buffers,
        };
        serde_json::to_value(&doc)
            .map(Some)
            .map_err(|err| ProcessorError::AggregationState(err.to_string()))
    }

    /// Restores aggregation buffers from a checkpointed state document,
    /// returning the row identifiers now held in buffers.
    ///
    /// The restored buffers are structurally identical to the pre-crash
    /// buffers, modulo wall-clock fields.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::AggregationState`] when the document is
    /// malformed or names an unknown aggregation node.
    pub fn restore_aggregation_state(
        &mut self,
        state: &Value,
    ) -> Result<Vec<RowId>, ProcessorError> {
        let doc: AggregationStateDoc = serde_json::from_value(state.clone())
            .map_err(|err| ProcessorError::AggregationState(err.to_string()))?;
        if doc.version != AGGREGATION_STATE_VERSION {
            return Err(ProcessorError::AggregationState(format!(
                "unsupported aggregation state version: {}",
                doc.version
            )));
        }
        let mut restored_rows = Vec::new();
        for (node_id, buffer_doc) in doc.buffers {
            let index = self
                .steps
                .iter()
                .position(|step| {
                    step.node_id.as_str() == node_id
                        && matches!(step.body, StepBody::Aggregation(_))
                })
                .ok_or_else(|| {
                    ProcessorError::AggregationState(format!(
                        "unknown aggregation node in state: {node_id}"
                    ))
                })?;
            restored_rows.extend(buffer_doc.entries.iter().map(|entry| entry.token.row_id));
            self.buffers.insert(index, AggregationBuffer {
                batch_id: buffer_doc.batch_id,
                entries: buffer_doc.entries,
                opened_at: buffer_doc.opened_at,
            });
        }
        Ok(restored_rows)
    }

    /// Returns the draft batches currently held in buffers.
    #[must_use]
    pub fn buffered_batch_ids(&self) -> Vec<BatchId> {
        self.buffers.values().filter_map(|buffer| buffer.batch_id).collect()
    }

    /// Allocates the next group identifier.
    fn next_group(&mut self) -> u64 {
        self.group_seq += 1;
        self.group_seq
    }

    /// Drains seeded work until the queue is empty or the guard trips.
    fn drain(
        &mut self,
        env: &ProcessEnv<'_>,
        seeds: Vec<WorkItem>,
        row_index: u64,
    ) -> Result<RowOutput, ProcessorError> {
        let mut queue: VecDeque<WorkItem> = seeds.into();
        let mut output = RowOutput::default();
        let mut iterations = 0_usize;
        while let Some(item) = queue.pop_front() {
            iterations += 1;
            if iterations > MAX_WORK_QUEUE_ITERATIONS {
                return Err(ProcessorError::WorkQueueExceeded {
                    row_index,
                    iterations,
                });
            }
            self.advance(env, item, &mut queue, &mut output)?;
        }
        Ok(output)
    }

    /// Advances one work item by a single step.
    fn advance(
        &mut self,
        env: &ProcessEnv<'_>,
        item: WorkItem,
        queue: &mut VecDeque<WorkItem>,
        output: &mut RowOutput,
    ) -> Result<(), ProcessorError> {
        let WorkItem {
            token,
            row,
            step_index,
        } = item;
        if step_index >= self.steps.len() {
            let context = OutcomeContext {
                sink_name: Some(self.default_sink.clone()),
                ..token.outcome_context()
            };
            output.pending.push(PendingEmit {
                sink: self.default_sink.clone(),
                token,
                row,
                outcome: OutcomeKind::Completed,
                context,
            });
            return Ok(());
        }
        let kind = match &self.steps[step_index].body {
            StepBody::Transform(_) => StepKind::Transform,
            StepBody::Gate(_) => StepKind::Gate,
            StepBody::Coalesce(_) => StepKind::Coalesce,
            StepBody::Aggregation(_) => StepKind::Aggregation,
        };
        match kind {
            StepKind::Transform => self.advance_transform(env, token, row, step_index, queue, output),
            StepKind::Gate => self.advance_gate(env, token, row, step_index, queue, output),
            StepKind::Coalesce => self.advance_coalesce(env, token, row, step_index, queue),
            StepKind::Aggregation => {
                self.advance_aggregation(env, token, row, step_index, queue, output)
            }
        }
    }

    /// Runs a transform step for one token.
    fn advance_transform(
        &mut self,
        env: &ProcessEnv<'_>,
        token: TokenCtx,
        row: PipelineRow,
        step_index: usize,
        queue: &mut VecDeque<WorkItem>,
        output: &mut RowOutput,
    ) -> Result<(), ProcessorError> {
        let node_id = self.steps[step_index].node_id.clone();
        let state_id =
            env.landscape.record_node_state(env.run_id, token.token_id, &node_id, env.now())?;
        let result = {
            let Self {
                steps,
                retry,
                ..
            } = self;
            let StepBody::Transform(plugin) = &mut steps[step_index].body else {
                return Err(ProcessorError::Invariant(format!(
                    "step '{node_id}' is not a transform"
                )));
            };
            run_with_retry(
                env,
                retry,
                state_id,
                &token,
                |ctx, attempt_row| plugin.process(attempt_row, ctx),
                &row,
            )
        };
        match result {
            TransformResult::Success(next_row) => {
                env.landscape.complete_node_state(
                    state_id,
                    NodeStateStatus::Completed,
                    env.now(),
                    None,
                )?;
                queue.push_back(WorkItem {
                    token,
                    row: next_row,
                    step_index: step_index + 1,
                });
                Ok(())
            }
            TransformResult::SuccessMulti(rows) => {
                env.landscape.complete_node_state(
                    state_id,
                    NodeStateStatus::Completed,
                    env.now(),
                    None,
                )?;
                self.expand_token(env, &token, rows, step_index, queue)?;
                Ok(())
            }
            TransformResult::Error(failure) => {
                self.fail_token(env, &node_id, state_id, token, row, &failure, output)
            }
            TransformResult::CapacityExhausted(notice) => {
                // run_with_retry surfaces exhaustion only after giving up.
                let failure = TransformFailure {
                    reason: notice.reason,
                    details: None,
                };
                self.fail_token(env, &node_id, state_id, token, row, &failure, output)
            }
        }
    }

    /// Emits child tokens for a multi-row transform output.
    fn expand_token(
        &mut self,
        env: &ProcessEnv<'_>,
        parent: &TokenCtx,
        rows: Vec<PipelineRow>,
        step_index: usize,
        queue: &mut VecDeque<WorkItem>,
    ) -> Result<(), ProcessorError> {
        let expand_group = ExpandGroupId::from_raw(self.next_group()).ok_or_else(|| {
            ProcessorError::Invariant("group sequence overflowed".to_string())
        })?;
        for row in rows {
            let child_id = env.landscape.create_token(
                parent.row_id,
                Some(parent.token_id),
                None,
                env.now(),
            )?;
            let child = TokenCtx {
                token_id: child_id,
                row_id: parent.row_id,
                row_index: parent.row_index,
                branch: parent.branch.clone(),
                fork_group: parent.fork_group,
                expand_group: Some(expand_group),
            };
            queue.push_back(WorkItem {
                token: child,
                row,
                step_index: step_index + 1,
            });
        }
        let context = OutcomeContext {
            expand_group_id: Some(expand_group),
            ..parent.outcome_context()
        };
        env.landscape.record_token_outcome(
            env.run_id,
            parent.token_id,
            OutcomeKind::Expanded,
            &context,
            env.now(),
        )?;
        Ok(())
    }

    /// Routes a failed token to its error destination.
    fn fail_token(
        &mut self,
        env: &ProcessEnv<'_>,
        node_id: &NodeId,
        state_id: StateId,
        token: TokenCtx,
        row: PipelineRow,
        failure: &TransformFailure,
        output: &mut RowOutput,
    ) -> Result<(), ProcessorError> {
        let error_hash = failure_hash(failure);
        env.landscape.complete_node_state(
            state_id,
            NodeStateStatus::Failed,
            env.now(),
            error_hash.as_ref(),
        )?;
        let target = self
            .error_routes
            .get(node_id)
            .cloned()
            .unwrap_or(ErrorSinkTarget::Discard);
        let context = OutcomeContext {
            error_hash,
            context_json: Some(Value::String(failure.reason.clone())),
            ..token.outcome_context()
        };
        match target {
            ErrorSinkTarget::Sink(sink) => {
                let context = OutcomeContext {
                    sink_name: Some(sink.clone()),
                    ..context
                };
                output.pending.push(PendingEmit {
                    sink,
                    token,
                    row,
                    outcome: OutcomeKind::Failed,
                    context,
                });
            }
            ErrorSinkTarget::Discard => {
                env.landscape.record_token_outcome(
                    env.run_id,
                    token.token_id,
                    OutcomeKind::Failed,
                    &context,
                    env.now(),
                )?;
                output.discarded += 1;
            }
        }
        Ok(())
    }

    /// Runs a gate step for one token.
    fn advance_gate(
        &mut self,
        env: &ProcessEnv<'_>,
        token: TokenCtx,
        row: PipelineRow,
        step_index: usize,
        queue: &mut VecDeque<WorkItem>,
        output: &mut RowOutput,
    ) -> Result<(), ProcessorError> {
        let node_id = self.steps[step_index].node_id.clone();
        let state_id =
            env.landscape.record_node_state(env.run_id, token.token_id, &node_id, env.now())?;
        let evaluation = {
            let StepBody::Gate(plugin) = &mut self.steps[step_index].body else {
                return Err(ProcessorError::Invariant(format!("step '{node_id}' is not a gate")));
            };
            let ctx = env.plugin_ctx(state_id, token.token_id);
            plugin.evaluate(&row, &ctx)
        };
        match evaluation {
            Ok(RoutingAction::Continue) => {
                env.landscape.complete_node_state(
                    state_id,
                    NodeStateStatus::Completed,
                    env.now(),
                    None,
                )?;
                queue.push_back(WorkItem {
                    token,
                    row,
                    step_index: step_index + 1,
                });
                Ok(())
            }
            Ok(RoutingAction::Route(sink)) => {
                env.landscape.complete_node_state(
                    state_id,
                    NodeStateStatus::Routed,
                    env.now(),
                    None,
                )?;
                let context = OutcomeContext {
                    sink_name: Some(sink.clone()),
                    ..token.outcome_context()
                };
                output.pending.push(PendingEmit {
                    sink,
                    token,
                    row,
                    outcome: OutcomeKind::Routed,
                    context,
                });
                Ok(())
            }
            Ok(RoutingAction::ForkToPaths(paths)) => {
                env.landscape.complete_node_state(
                    state_id,
                    NodeStateStatus::Routed,
                    env.now(),
                    None,
                )?;
                self.fork_token(env, token, &row, paths, step_index, queue, output)
            }
            Err(err) => {
                let failure = TransformFailure {
                    reason: err.to_string(),
                    details: None,
                };
                self.fail_token(env, &node_id, state_id, token, row, &failure, output)
            }
        }
    }

    /// Emits child tokens for a fork decision.
    fn fork_token(
        &mut self,
        env: &ProcessEnv<'_>,
        parent: TokenCtx,
        row: &PipelineRow,
        paths: Vec<crate::interfaces::ForkPath>,
        step_index: usize,
        queue: &mut VecDeque<WorkItem>,
        output: &mut RowOutput,
    ) -> Result<(), ProcessorError> {
        let fork_group = ForkGroupId::from_raw(self.next_group()).ok_or_else(|| {
            ProcessorError::Invariant("group sequence overflowed".to_string())
        })?;
        let path_count = paths.len();
        for path in paths {
            let child_id = env.landscape.create_token(
                parent.row_id,
                Some(parent.token_id),
                Some(&path.branch),
                env.now(),
            )?;
            let child = TokenCtx {
                token_id: child_id,
                row_id: parent.row_id,
                row_index: parent.row_index,
                branch: Some(path.branch.clone()),
                fork_group: Some(fork_group),
                expand_group: None,
            };
            match path.destination {
                crate::interfaces::ForkDestination::Continue => {
                    queue.push_back(WorkItem {
                        token: child,
                        row: row.clone(),
                        step_index: step_index + 1,
                    });
                }
                crate::interfaces::ForkDestination::Sink(sink) => {
                    let context = OutcomeContext {
                        sink_name: Some(sink.clone()),
                        ..child.outcome_context()
                    };
                    output.pending.push(PendingEmit {
                        sink,
                        token: child,
                        row: row.clone(),
                        outcome: OutcomeKind::Routed,
                        context,
                    });
                }
            }
        }
        let context = OutcomeContext {
            fork_group_id: Some(fork_group),
            context_json: Some(serde_json::json!({ "paths": path_count })),
            ..OutcomeContext::default()
        };
        env.landscape.record_token_outcome(
            env.run_id,
            parent.token_id,
            OutcomeKind::Forked,
            &context,
            env.now(),
        )?;
        Ok(())
    }

    /// Runs a coalesce step for one token.
    fn advance_coalesce(
        &mut self,
        env: &ProcessEnv<'_>,
        token: TokenCtx,
        row: PipelineRow,
        step_index: usize,
        queue: &mut VecDeque<WorkItem>,
    ) -> Result<(), ProcessorError> {
        let node_id = self.steps[step_index].node_id.clone();
        let state_id =
            env.landscape.record_node_state(env.run_id, token.token_id, &node_id, env.now())?;
        env.landscape.complete_node_state(
            state_id,
            NodeStateStatus::Completed,
            env.now(),
            None,
        )?;
        let (Some(branch), Some(fork_group)) = (token.branch.clone(), token.fork_group) else {
            // Unbranched tokens pass through a coalesce unchanged.
            queue.push_back(WorkItem {
                token,
                row,
                step_index: step_index + 1,
            });
            return Ok(());
        };
        let join_group = JoinGroupId::from_raw(fork_group.get()).ok_or_else(|| {
            ProcessorError::Invariant("fork group produced zero join group".to_string())
        })?;
        let awaited: Vec<BranchName> = {
            let StepBody::Coalesce(step) = &self.steps[step_index].body else {
                return Err(ProcessorError::Invariant(format!(
                    "step '{node_id}' is not a coalesce"
                )));
            };
            step.awaited.clone()
        };
        let accumulator = self.coalescers.entry((step_index, join_group)).or_default();
        accumulator.arrived.insert(branch, (token, row));
        let complete = awaited.iter().all(|name| accumulator.arrived.contains_key(name));
        if !complete {
            return Ok(());
        }
        let Some(accumulator) = self.coalescers.remove(&(step_index, join_group)) else {
            return Err(ProcessorError::Invariant("coalesce accumulator vanished".to_string()));
        };
        let mut arrived = accumulator.arrived;
        let mut merged_row: Option<PipelineRow> = None;
        let mut first_token: Option<TokenCtx> = None;
        for name in &awaited {
            let Some((branch_token, branch_row)) = arrived.remove(name) else {
                continue;
            };
            match merged_row.as_mut() {
                None => {
                    merged_row = Some(branch_row);
                    first_token = Some(branch_token.clone());
                }
                Some(merged) => merged.merge_missing(&branch_row),
            }
            let context = OutcomeContext {
                join_group_id: Some(join_group),
                fork_group_id: Some(fork_group),
                ..OutcomeContext::default()
            };
            env.landscape.record_token_outcome(
                env.run_id,
                branch_token.token_id,
                OutcomeKind::Coalesced,
                &context,
                env.now(),
            )?;
        }
        let (Some(merged_row), Some(first_token)) = (merged_row, first_token) else {
            return Err(ProcessorError::Invariant("coalesce merged zero branches".to_string()));
        };
        let merged_id = env.landscape.create_token(
            first_token.row_id,
            Some(first_token.token_id),
            None,
            env.now(),
        )?;
        let merged = TokenCtx {
            token_id: merged_id,
            row_id: first_token.row_id,
            row_index: first_token.row_index,
            branch: None,
            fork_group: None,
            expand_group: None,
        };
        queue.push_back(WorkItem {
            token: merged,
            row: merged_row,
            step_index: step_index + 1,
        });
        Ok(())
    }

    /// Buffers one token at an aggregation step.
    fn advance_aggregation(
        &mut self,
        env: &ProcessEnv<'_>,
        token: TokenCtx,
        row: PipelineRow,
        step_index: usize,
        queue: &mut VecDeque<WorkItem>,
        output: &mut RowOutput,
    ) -> Result<(), ProcessorError> {
        let node_id = self.steps[step_index].node_id.clone();
        let max_count = {
            let StepBody::Aggregation(step) = &self.steps[step_index].body else {
                return Err(ProcessorError::Invariant(format!(
                    "step '{node_id}' is not an aggregation"
                )));
            };
            step.policy.trigger.max_count
        };
        let buffer = self.buffers.entry(step_index).or_default();
        let batch_id = match buffer.batch_id {
            Some(batch_id) => batch_id,
            None => {
                let batch_id = env.landscape.create_batch(env.run_id, &node_id, env.now())?;
                buffer.batch_id = Some(batch_id);
                buffer.opened_at = Some(env.now());
                batch_id
            }
        };
        env.landscape.add_batch_member(batch_id, token.token_id, BatchMemberRole::Input)?;
        let context = OutcomeContext {
            batch_id: Some(batch_id),
            ..token.outcome_context()
        };
        env.landscape.record_token_outcome(
            env.run_id,
            token.token_id,
            OutcomeKind::Buffered,
            &context,
            env.now(),
        )?;
        buffer.entries.push(BufferedEntry {
            token,
            row,
        });
        let full = max_count.is_some_and(|count| buffer.entries.len() >= count);
        if full {
            let flushed = self.flush_into(env, step_index, TriggerReason::Count, queue)?;
            output.absorb(flushed);
        }
        Ok(())
    }

    /// Flushes one aggregation step, draining produced work to completion.
    fn flush_step(
        &mut self,
        env: &ProcessEnv<'_>,
        step_index: usize,
        reason: TriggerReason,
    ) -> Result<RowOutput, ProcessorError> {
        let mut queue = VecDeque::new();
        let mut output = self.flush_into(env, step_index, reason, &mut queue)?;
        let row_index = queue.front().map_or(0, |item| item.token.row_index);
        let drained = self.drain(env, queue.into_iter().collect(), row_index)?;
        output.absorb(drained);
        Ok(output)
    }

    /// Flushes one aggregation buffer, pushing produced work onto `queue`.
    fn flush_into(
        &mut self,
        env: &ProcessEnv<'_>,
        step_index: usize,
        reason: TriggerReason,
        queue: &mut VecDeque<WorkItem>,
    ) -> Result<RowOutput, ProcessorError> {
        let Some(buffer) = self.buffers.get_mut(&step_index) else {
            return Ok(RowOutput::default());
        };
        if buffer.entries.is_empty() {
            return Ok(RowOutput::default());
        }
        let entries = std::mem::take(&mut buffer.entries);
        let batch_id = buffer.batch_id.take().ok_or_else(|| {
            ProcessorError::Invariant("aggregation buffer has entries but no batch".to_string())
        })?;
        buffer.opened_at = None;
        let node_id = self.steps[step_index].node_id.clone();
        let output_mode = {
            let StepBody::Aggregation(step) = &self.steps[step_index].body else {
                return Err(ProcessorError::Invariant(format!(
                    "step '{node_id}' is not an aggregation"
                )));
            };
            step.policy.output_mode
        };
        if output_mode == OutputMode::Passthrough {
            env.landscape.update_batch_status(
                batch_id,
                BatchStatus::Completed,
                Some(reason),
                Some(env.now()),
                None,
            )?;
            for entry in entries {
                queue.push_back(WorkItem {
                    token: entry.token,
                    row: entry.row,
                    step_index: step_index + 1,
                });
            }
            return Ok(RowOutput::default());
        }
        let first = entries.first().ok_or_else(|| {
            ProcessorError::Invariant("aggregation flush with empty entries".to_string())
        })?;
        let carrier = first.token.clone();
        let state_id =
            env.landscape.record_node_state(env.run_id, carrier.token_id, &node_id, env.now())?;
        env.landscape.update_batch_status(
            batch_id,
            BatchStatus::Executing,
            Some(reason),
            None,
            Some(state_id),
        )?;
        let batch_rows: Vec<PipelineRow> = entries.iter().map(|entry| entry.row.clone()).collect();
        let result = {
            let Self {
                steps,
                retry,
                ..
            } = self;
            let StepBody::Aggregation(step) = &mut steps[step_index].body else {
                return Err(ProcessorError::Invariant(format!(
                    "step '{node_id}' is not an aggregation"
                )));
            };
            let Some(plugin) = step.transform.as_mut() else {
                return Err(ProcessorError::Invariant(format!(
                    "aggregation '{node_id}' has no transform for its output mode"
                )));
            };
            run_batch_with_retry(env, retry, state_id, &carrier, batch_id, plugin, batch_rows)?
        };
        match result {
            TransformResult::Success(row) => {
                env.landscape.complete_node_state(
                    state_id,
                    NodeStateStatus::Completed,
                    env.now(),
                    None,
                )?;
                self.finish_batch(env, batch_id, &entries, vec![row], step_index, queue)?;
                Ok(RowOutput::default())
            }
            TransformResult::SuccessMulti(rows) => {
                if output_mode == OutputMode::Single && rows.len() > 1 {
                    let failure = TransformFailure {
                        reason: "single-output aggregation produced multiple rows".to_string(),
                        details: None,
                    };
                    return self.fail_batch(env, batch_id, &node_id, state_id, entries, &failure);
                }
                env.landscape.complete_node_state(
                    state_id,
                    NodeStateStatus::Completed,
                    env.now(),
                    None,
                )?;
                self.finish_batch(env, batch_id, &entries, rows, step_index, queue)?;
                Ok(RowOutput::default())
            }
            TransformResult::Error(failure) => {
                self.fail_batch(env, batch_id, &node_id, state_id, entries, &failure)
            }
            TransformResult::CapacityExhausted(notice) => {
                let failure = TransformFailure {
                    reason: notice.reason,
                    details: None,
                };
                self.fail_batch(env, batch_id, &node_id, state_id, entries, &failure)
            }
        }
    }

    /// Completes a successful batch: output tokens continue, inputs are
    /// consumed.
    fn finish_batch(
        &mut self,
        env: &ProcessEnv<'_>,
        batch_id: BatchId,
        entries: &[BufferedEntry],
        rows: Vec<PipelineRow>,
        step_index: usize,
        queue: &mut VecDeque<WorkItem>,
    ) -> Result<(), ProcessorError> {
        let carrier = entries.first().ok_or_else(|| {
            ProcessorError::Invariant("batch completion with no entries".to_string())
        })?;
        for row in rows {
            let out_token_id = env.landscape.create_token(
                carrier.token.row_id,
                Some(carrier.token.token_id),
                None,
                env.now(),
            )?;
            env.landscape.add_batch_member(batch_id, out_token_id, BatchMemberRole::Output)?;
            let out_token = TokenCtx {
                token_id: out_token_id,
                row_id: carrier.token.row_id,
                row_index: carrier.token.row_index,
                branch: None,
                fork_group: None,
                expand_group: None,
            };
            queue.push_back(WorkItem {
                token: out_token,
                row,
                step_index: step_index + 1,
            });
        }
        for entry in entries {
            let context = OutcomeContext {
                batch_id: Some(batch_id),
                ..entry.token.outcome_context()
            };
            env.landscape.record_token_outcome(
                env.run_id,
                entry.token.token_id,
                OutcomeKind::ConsumedInBatch,
                &context,
                env.now(),
            )?;
        }
        env.landscape.update_batch_status(
            batch_id,
            BatchStatus::Completed,
            None,
            Some(env.now()),
            None,
        )?;
        Ok(())
    }

    /// Fails a batch: inputs are routed to the aggregation's error
    /// destination.
    fn fail_batch(
        &mut self,
        env: &ProcessEnv<'_>,
        batch_id: BatchId,
        node_id: &NodeId,
        state_id: StateId,
        entries: Vec<BufferedEntry>,
        failure: &TransformFailure,
    ) -> Result<RowOutput, ProcessorError> {
        let mut output = RowOutput::default();
        let error_hash = failure_hash(failure);
        env.landscape.complete_node_state(
            state_id,
            NodeStateStatus::Failed,
            env.now(),
            error_hash.as_ref(),
        )?;
        env.landscape.update_batch_status(
            batch_id,
            BatchStatus::Failed,
            None,
            Some(env.now()),
            Some(state_id),
        )?;
        let target = self
            .error_routes
            .get(node_id)
            .cloned()
            .unwrap_or(ErrorSinkTarget::Discard);
        for entry in entries {
            let context = OutcomeContext {
                batch_id: Some(batch_id),
                error_hash: error_hash.clone(),
                context_json: Some(Value::String(failure.reason.clone())),
                ..entry.token.outcome_context()
            };
            match &target {
                ErrorSinkTarget::Sink(sink) => {
                    let context = OutcomeContext {
                        sink_name: Some(sink.clone()),
                        ..context
                    };
                    output.pending.push(PendingEmit {
                        sink: sink.clone(),
                        token: entry.token,
                        row: entry.row,
                        outcome: OutcomeKind::Failed,
                        context,
                    });
                }
                ErrorSinkTarget::Discard => {
                    env.landscape.record_token_outcome(
                        env.run_id,
                        entry.token.token_id,
                        OutcomeKind::Failed,
                        &context,
                        env.now(),
                    )?;
                    output.discarded += 1;
                }
            }
        }
        Ok(output)
    }
}

// ============================================================================
// SECTION: Retry Helpers
// ============================================================================

/// Computes the canonical error hash for a transform failure.
fn failure_hash(failure: &TransformFailure) -> Option<HashDigest> {
    hash_canonical_json(DEFAULT_HASH_ALGORITHM, failure).ok()
}

/// Runs a per-row transform with bounded retry on capacity exhaustion.
fn run_with_retry<F>(
    env: &ProcessEnv<'_>,
    retry: &RetryManager,
    state_id: StateId,
    token: &TokenCtx,
    mut call: F,
    row: &PipelineRow,
) -> TransformResult
where
    F: FnMut(&PluginContext<'_>, PipelineRow) -> TransformResult,
{
    let ctx = env.plugin_ctx(state_id, token.token_id);
    let mut attempt = 1_u32;
    loop {
        match call(&ctx, row.clone()) {
            TransformResult::CapacityExhausted(notice) => {
                match retry.decide(attempt, &notice) {
                    RetryDecision::RetryAfter(delay) => {
                        thread::sleep(delay);
                        attempt += 1;
                    }
                    RetryDecision::GiveUp => {
                        return TransformResult::CapacityExhausted(notice);
                    }
                }
            }
            other => return other,
        }
    }
}

/// Runs a batch transform with bounded retry, bumping the batch attempt on
/// each retry.
fn run_batch_with_retry(
    env: &ProcessEnv<'_>,
    retry: &RetryManager,
    state_id: StateId,
    carrier: &TokenCtx,
    batch_id: BatchId,
    plugin: &mut Box<dyn TransformPlugin>,
    rows: Vec<PipelineRow>,
) -> Result<TransformResult, ProcessorError> {
    let ctx = env.plugin_ctx(state_id, carrier.token_id);
    let mut attempt = 1_u32;
    loop {
        let result = if plugin.is_batch_aware() {
            plugin.process_batch(rows.clone(), &ctx)
        } else if let [row] = rows.as_slice() {
            plugin.process(row.clone(), &ctx)
        } else {
            TransformResult::Error(TransformFailure {
                reason: "batch of multiple rows requires a batch-aware transform".to_string(),
                details: None,
            })
        };
        match result {
            TransformResult::CapacityExhausted(notice) => match retry.decide(attempt, &notice) {
                RetryDecision::RetryAfter(delay) => {
                    env.landscape.retry_batch(batch_id)?;
                    thread::sleep(delay);
                    attempt += 1;
                }
                RetryDecision::GiveUp => {
                    return Ok(TransformResult::CapacityExhausted(notice));
                }
            },
            other => return Ok(other),
        }
    }
}
