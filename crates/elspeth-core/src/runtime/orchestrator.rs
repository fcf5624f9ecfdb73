// crates/elspeth-core/src/runtime/orchestrator.rs
// ============================================================================
// Module: Elspeth Orchestrator
// Description: Run lifecycle: registration, row pump, sink writes, resume.
// Purpose: Convert a configured pipeline into an audited, resumable run.
// Dependencies: crate::core, crate::graph, crate::interfaces, crate::runtime
// ============================================================================

//! ## Overview
//! The orchestrator owns the run lifecycle. It registers the graph into the
//! landscape, pumps rows from the source through the processor, accumulates
//! per-sink token queues, and records terminal outcomes and persists
//! checkpoints only after a successful sink write. Checkpoints are
//! never created in the main processing loop; a crash before sink write
//! re-processes the row instead of skipping it. Resume refuses any
//! topology or checkpoint-node configuration change.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

use crate::core::hashing::DEFAULT_HASH_ALGORITHM;
use crate::core::hashing::HashDigest;
use crate::core::hashing::HashError;
use crate::core::hashing::canonical_json_bytes;
use crate::core::hashing::hash_bytes;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::RouteLabel;
use crate::core::identifiers::RowId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::SinkName;
use crate::core::identifiers::TokenId;
use crate::core::outcome::BatchStatus;
use crate::core::outcome::CHECKPOINT_FORMAT_VERSION;
use crate::core::outcome::CheckpointRequest;
use crate::core::outcome::NodeRegistration;
use crate::core::outcome::NodeStateStatus;
use crate::core::outcome::OutcomeContext;
use crate::core::outcome::OutcomeKind;
use crate::core::outcome::RunConfig;
use crate::core::outcome::RunStatus;
use crate::core::row::ContractError;
use crate::core::row::QuarantinedRow;
use crate::core::time::Clock;
use crate::graph::ErrorSinkTarget;
use crate::graph::ExecutionGraph;
use crate::graph::ExecutionGraphBuilder;
use crate::graph::GraphError;
use crate::graph::ROUTE_CONTINUE;
use crate::graph::RouteDestination;
use crate::graph::RoutePlan;
use crate::graph::RouteValidationError;
use crate::graph::validate_route_plan;
use crate::interfaces::ArtifactDescriptor;
use crate::interfaces::Landscape;
use crate::interfaces::LandscapeError;
use crate::interfaces::NewRow;
use crate::interfaces::PayloadError;
use crate::interfaces::PayloadHash;
use crate::interfaces::PayloadStore;
use crate::interfaces::PluginContext;
use crate::interfaces::SinkError;
use crate::interfaces::SinkMode;
use crate::interfaces::SinkPayload;
use crate::interfaces::SinkPlugin;
use crate::interfaces::SinkToken;
use crate::interfaces::SinkWriteContext;
use crate::interfaces::SourceError;
use crate::interfaces::SourcePlugin;
use crate::interfaces::SourceRow;
use crate::runtime::processor::PendingEmit;
use crate::runtime::processor::PipelineStep;
use crate::runtime::processor::ProcessEnv;
use crate::runtime::processor::ProcessorError;
use crate::runtime::processor::RowOutput;
use crate::runtime::processor::RowProcessor;
use crate::runtime::processor::TokenCtx;
use crate::runtime::retry::RetryManager;
use crate::runtime::retry::RetryPolicy;
use crate::telemetry::Telemetry;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Orchestrator errors.
///
/// # Invariants
/// - `CheckpointIncompatible` is a hard refusal: one run, one configuration.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Processor failure.
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    /// Landscape recorder failure.
    #[error(transparent)]
    Landscape(#[from] LandscapeError),
    /// Graph construction failure.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// Route validation failure.
    #[error(transparent)]
    RouteValidation(#[from] RouteValidationError),
    /// Payload store failure.
    #[error(transparent)]
    Payload(#[from] PayloadError),
    /// Source failure outside cancellation.
    #[error(transparent)]
    Source(#[from] SourceError),
    /// Canonical hashing failure.
    #[error(transparent)]
    Hash(#[from] HashError),
    /// A sink could not be prepared.
    #[error("sink '{sink}' preparation failed: {error}")]
    SinkPrepare {
        /// Sink that refused preparation.
        sink: String,
        /// Underlying sink error.
        error: SinkError,
    },
    /// The stored checkpoint is incompatible with the current pipeline.
    #[error("checkpoint incompatible: {0}")]
    CheckpointIncompatible(String),
    /// A runtime invariant was violated.
    #[error("orchestrator invariant violation: {0}")]
    Invariant(String),
}

// ============================================================================
// SECTION: Pipeline Assembly
// ============================================================================

/// A sink plugin bound to its graph node.
pub struct SinkBinding {
    /// Sink name used by routes.
    pub name: SinkName,
    /// Graph node the sink executes as.
    pub node_id: NodeId,
    /// Sink plugin instance.
    pub plugin: Box<dyn SinkPlugin>,
}

/// Fully-assembled pipeline handed to the orchestrator.
///
/// # Invariants
/// - `node_registrations` covers the source, every step, and every sink.
/// - `config_hash` is the canonical hash of the settings the pipeline was
///   built from.
pub struct Pipeline {
    /// Source node identifier.
    pub source_node: NodeId,
    /// Source plugin instance.
    pub source: Box<dyn SourcePlugin>,
    /// Ordered pipeline steps.
    pub steps: Vec<PipelineStep>,
    /// Sink bindings.
    pub sinks: Vec<SinkBinding>,
    /// Sink receiving main-path completions.
    pub default_sink: SinkName,
    /// Declared route plan.
    pub route_plan: RoutePlan,
    /// Registration payloads for every node.
    pub node_registrations: Vec<NodeRegistration>,
    /// Canonical hash of the pipeline configuration.
    pub config_hash: HashDigest,
}

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Retry policy for capacity-exhausted transforms.
    pub retry: RetryPolicy,
    /// Canonical serialization format version stamped on runs.
    pub canonical_version: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            canonical_version: "1".to_string(),
        }
    }
}

// ============================================================================
// SECTION: Reports
// ============================================================================

/// Processing counters for a finished run.
///
/// Counters reflect processing outcomes and may be inflated relative to
/// durable output when a crash occurs between processing and sink write;
/// token outcomes are the durable truth.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCounters {
    /// Valid rows admitted.
    pub rows_admitted: u64,
    /// Rows quarantined by the source.
    pub rows_quarantined: u64,
    /// Tokens durably written to sinks.
    pub tokens_written: u64,
    /// Failed tokens (routed to error sinks or discarded).
    pub rows_failed: u64,
}

/// Result of a completed (or failed) run.
#[derive(Debug)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: RunId,
    /// Final run status.
    pub status: RunStatus,
    /// Processing counters.
    pub counters: RunCounters,
    /// Artifacts produced per sink.
    pub artifacts: BTreeMap<SinkName, ArtifactDescriptor>,
}

/// Dry-run resume inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeReport {
    /// Run identifier.
    pub run_id: RunId,
    /// Rows with no terminal outcome and no sink checkpoint.
    pub unprocessed_rows: u64,
    /// Sink node of the latest checkpoint, when one exists.
    pub checkpoint_node: Option<NodeId>,
    /// Number of stored checkpoints.
    pub checkpoint_count: u64,
}

// ============================================================================
// SECTION: Internal Queues
// ============================================================================

/// One write queued for a sink, with its post-write outcome.
struct QueuedWrite {
    /// Token to write.
    token_id: TokenId,
    /// Payload to write.
    payload: SinkPayload,
    /// Terminal outcome to record after the durable write.
    outcome: OutcomeKind,
    /// Outcome context to record with it.
    context: OutcomeContext,
}

/// Per-sink pending queues preserving admission order, then fork order.
type SinkQueues = BTreeMap<SinkName, Vec<QueuedWrite>>;

// ============================================================================
// SECTION: Orchestrator
// ============================================================================

/// Single-run pipeline orchestrator.
///
/// # Invariants
/// - One run at a time; rows are pumped sequentially.
/// - Outcomes are recorded strictly after their sink write completes.
pub struct Orchestrator<'a> {
    /// Landscape recorder.
    landscape: &'a dyn Landscape,
    /// Content-addressed payload store.
    payload: &'a dyn PayloadStore,
    /// Telemetry sink.
    telemetry: &'a dyn Telemetry,
    /// Time source.
    clock: &'a dyn Clock,
    /// Tuning knobs.
    settings: OrchestratorSettings,
}

impl<'a> Orchestrator<'a> {
    /// Creates an orchestrator over the provided collaborators.
    #[must_use]
    pub const fn new(
        landscape: &'a dyn Landscape,
        payload: &'a dyn PayloadStore,
        telemetry: &'a dyn Telemetry,
        clock: &'a dyn Clock,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            landscape,
            payload,
            telemetry,
            clock,
            settings,
        }
    }

    /// Executes a full run of the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] on fatal failures; the run is marked
    /// failed in the landscape before the error surfaces.
    pub fn run(&self, pipeline: Pipeline) -> Result<RunReport, OrchestratorError> {
        let graph = build_graph(&pipeline)?;
        let topology_hash = graph.compute_full_topology_hash()?;
        let run = self.landscape.begin_run(&RunConfig {
            config_hash: pipeline.config_hash.clone(),
            canonical_version: self.settings.canonical_version.clone(),
            started_at: self.clock.now(),
        })?;
        let run_id = run.run_id;
        let result = self.run_inner(run_id, pipeline, &graph, &topology_hash, SinkMode::Write, &[]);
        self.finish(run_id, result)
    }

    /// Inspects a crashed run without executing it.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when the run is unknown or the
    /// checkpoint is incompatible with the current pipeline.
    pub fn resume_report(
        &self,
        run_id: RunId,
        pipeline: &Pipeline,
    ) -> Result<ResumeReport, OrchestratorError> {
        let graph = build_graph(pipeline)?;
        let topology_hash = graph.compute_full_topology_hash()?;
        self.verify_resume_compatibility(run_id, pipeline, &graph, &topology_hash)?;
        let checkpoints = self.landscape.list_checkpoints(run_id)?;
        let unprocessed = self.landscape.get_unprocessed_row_ids(run_id)?;
        Ok(ResumeReport {
            run_id,
            unprocessed_rows: unprocessed.len() as u64,
            checkpoint_node: checkpoints
                .last()
                .map(|checkpoint| checkpoint.request.node_id.clone()),
            checkpoint_count: checkpoints.len() as u64,
        })
    }

    /// Resumes a crashed run, re-processing exactly the unprocessed rows.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::CheckpointIncompatible`] on any
    /// topology or checkpoint-node configuration change, and
    /// [`OrchestratorError::Payload`] when a row payload was purged.
    pub fn resume(
        &self,
        run_id: RunId,
        pipeline: Pipeline,
    ) -> Result<RunReport, OrchestratorError> {
        let graph = build_graph(&pipeline)?;
        let topology_hash = graph.compute_full_topology_hash()?;
        self.verify_resume_compatibility(run_id, &pipeline, &graph, &topology_hash)?;
        let aggregation_state = self
            .landscape
            .list_checkpoints(run_id)?
            .last()
            .and_then(|checkpoint| checkpoint.request.aggregation_state_json.clone());
        self.landscape.update_run_status(run_id, RunStatus::Running)?;
        let restore = aggregation_state.as_ref().map(std::slice::from_ref).unwrap_or_default();
        let result = self.run_inner(run_id, pipeline, &graph, &topology_hash, SinkMode::Append, restore);
        self.finish(run_id, result)
    }

    /// Verifies the one-run-one-configuration resume contract.
    fn verify_resume_compatibility(
        &self,
        run_id: RunId,
        pipeline: &Pipeline,
        graph: &ExecutionGraph,
        topology_hash: &HashDigest,
    ) -> Result<(), OrchestratorError> {
        let run = self.landscape.get_run(run_id)?.ok_or_else(|| {
            OrchestratorError::Invariant(format!("run {run_id} not found in landscape"))
        })?;
        let checkpoints = self.landscape.list_checkpoints(run_id)?;
        match checkpoints.last() {
            Some(latest) => {
                if latest.request.upstream_topology_hash != *topology_hash {
                    return Err(OrchestratorError::CheckpointIncompatible(format!(
                        "topology hash mismatch: stored {} current {}",
                        latest.request.upstream_topology_hash, topology_hash
                    )));
                }
                let Some(node) = graph.node(&latest.request.node_id) else {
                    return Err(OrchestratorError::CheckpointIncompatible(format!(
                        "checkpoint node '{}' no longer exists",
                        latest.request.node_id
                    )));
                };
                if node.config_hash != latest.request.checkpoint_node_config_hash {
                    return Err(OrchestratorError::CheckpointIncompatible(format!(
                        "checkpoint node '{}' configuration changed",
                        latest.request.node_id
                    )));
                }
            }
            None => {
                if run.config_hash != pipeline.config_hash {
                    return Err(OrchestratorError::CheckpointIncompatible(
                        "run configuration hash changed with no checkpoint to anchor resume"
                            .to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Completes the run record for both success and failure paths.
    fn finish(
        &self,
        run_id: RunId,
        result: Result<RunReport, OrchestratorError>,
    ) -> Result<RunReport, OrchestratorError> {
        match result {
            Ok(report) => Ok(report),
            Err(error) => {
                // Best-effort failure record; the original error surfaces.
                let _ = self.landscape.complete_run(run_id, RunStatus::Failed, self.clock.now());
                Err(error)
            }
        }
    }

    /// Shared run/resume body.
    #[allow(clippy::too_many_lines, reason = "The run sequence is one linear protocol.")]
    fn run_inner(
        &self,
        run_id: RunId,
        pipeline: Pipeline,
        graph: &ExecutionGraph,
        topology_hash: &HashDigest,
        sink_mode: SinkMode,
        restore_state: &[Value],
    ) -> Result<RunReport, OrchestratorError> {
        let Pipeline {
            source_node,
            mut source,
            steps,
            mut sinks,
            default_sink,
            route_plan,
            node_registrations,
            ..
        } = pipeline;

        // Registration: every node and edge, before any row.
        if sink_mode == SinkMode::Write {
            let now = self.clock.now();
            for registration in &node_registrations {
                self.landscape.register_node(run_id, registration, now)?;
            }
            for (from, to, label) in graph.edges() {
                self.landscape.register_edge(run_id, &from, &to, &label, now)?;
            }
        }

        // Route validation before the first row.
        let gate_names: Vec<NodeId> = steps
            .iter()
            .filter(|step| {
                matches!(step.body, crate::runtime::processor::StepBody::Gate(_))
            })
            .map(|step| step.node_id.clone())
            .collect();
        let sink_names: BTreeSet<SinkName> =
            sinks.iter().map(|binding| binding.name.clone()).collect();
        validate_route_plan(&route_plan, &gate_names, &sink_names)?;

        // Node binding: a missing assignment is an invariant violation.
        source.bind_node(source_node.clone());
        let error_routes = route_plan.transform_error_sinks.clone();
        let mut processor = RowProcessor::new(
            steps,
            default_sink.clone(),
            error_routes,
            RetryManager::new(self.settings.retry),
        );
        processor.bind_nodes();
        processor.verify_bindings()?;
        if source.node_id().is_none() {
            return Err(OrchestratorError::Invariant(
                "source plugin has no node binding".to_string(),
            ));
        }
        for binding in &mut sinks {
            binding.plugin.bind_node(binding.node_id.clone());
            binding.plugin.prepare(sink_mode).map_err(|error| {
                OrchestratorError::SinkPrepare {
                    sink: binding.name.as_str().to_string(),
                    error,
                }
            })?;
        }

        // Resume-only: restore aggregation buffers and void stale batches.
        let mut restored_rows: BTreeSet<RowId> = BTreeSet::new();
        for state in restore_state {
            restored_rows.extend(processor.restore_aggregation_state(state)?);
        }

        let env = ProcessEnv {
            run_id,
            landscape: self.landscape,
            telemetry: self.telemetry,
            clock: self.clock,
        };
        let mut queues: SinkQueues = BTreeMap::new();
        let mut counters = RunCounters::default();
        let mut cancelled = false;

        if sink_mode == SinkMode::Write {
            self.pump_source(
                &env,
                run_id,
                &source_node,
                source.as_mut(),
                &mut processor,
                &route_plan,
                &mut queues,
                &mut counters,
                &mut cancelled,
            )?;
        } else {
            self.pump_resume(
                &env,
                run_id,
                source.as_mut(),
                &mut processor,
                &restored_rows,
                &mut queues,
                &mut counters,
            )?;
        }

        // End-of-source flush always runs, even with zero admitted rows.
        let flushed = processor.flush_all(&env)?;
        absorb_output(&mut queues, &mut counters, flushed);

        // Sink writes, then outcomes, then checkpoints.
        let aggregation_state = processor.aggregation_state()?;
        let mut artifacts = BTreeMap::new();
        let mut sink_failed = false;
        for binding in &mut sinks {
            let Some(queue) = queues.remove(&binding.name) else {
                continue;
            };
            if queue.is_empty() {
                continue;
            }
            let wrote = self.write_sink(
                run_id,
                binding,
                queue,
                topology_hash,
                graph,
                aggregation_state.as_ref(),
                &mut artifacts,
                &mut counters,
            )?;
            if !wrote {
                sink_failed = true;
            }
        }
        for binding in &mut sinks {
            let _ = binding.plugin.flush();
            let _ = binding.plugin.close();
        }
        let _ = source.close();
        processor.close();

        let status = if cancelled || sink_failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        self.landscape.complete_run(run_id, status, self.clock.now())?;
        if status == RunStatus::Completed {
            self.landscape.delete_checkpoints(run_id)?;
        }
        Ok(RunReport {
            run_id,
            status,
            counters,
            artifacts,
        })
    }

    /// Pumps the source to exhaustion or cancellation.
    #[allow(clippy::too_many_arguments, reason = "Run-loop state is threaded explicitly.")]
    fn pump_source(
        &self,
        env: &ProcessEnv<'_>,
        run_id: RunId,
        source_node: &NodeId,
        source: &mut dyn SourcePlugin,
        processor: &mut RowProcessor,
        route_plan: &RoutePlan,
        queues: &mut SinkQueues,
        counters: &mut RunCounters,
        cancelled: &mut bool,
    ) -> Result<(), OrchestratorError> {
        let lifecycle_ctx = PluginContext {
            run_id,
            state_id: None,
            token_id: None,
            landscape: self.landscape,
            telemetry: self.telemetry,
        };
        source.open(&lifecycle_ctx)?;
        let mut row_index = 0_u64;
        loop {
            let next = source.next_row(&lifecycle_ctx);
            match next {
                None => break,
                Some(Err(_)) => {
                    // Stop admitting; already-queued tokens still write.
                    *cancelled = true;
                    break;
                }
                Some(Ok(SourceRow::Quarantined {
                    row,
                    destination,
                })) => {
                    let target = destination
                        .or_else(|| route_plan.source_quarantine.clone())
                        .unwrap_or(ErrorSinkTarget::Discard);
                    self.admit_quarantined(
                        run_id,
                        source_node,
                        row_index,
                        row,
                        &target,
                        queues,
                        counters,
                    )?;
                    row_index += 1;
                }
                Some(Ok(SourceRow::Valid {
                    raw,
                    contract,
                })) => {
                    // Lazy timeout check before this row is buffered.
                    let timed_out = processor.check_timeouts(env)?;
                    absorb_output(queues, counters, timed_out);
                    if let Some(contract) = contract {
                        source.set_schema_contract(contract);
                    }
                    let mut active = source.schema_contract().clone();
                    if !active.locked {
                        match active.observe(&raw) {
                            Ok(()) => source.set_schema_contract(active.clone()),
                            Err(error) => {
                                self.quarantine_contract_violation(
                                    run_id, source_node, row_index, &raw, &error, route_plan,
                                    queues, counters,
                                )?;
                                row_index += 1;
                                continue;
                            }
                        }
                    }
                    let pipeline_row = match active.build_row(&raw) {
                        Ok(row) => row,
                        Err(error) => {
                            self.quarantine_contract_violation(
                                run_id, source_node, row_index, &raw, &error, route_plan,
                                queues, counters,
                            )?;
                            row_index += 1;
                            continue;
                        }
                    };
                    let (row_id, token_id) =
                        self.admit_row(run_id, source_node, row_index, &raw)?;
                    counters.rows_admitted += 1;
                    let output = processor.process_row(
                        env,
                        TokenCtx::initial(token_id, row_id, row_index),
                        pipeline_row,
                    )?;
                    absorb_output(queues, counters, output);
                    row_index += 1;
                }
            }
        }
        Ok(())
    }

    /// Pumps unprocessed rows from the landscape during resume.
    #[allow(clippy::too_many_arguments, reason = "Run-loop state is threaded explicitly.")]
    fn pump_resume(
        &self,
        env: &ProcessEnv<'_>,
        run_id: RunId,
        source: &mut dyn SourcePlugin,
        processor: &mut RowProcessor,
        restored_rows: &BTreeSet<RowId>,
        queues: &mut SinkQueues,
        counters: &mut RunCounters,
    ) -> Result<(), OrchestratorError> {
        // Void draft batches that were not restored into buffers; their rows
        // re-buffer into fresh batches below.
        let kept_batches: BTreeSet<_> = processor.buffered_batch_ids().into_iter().collect();
        for batch in self.landscape.get_incomplete_batches(run_id)? {
            if batch.status == BatchStatus::Draft && !kept_batches.contains(&batch.batch_id) {
                self.landscape.update_batch_status(
                    batch.batch_id,
                    BatchStatus::Failed,
                    None,
                    Some(self.clock.now()),
                    None,
                )?;
            }
        }
        let unprocessed = self.landscape.get_unprocessed_row_ids(run_id)?;
        let to_process: Vec<RowId> = unprocessed
            .into_iter()
            .filter(|row_id| !restored_rows.contains(row_id))
            .collect();
        let rows = self.landscape.get_rows(run_id, &to_process)?;
        for record in rows {
            let bytes = self
                .payload
                .retrieve(&PayloadHash::new(record.source_data_ref.clone()))?;
            let raw: Map<String, Value> = serde_json::from_slice(&bytes).map_err(|err| {
                OrchestratorError::Invariant(format!(
                    "stored payload for row {} is not a JSON object: {err}",
                    record.row_id
                ))
            })?;
            let mut active = source.schema_contract().clone();
            if !active.locked {
                active
                    .observe(&raw)
                    .map_err(|err| contract_fatal(record.row_id, &err))?;
                source.set_schema_contract(active.clone());
            }
            let pipeline_row =
                active.build_row(&raw).map_err(|err| contract_fatal(record.row_id, &err))?;
            let token_id = match self.landscape.get_initial_token(record.row_id)? {
                Some(token_id) => token_id,
                None => {
                    self.landscape.create_token(record.row_id, None, None, self.clock.now())?
                }
            };
            let timed_out = processor.check_timeouts(env)?;
            absorb_output(queues, counters, timed_out);
            counters.rows_admitted += 1;
            let output = processor.process_row(
                env,
                TokenCtx::initial(token_id, record.row_id, record.row_index),
                pipeline_row,
            )?;
            absorb_output(queues, counters, output);
        }
        Ok(())
    }

    /// Persists and registers one valid row, returning its row and token.
    fn admit_row(
        &self,
        run_id: RunId,
        source_node: &NodeId,
        row_index: u64,
        raw: &Map<String, Value>,
    ) -> Result<(RowId, TokenId), OrchestratorError> {
        let bytes = canonical_json_bytes(&Value::Object(raw.clone()))?;
        let data_hash = hash_bytes(DEFAULT_HASH_ALGORITHM, &bytes);
        let payload_hash = self.payload.store(&bytes)?;
        let now = self.clock.now();
        let row_id = self.landscape.create_row(&NewRow {
            run_id,
            source_node_id: source_node.clone(),
            row_index,
            source_data_hash: data_hash,
            source_data_ref: payload_hash.as_str().to_string(),
            created_at: now,
        })?;
        let token_id = self.landscape.create_token(row_id, None, None, now)?;
        Ok((row_id, token_id))
    }

    /// Quarantines a row that violated the schema contract at admission.
    #[allow(clippy::too_many_arguments, reason = "Run-loop state is threaded explicitly.")]
    fn quarantine_contract_violation(
        &self,
        run_id: RunId,
        source_node: &NodeId,
        row_index: u64,
        raw: &Map<String, Value>,
        error: &ContractError,
        route_plan: &RoutePlan,
        queues: &mut SinkQueues,
        counters: &mut RunCounters,
    ) -> Result<(), OrchestratorError> {
        let target = route_plan.source_quarantine.clone().unwrap_or(ErrorSinkTarget::Discard);
        let quarantined = QuarantinedRow {
            raw: Value::Object(raw.clone()),
            error: error.to_string(),
        };
        self.admit_quarantined(
            run_id,
            source_node,
            row_index,
            quarantined,
            &target,
            queues,
            counters,
        )
    }

    /// Persists a quarantined row and routes it to its destination.
    #[allow(clippy::too_many_arguments, reason = "Run-loop state is threaded explicitly.")]
    fn admit_quarantined(
        &self,
        run_id: RunId,
        source_node: &NodeId,
        row_index: u64,
        row: QuarantinedRow,
        target: &ErrorSinkTarget,
        queues: &mut SinkQueues,
        counters: &mut RunCounters,
    ) -> Result<(), OrchestratorError> {
        counters.rows_quarantined += 1;
        let bytes = canonical_json_bytes(&row.raw)?;
        let data_hash = hash_bytes(DEFAULT_HASH_ALGORITHM, &bytes);
        let payload_hash = self.payload.store(&bytes)?;
        let now = self.clock.now();
        let row_id = self.landscape.create_row(&NewRow {
            run_id,
            source_node_id: source_node.clone(),
            row_index,
            source_data_hash: data_hash,
            source_data_ref: payload_hash.as_str().to_string(),
            created_at: now,
        })?;
        let token_id = self.landscape.create_token(row_id, None, None, now)?;
        let state_id =
            self.landscape.record_node_state(run_id, token_id, source_node, now)?;
        self.landscape.complete_node_state(
            state_id,
            NodeStateStatus::Quarantined,
            self.clock.now(),
            None,
        )?;
        let context = OutcomeContext {
            context_json: Some(Value::String(row.error.clone())),
            ..OutcomeContext::default()
        };
        match target {
            ErrorSinkTarget::Sink(sink) => {
                let context = OutcomeContext {
                    sink_name: Some(sink.clone()),
                    ..context
                };
                queues.entry(sink.clone()).or_default().push(QueuedWrite {
                    token_id,
                    payload: SinkPayload::Quarantined(row),
                    outcome: OutcomeKind::Quarantined,
                    context,
                });
            }
            ErrorSinkTarget::Discard => {
                self.landscape.record_token_outcome(
                    run_id,
                    token_id,
                    OutcomeKind::Quarantined,
                    &context,
                    self.clock.now(),
                )?;
            }
        }
        Ok(())
    }

    /// Writes one sink's queue, then records outcomes and checkpoints for
    /// durably-written tokens. Returns `false` when the sink write failed.
    #[allow(clippy::too_many_arguments, reason = "Run-loop state is threaded explicitly.")]
    fn write_sink(
        &self,
        run_id: RunId,
        binding: &mut SinkBinding,
        queue: Vec<QueuedWrite>,
        topology_hash: &HashDigest,
        graph: &ExecutionGraph,
        aggregation_state: Option<&Value>,
        artifacts: &mut BTreeMap<SinkName, ArtifactDescriptor>,
        counters: &mut RunCounters,
    ) -> Result<bool, OrchestratorError> {
        let sink_config_hash = graph
            .node(&binding.node_id)
            .map(|node| node.config_hash.clone())
            .ok_or_else(|| {
                OrchestratorError::Invariant(format!(
                    "sink node '{}' missing from graph",
                    binding.node_id
                ))
            })?;
        let tokens: Vec<SinkToken> = queue
            .iter()
            .map(|write| SinkToken {
                token_id: write.token_id,
                payload: write.payload.clone(),
            })
            .collect();
        let mut write_ctx = SinkWriteContext::new(run_id, self.landscape, self.telemetry);
        let write_result = binding.plugin.write(&tokens, &mut write_ctx);
        let written: Vec<TokenId> = match &write_result {
            Ok(_) if write_ctx.written().is_empty() => {
                // A sink that reports nothing but succeeds wrote everything.
                queue.iter().map(|write| write.token_id).collect()
            }
            _ => write_ctx.written().to_vec(),
        };
        let by_token: BTreeMap<TokenId, &QueuedWrite> =
            queue.iter().map(|write| (write.token_id, write)).collect();
        for token_id in written {
            let Some(write) = by_token.get(&token_id) else {
                return Err(OrchestratorError::Invariant(format!(
                    "sink '{}' confirmed unknown token {token_id}",
                    binding.name
                )));
            };
            self.landscape.record_token_outcome(
                run_id,
                token_id,
                write.outcome,
                &write.context,
                self.clock.now(),
            )?;
            self.landscape.create_checkpoint(&CheckpointRequest {
                run_id,
                token_id,
                node_id: binding.node_id.clone(),
                upstream_topology_hash: topology_hash.clone(),
                checkpoint_node_config_hash: sink_config_hash.clone(),
                aggregation_state_json: aggregation_state.cloned(),
                format_version: CHECKPOINT_FORMAT_VERSION,
                created_at: self.clock.now(),
            })?;
            counters.tokens_written += 1;
            if write.outcome == OutcomeKind::Failed {
                counters.rows_failed += 1;
            }
        }
        match write_result {
            Ok(descriptor) => {
                artifacts.insert(binding.name.clone(), descriptor);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Merges processor output into the sink queues and counters.
fn absorb_output(queues: &mut SinkQueues, counters: &mut RunCounters, output: RowOutput) {
    counters.rows_failed += u64::from(output.discarded);
    for emit in output.pending {
        let PendingEmit {
            sink,
            token,
            row,
            outcome,
            context,
        } = emit;
        queues.entry(sink).or_default().push(QueuedWrite {
            token_id: token.token_id,
            payload: SinkPayload::Row(row),
            outcome,
            context,
        });
    }
}

/// Builds the execution graph from a pipeline assembly.
fn build_graph(pipeline: &Pipeline) -> Result<ExecutionGraph, GraphError> {
    let mut builder = ExecutionGraphBuilder::new();
    for registration in &pipeline.node_registrations {
        builder.add_node(registration.clone())?;
    }
    // Main spine: source -> steps -> default sink, labeled `continue`.
    let mut previous = pipeline.source_node.clone();
    for step in &pipeline.steps {
        builder.add_edge(previous, step.node_id.clone(), RouteLabel::new(ROUTE_CONTINUE))?;
        previous = step.node_id.clone();
    }
    let default_sink_node = pipeline
        .sinks
        .iter()
        .find(|binding| binding.name == pipeline.default_sink)
        .map(|binding| binding.node_id.clone())
        .ok_or_else(|| GraphError::UnknownNode(pipeline.default_sink.as_str().to_string()))?;
    builder.add_edge(previous, default_sink_node, RouteLabel::new(ROUTE_CONTINUE))?;
    // Gate routes become labeled edges to their destinations.
    for (gate, routes) in &pipeline.route_plan.gate_routes {
        for (label, destination) in routes {
            if let RouteDestination::Sink(sink) = destination {
                let sink_node = pipeline
                    .sinks
                    .iter()
                    .find(|binding| binding.name == *sink)
                    .map(|binding| binding.node_id.clone())
                    .ok_or_else(|| GraphError::UnknownNode(sink.as_str().to_string()))?;
                builder.add_edge(gate.clone(), sink_node, label.clone())?;
            }
        }
    }
    // Error and quarantine destinations become labeled edges.
    for (node, target) in &pipeline.route_plan.transform_error_sinks {
        if let ErrorSinkTarget::Sink(sink) = target {
            let sink_node = pipeline
                .sinks
                .iter()
                .find(|binding| binding.name == *sink)
                .map(|binding| binding.node_id.clone())
                .ok_or_else(|| GraphError::UnknownNode(sink.as_str().to_string()))?;
            builder.add_edge(node.clone(), sink_node, RouteLabel::new("on_error"))?;
        }
    }
    if let Some(ErrorSinkTarget::Sink(sink)) = &pipeline.route_plan.source_quarantine {
        let sink_node = pipeline
            .sinks
            .iter()
            .find(|binding| binding.name == *sink)
            .map(|binding| binding.node_id.clone())
            .ok_or_else(|| GraphError::UnknownNode(sink.as_str().to_string()))?;
        builder.add_edge(
            pipeline.source_node.clone(),
            sink_node,
            RouteLabel::new("quarantine"),
        )?;
    }
    // Any declared sink still unconnected is linked from the source so the
    // registered graph covers every node the run owns.
    let mut connected: BTreeSet<NodeId> = BTreeSet::new();
    connected.insert(pipeline.source_node.clone());
    for step in &pipeline.steps {
        connected.insert(step.node_id.clone());
    }
    // The spine's default sink plus every route/error/quarantine target.
    let spine_sink = pipeline
        .sinks
        .iter()
        .find(|binding| binding.name == pipeline.default_sink)
        .map(|binding| binding.node_id.clone());
    connected.extend(spine_sink);
    for routes in pipeline.route_plan.gate_routes.values() {
        for destination in routes.values() {
            if let RouteDestination::Sink(sink) = destination
                && let Some(binding) =
                    pipeline.sinks.iter().find(|binding| binding.name == *sink)
            {
                connected.insert(binding.node_id.clone());
            }
        }
    }
    for target in pipeline.route_plan.transform_error_sinks.values() {
        if let ErrorSinkTarget::Sink(sink) = target
            && let Some(binding) = pipeline.sinks.iter().find(|binding| binding.name == *sink)
        {
            connected.insert(binding.node_id.clone());
        }
    }
    if let Some(ErrorSinkTarget::Sink(sink)) = &pipeline.route_plan.source_quarantine
        && let Some(binding) = pipeline.sinks.iter().find(|binding| binding.name == *sink)
    {
        connected.insert(binding.node_id.clone());
    }
    for binding in &pipeline.sinks {
        if !connected.contains(&binding.node_id) {
            builder.add_edge(
                pipeline.source_node.clone(),
                binding.node_id.clone(),
                RouteLabel::new("declared"),
            )?;
        }
    }
    let graph = builder.build()?;
    Ok(graph)
}

/// Maps a contract violation during resume into a fatal error.
fn contract_fatal(row_id: RowId, error: &ContractError) -> OrchestratorError {
    OrchestratorError::Invariant(format!(
        "row {row_id} no longer satisfies the schema contract on resume: {error}"
    ))
}
