// crates/elspeth-core/tests/common/mod.rs
// ============================================================================
// Module: Core Test Helpers
// Description: Shared plugins, stores, and builders for core tests.
// Purpose: Keep processor and orchestrator tests focused on behavior.
// ============================================================================

//! ## Overview
//! Test-local plugin implementations and builders: a vector source, a
//! collecting sink, a payload store over a map, and pipeline assembly
//! shortcuts. Production crates ship their own plugins; these exist so core
//! tests stay dependency-free.

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
    dead_code,
    reason = "Test-only helpers; not every test uses every helper."
)]

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use elspeth_core::ArtifactDescriptor;
use elspeth_core::ContractMode;
use elspeth_core::Determinism;
use elspeth_core::GateError;
use elspeth_core::GatePlugin;
use elspeth_core::Landscape;
use elspeth_core::NewRow;
use elspeth_core::NodeId;
use elspeth_core::NodeRegistration;
use elspeth_core::NodeType;
use elspeth_core::PayloadError;
use elspeth_core::PayloadHash;
use elspeth_core::PayloadStore;
use elspeth_core::PipelineRow;
use elspeth_core::PipelineStep;
use elspeth_core::PluginContext;
use elspeth_core::PluginName;
use elspeth_core::RoutingAction;
use elspeth_core::RunConfig;
use elspeth_core::SchemaContract;
use elspeth_core::SinkError;
use elspeth_core::SinkMode;
use elspeth_core::SinkPayload;
use elspeth_core::SinkPlugin;
use elspeth_core::SinkToken;
use elspeth_core::SinkWriteContext;
use elspeth_core::SourceError;
use elspeth_core::SourcePlugin;
use elspeth_core::SourceRow;
use elspeth_core::Timestamp;
use elspeth_core::TokenCtx;
use elspeth_core::TokenId;
use elspeth_core::TransformPlugin;
use elspeth_core::TransformResult;
use elspeth_core::hashing::DEFAULT_HASH_ALGORITHM;
use elspeth_core::hashing::hash_bytes;
use elspeth_core::hashing::hash_canonical_json;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;

/// Builds a pipeline row over an observed contract from JSON pairs.
pub fn row_from(pairs: &[(&str, Value)]) -> PipelineRow {
    let mut raw = Map::new();
    for (name, value) in pairs {
        raw.insert((*name).to_string(), value.clone());
    }
    let mut contract = SchemaContract::new(ContractMode::Observed);
    contract.observe(&raw).expect("observe row");
    contract.build_row(&raw).expect("build row")
}

/// Builds raw source data from JSON pairs.
pub fn raw_from(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut raw = Map::new();
    for (name, value) in pairs {
        raw.insert((*name).to_string(), value.clone());
    }
    raw
}

/// Builds a node registration with a config hash derived from its id.
pub fn registration(node: &str, node_type: NodeType) -> NodeRegistration {
    NodeRegistration {
        node_id: NodeId::new(node),
        plugin_name: PluginName::new(format!("test_{node}")),
        node_type,
        plugin_version: "0.0.0".to_string(),
        determinism: Determinism::Deterministic,
        config_hash: hash_canonical_json(DEFAULT_HASH_ALGORITHM, &json!({ "node": node }))
            .expect("config hash"),
        schema_config_json: None,
    }
}

// ============================================================================
// SECTION: Vector Source
// ============================================================================

/// Source yielding pre-built source rows.
pub struct VecSource {
    rows: VecDeque<Result<SourceRow, SourceError>>,
    contract: SchemaContract,
    node_id: Option<NodeId>,
}

impl VecSource {
    /// Creates a source over raw valid rows.
    pub fn of_valid(rows: Vec<Map<String, Value>>) -> Self {
        Self {
            rows: rows
                .into_iter()
                .map(|raw| {
                    Ok(SourceRow::Valid {
                        raw,
                        contract: None,
                    })
                })
                .collect(),
            contract: SchemaContract::new(ContractMode::Observed),
            node_id: None,
        }
    }

    /// Creates a source over explicit results (for cancellation tests).
    pub fn of_results(rows: Vec<Result<SourceRow, SourceError>>) -> Self {
        Self {
            rows: rows.into(),
            contract: SchemaContract::new(ContractMode::Observed),
            node_id: None,
        }
    }
}

impl SourcePlugin for VecSource {
    fn bind_node(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn node_id(&self) -> Option<&NodeId> {
        self.node_id.as_ref()
    }

    fn next_row(&mut self, _ctx: &PluginContext<'_>) -> Option<Result<SourceRow, SourceError>> {
        self.rows.pop_front()
    }

    fn schema_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn set_schema_contract(&mut self, contract: SchemaContract) {
        self.contract = contract;
    }
}

// ============================================================================
// SECTION: Function Transform
// ============================================================================

/// Transform delegating to a closure.
pub struct FnTransform {
    function: Box<dyn FnMut(PipelineRow) -> TransformResult>,
    node_id: Option<NodeId>,
}

impl FnTransform {
    /// Creates a transform from a closure.
    pub fn new(function: impl FnMut(PipelineRow) -> TransformResult + 'static) -> Self {
        Self {
            function: Box::new(function),
            node_id: None,
        }
    }
}

impl TransformPlugin for FnTransform {
    fn bind_node(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn node_id(&self) -> Option<&NodeId> {
        self.node_id.as_ref()
    }

    fn process(&mut self, row: PipelineRow, _ctx: &PluginContext<'_>) -> TransformResult {
        (self.function)(row)
    }
}

/// Batch-aware transform delegating to a closure.
pub struct FnBatchTransform {
    function: Box<dyn FnMut(Vec<PipelineRow>) -> TransformResult>,
    node_id: Option<NodeId>,
}

impl FnBatchTransform {
    /// Creates a batch transform from a closure.
    pub fn new(function: impl FnMut(Vec<PipelineRow>) -> TransformResult + 'static) -> Self {
        Self {
            function: Box::new(function),
            node_id: None,
        }
    }
}

impl TransformPlugin for FnBatchTransform {
    fn bind_node(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn node_id(&self) -> Option<&NodeId> {
        self.node_id.as_ref()
    }

    fn is_batch_aware(&self) -> bool {
        true
    }

    fn process(&mut self, row: PipelineRow, ctx: &PluginContext<'_>) -> TransformResult {
        self.process_batch(vec![row], ctx)
    }

    fn process_batch(
        &mut self,
        rows: Vec<PipelineRow>,
        _ctx: &PluginContext<'_>,
    ) -> TransformResult {
        (self.function)(rows)
    }
}

// ============================================================================
// SECTION: Collecting Sink
// ============================================================================

/// One record collected by a [`CollectSink`].
#[derive(Debug, Clone)]
pub struct Collected {
    pub token_id: TokenId,
    pub payload: Value,
}

/// Shared storage for collected sink writes.
pub type CollectedStore = Arc<Mutex<Vec<Collected>>>;

/// Sink collecting written payloads; can be told to fail after N tokens.
pub struct CollectSink {
    store: CollectedStore,
    fail_after: Option<usize>,
    node_id: Option<NodeId>,
}

impl CollectSink {
    /// Creates a sink and its shared store.
    pub fn new() -> (Self, CollectedStore) {
        let store: CollectedStore = Arc::default();
        (
            Self {
                store: Arc::clone(&store),
                fail_after: None,
                node_id: None,
            },
            store,
        )
    }

    /// Creates a sink that confirms `fail_after` tokens then errors.
    pub fn failing_after(fail_after: usize) -> (Self, CollectedStore) {
        let (mut sink, store) = Self::new();
        sink.fail_after = Some(fail_after);
        (sink, store)
    }
}

impl SinkPlugin for CollectSink {
    fn bind_node(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn node_id(&self) -> Option<&NodeId> {
        self.node_id.as_ref()
    }

    fn prepare(&mut self, _mode: SinkMode) -> Result<(), SinkError> {
        Ok(())
    }

    fn write(
        &mut self,
        tokens: &[SinkToken],
        ctx: &mut SinkWriteContext<'_>,
    ) -> Result<ArtifactDescriptor, SinkError> {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        for (index, token) in tokens.iter().enumerate() {
            if self.fail_after.is_some_and(|limit| index >= limit) {
                return Err(SinkError::Write("sink failure injected".to_string()));
            }
            let payload = match &token.payload {
                SinkPayload::Row(row) => row.to_json(),
                SinkPayload::Quarantined(row) => json!({
                    "raw": row.raw,
                    "error": row.error,
                }),
            };
            store.push(Collected {
                token_id: token.token_id,
                payload,
            });
            ctx.token_written(token.token_id);
        }
        Ok(ArtifactDescriptor {
            uri: "collect:".to_string(),
            content_type: None,
            bytes_written: None,
        })
    }
}

// ============================================================================
// SECTION: Map Payload Store
// ============================================================================

/// Payload store over an in-memory map.
#[derive(Debug, Default)]
pub struct MapPayloadStore {
    entries: Mutex<BTreeMap<PayloadHash, Vec<u8>>>,
}

impl MapPayloadStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes a payload, simulating retention purging.
    pub fn purge(&self, hash: &PayloadHash) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).remove(hash);
    }
}

impl PayloadStore for MapPayloadStore {
    fn store(&self, bytes: &[u8]) -> Result<PayloadHash, PayloadError> {
        let hash = PayloadHash::new(hash_bytes(DEFAULT_HASH_ALGORITHM, bytes).value);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(hash.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(hash)
    }

    fn retrieve(&self, hash: &PayloadHash) -> Result<Vec<u8>, PayloadError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hash)
            .cloned()
            .ok_or_else(|| PayloadError::Purged(hash.as_str().to_string()))
    }
}

/// Builds a transform step bound to a node id.
pub fn transform_step(
    node: &str,
    function: impl FnMut(PipelineRow) -> TransformResult + 'static,
) -> PipelineStep {
    PipelineStep {
        node_id: NodeId::new(node),
        body: elspeth_core::StepBody::Transform(Box::new(FnTransform::new(function))),
    }
}

// ============================================================================
// SECTION: Function Gate
// ============================================================================

/// Gate delegating to a closure.
pub struct FnGate {
    function: Box<dyn FnMut(&PipelineRow) -> Result<RoutingAction, GateError>>,
    node_id: Option<NodeId>,
}

impl FnGate {
    /// Creates a gate from a closure.
    pub fn new(
        function: impl FnMut(&PipelineRow) -> Result<RoutingAction, GateError> + 'static,
    ) -> Self {
        Self {
            function: Box::new(function),
            node_id: None,
        }
    }
}

impl GatePlugin for FnGate {
    fn bind_node(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn node_id(&self) -> Option<&NodeId> {
        self.node_id.as_ref()
    }

    fn evaluate(
        &mut self,
        row: &PipelineRow,
        _ctx: &PluginContext<'_>,
    ) -> Result<RoutingAction, GateError> {
        (self.function)(row)
    }
}

/// Builds a gate step bound to a node id.
pub fn gate_step(
    node: &str,
    function: impl FnMut(&PipelineRow) -> Result<RoutingAction, GateError> + 'static,
) -> PipelineStep {
    PipelineStep {
        node_id: NodeId::new(node),
        body: elspeth_core::StepBody::Gate(Box::new(FnGate::new(function))),
    }
}

// ============================================================================
// SECTION: Run Bootstrap
// ============================================================================

/// Begins a run in a landscape with a fixed config hash.
pub fn begin_test_run(landscape: &dyn Landscape) -> elspeth_core::RunId {
    let config = RunConfig {
        config_hash: hash_canonical_json(DEFAULT_HASH_ALGORITHM, &json!({ "test": true }))
            .expect("config hash"),
        canonical_version: "1".to_string(),
        started_at: Timestamp::from_unix_millis(0),
    };
    landscape.begin_run(&config).expect("begin run").run_id
}

/// Admits one row with its initial token into a run.
pub fn admit(
    landscape: &dyn Landscape,
    run_id: elspeth_core::RunId,
    source_node: &str,
    row_index: u64,
) -> TokenCtx {
    let row_id = landscape
        .create_row(&NewRow {
            run_id,
            source_node_id: NodeId::new(source_node),
            row_index,
            source_data_hash: hash_bytes(DEFAULT_HASH_ALGORITHM, b"test"),
            source_data_ref: "test".to_string(),
            created_at: Timestamp::from_unix_millis(0),
        })
        .expect("create row");
    let token_id = landscape
        .create_token(row_id, None, None, Timestamp::from_unix_millis(0))
        .expect("create token");
    TokenCtx::initial(token_id, row_id, row_index)
}
