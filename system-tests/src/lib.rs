// system-tests/src/lib.rs
// ============================================================================
// Module: System Test Support
// Description: Shared sinks, sources, and builders for scenario tests.
// Purpose: Keep end-to-end scenarios focused on observable behavior.
// Dependencies: elspeth-core, elspeth-plugins, serde_json
// ============================================================================

//! ## Overview
//! Scenario helpers: a CSV sink that fails mid-batch after confirming a
//! configured number of tokens (crash-mid-sink scenarios), a source wrapper
//! that advances a manual clock partway through iteration (lazy-timeout
//! scenarios without sleeping), and registration builders shared across
//! runs so resume sees an identical topology.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use elspeth_core::ArtifactDescriptor;
use elspeth_core::ContractMode;
use elspeth_core::Determinism;
use elspeth_core::ManualClock;
use elspeth_core::NodeId;
use elspeth_core::NodeRegistration;
use elspeth_core::NodeType;
use elspeth_core::PluginContext;
use elspeth_core::PluginName;
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
use elspeth_core::hashing::DEFAULT_HASH_ALGORITHM;
use elspeth_core::hashing::hash_canonical_json;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;

// ============================================================================
// SECTION: Builders
// ============================================================================

/// Builds a node registration with a config hash derived from its id.
///
/// # Panics
///
/// Panics if the config fragment cannot be hashed (test-only helper).
#[must_use]
#[allow(clippy::missing_panics_doc, reason = "Test helper; hashing a literal cannot fail.")]
pub fn registration(node: &str, node_type: NodeType) -> NodeRegistration {
    #[allow(clippy::unwrap_used, reason = "Hashing a literal JSON object cannot fail.")]
    let config_hash =
        hash_canonical_json(DEFAULT_HASH_ALGORITHM, &json!({ "node": node })).unwrap();
    NodeRegistration {
        node_id: NodeId::new(node),
        plugin_name: PluginName::new(format!("scenario_{node}")),
        node_type,
        plugin_version: "0.0.0".to_string(),
        determinism: Determinism::Deterministic,
        config_hash,
        schema_config_json: None,
    }
}

/// Builds raw source data from JSON pairs.
#[must_use]
pub fn raw_from(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(name, value)| ((*name).to_string(), value.clone())).collect()
}

// ============================================================================
// SECTION: Failing CSV Sink
// ============================================================================

/// CSV sink that confirms a limited number of tokens and then fails.
///
/// # Invariants
/// - Tokens confirmed via the write context have reached the file before
///   the injected failure.
pub struct FailingCsvSink {
    /// Output file path.
    path: PathBuf,
    /// Number of tokens to write before the injected failure.
    fail_after: usize,
    /// Header written flag.
    header_written: bool,
    /// Bound graph node.
    node_id: Option<NodeId>,
}

impl FailingCsvSink {
    /// Creates a sink failing after `fail_after` confirmed tokens.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, fail_after: usize) -> Self {
        Self {
            path: path.into(),
            fail_after,
            header_written: false,
            node_id: None,
        }
    }
}

impl SinkPlugin for FailingCsvSink {
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
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| SinkError::Io(err.to_string()))?;
        for (index, token) in tokens.iter().enumerate() {
            if index >= self.fail_after {
                return Err(SinkError::Write("sink failure injected".to_string()));
            }
            let SinkPayload::Row(row) = &token.payload else {
                return Err(SinkError::Write("unexpected quarantined payload".to_string()));
            };
            if !self.header_written {
                let names: Vec<&str> = row.fields().map(|(name, _)| name).collect();
                writeln!(file, "{}", names.join(","))
                    .map_err(|err| SinkError::Io(err.to_string()))?;
                self.header_written = true;
            }
            let values: Vec<String> = row
                .fields()
                .map(|(_, value)| match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect();
            writeln!(file, "{}", values.join(","))
                .map_err(|err| SinkError::Io(err.to_string()))?;
            file.sync_all().map_err(|err| SinkError::Io(err.to_string()))?;
            ctx.token_written(token.token_id);
        }
        Ok(ArtifactDescriptor {
            uri: self.path.display().to_string(),
            content_type: Some("text/csv".to_string()),
            bytes_written: None,
        })
    }
}

// ============================================================================
// SECTION: Clock-Advancing Source
// ============================================================================

/// Inline source that advances a manual clock before a configured row.
///
/// Models an idle gap in arrivals without sleeping, so lazy aggregation
/// timeouts can be exercised deterministically.
pub struct PausingSource {
    /// Remaining rows to yield.
    rows: VecDeque<Map<String, Value>>,
    /// Zero-based index of the row before which the clock advances.
    pause_before_index: usize,
    /// Milliseconds to advance.
    pause_millis: i64,
    /// Rows yielded so far.
    yielded: usize,
    /// Shared manual clock.
    clock: Arc<ManualClock>,
    /// Current schema contract.
    contract: SchemaContract,
    /// Bound graph node.
    node_id: Option<NodeId>,
}

impl PausingSource {
    /// Creates a pausing source over raw rows.
    #[must_use]
    pub fn new(
        rows: Vec<Map<String, Value>>,
        pause_before_index: usize,
        pause_millis: i64,
        clock: Arc<ManualClock>,
    ) -> Self {
        Self {
            rows: rows.into(),
            pause_before_index,
            pause_millis,
            yielded: 0,
            clock,
            contract: SchemaContract::new(ContractMode::Observed),
            node_id: None,
        }
    }
}

impl SourcePlugin for PausingSource {
    fn bind_node(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn node_id(&self) -> Option<&NodeId> {
        self.node_id.as_ref()
    }

    fn next_row(&mut self, _ctx: &PluginContext<'_>) -> Option<Result<SourceRow, SourceError>> {
        let raw = self.rows.pop_front()?;
        if self.yielded == self.pause_before_index {
            self.clock.advance_millis(self.pause_millis);
        }
        self.yielded += 1;
        Some(Ok(SourceRow::Valid {
            raw,
            contract: None,
        }))
    }

    fn schema_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn set_schema_contract(&mut self, contract: SchemaContract) {
        self.contract = contract;
    }
}
