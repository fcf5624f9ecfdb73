// crates/elspeth-plugins/src/sink.rs
// ============================================================================
// Module: Built-in Sinks
// Description: CSV file sink with append support and an in-memory sink.
// Purpose: Provide the sink plugins used by the CLI and tests.
// Dependencies: elspeth-core, serde_json
// ============================================================================

//! ## Overview
//! The CSV sink writes a header once and confirms each durably-written
//! token through the write context; in append mode it reads the existing
//! header and extends the file rather than truncating it. The memory sink
//! collects writes for inspection and supports both modes.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use elspeth_core::ArtifactDescriptor;
use elspeth_core::NodeId;
use elspeth_core::SinkError;
use elspeth_core::SinkMode;
use elspeth_core::SinkPayload;
use elspeth_core::SinkPlugin;
use elspeth_core::SinkToken;
use elspeth_core::SinkWriteContext;
use elspeth_core::TokenId;
use serde_json::Value;

// ============================================================================
// SECTION: CSV Sink
// ============================================================================

/// CSV file sink with a header row.
///
/// # Invariants
/// - The header is written once; appends reuse the existing header's field
///   order.
/// - Tokens are confirmed written only after their line reaches the file.
pub struct CsvSink {
    /// Output file path.
    path: PathBuf,
    /// Header field order, once known.
    header: Option<Vec<String>>,
    /// Open mode, set at prepare.
    mode: Option<SinkMode>,
    /// Bytes written during this run.
    bytes_written: u64,
    /// Bound graph node.
    node_id: Option<NodeId>,
}

impl CsvSink {
    /// Creates a CSV sink writing to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            header: None,
            mode: None,
            bytes_written: 0,
            node_id: None,
        }
    }

    /// Renders one value as a CSV cell.
    fn render(value: &Value) -> String {
        match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }

    /// Renders one token payload as header fields and a data line.
    fn render_payload(payload: &SinkPayload) -> (Vec<String>, Vec<String>) {
        match payload {
            SinkPayload::Row(row) => {
                let mut names = Vec::with_capacity(row.len());
                let mut values = Vec::with_capacity(row.len());
                for (name, value) in row.fields() {
                    names.push(name.to_string());
                    values.push(Self::render(value));
                }
                (names, values)
            }
            SinkPayload::Quarantined(row) => (
                vec!["raw".to_string(), "error".to_string()],
                vec![row.raw.to_string(), row.error.clone()],
            ),
        }
    }
}

impl SinkPlugin for CsvSink {
    fn bind_node(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn node_id(&self) -> Option<&NodeId> {
        self.node_id.as_ref()
    }

    fn prepare(&mut self, mode: SinkMode) -> Result<(), SinkError> {
        if mode == SinkMode::Append && self.path.exists() {
            // Extend the existing output: adopt its header field order.
            let text =
                fs::read_to_string(&self.path).map_err(|err| SinkError::Io(err.to_string()))?;
            if let Some(header_line) = text.lines().next()
                && !header_line.is_empty()
            {
                self.header = Some(header_line.split(',').map(str::to_string).collect());
            }
        }
        self.mode = Some(mode);
        Ok(())
    }

    fn write(
        &mut self,
        tokens: &[SinkToken],
        ctx: &mut SinkWriteContext<'_>,
    ) -> Result<ArtifactDescriptor, SinkError> {
        let mode = self.mode.ok_or_else(|| {
            SinkError::Write("csv sink used before prepare".to_string())
        })?;
        let fresh = mode == SinkMode::Write && self.bytes_written == 0;
        let mut file = OpenOptions::new()
            .create(true)
            .append(!fresh)
            .write(true)
            .truncate(fresh)
            .open(&self.path)
            .map_err(|err| SinkError::Io(err.to_string()))?;
        for token in tokens {
            let (names, values) = Self::render_payload(&token.payload);
            if self.header.is_none() {
                let header_line = names.join(",");
                writeln!(file, "{header_line}").map_err(|err| SinkError::Io(err.to_string()))?;
                self.bytes_written += header_line.len() as u64 + 1;
                self.header = Some(names.clone());
            }
            let ordered = match &self.header {
                Some(header) => header
                    .iter()
                    .map(|name| {
                        names
                            .iter()
                            .position(|candidate| candidate == name)
                            .map_or_else(String::new, |index| values[index].clone())
                    })
                    .collect::<Vec<_>>(),
                None => values,
            };
            let line = ordered.join(",");
            writeln!(file, "{line}").map_err(|err| SinkError::Io(err.to_string()))?;
            self.bytes_written += line.len() as u64 + 1;
            ctx.token_written(token.token_id);
        }
        file.sync_all().map_err(|err| SinkError::Io(err.to_string()))?;
        Ok(ArtifactDescriptor {
            uri: self.path.display().to_string(),
            content_type: Some("text/csv".to_string()),
            bytes_written: Some(self.bytes_written),
        })
    }
}

// ============================================================================
// SECTION: Memory Sink
// ============================================================================

/// Records collected by a [`MemorySink`].
#[derive(Debug, Clone)]
pub struct MemorySinkRecord {
    /// Token that was written.
    pub token_id: TokenId,
    /// Payload as JSON.
    pub payload: Value,
}

/// Shared handle for inspecting a memory sink after the run.
#[derive(Debug, Clone, Default)]
pub struct MemorySinkHandle {
    /// Collected records.
    records: Arc<Mutex<Vec<MemorySinkRecord>>>,
}

impl MemorySinkHandle {
    /// Returns a snapshot of collected records in write order.
    #[must_use]
    pub fn records(&self) -> Vec<MemorySinkRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// In-memory sink collecting written payloads.
///
/// # Invariants
/// - Supports both write and append modes; append keeps prior records.
#[derive(Debug, Default)]
pub struct MemorySink {
    /// Shared record storage.
    handle: MemorySinkHandle,
    /// Bound graph node.
    node_id: Option<NodeId>,
}

impl MemorySink {
    /// Creates an empty memory sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle usable after the sink is moved into a pipeline.
    #[must_use]
    pub fn handle(&self) -> MemorySinkHandle {
        self.handle.clone()
    }
}

impl SinkPlugin for MemorySink {
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
        let mut records =
            self.handle.records.lock().unwrap_or_else(PoisonError::into_inner);
        for token in tokens {
            let payload = match &token.payload {
                SinkPayload::Row(row) => row.to_json(),
                SinkPayload::Quarantined(row) => serde_json::json!({
                    "raw": row.raw,
                    "error": row.error,
                }),
            };
            records.push(MemorySinkRecord {
                token_id: token.token_id,
                payload,
            });
            ctx.token_written(token.token_id);
        }
        Ok(ArtifactDescriptor {
            uri: "memory:".to_string(),
            content_type: Some("application/json".to_string()),
            bytes_written: None,
        })
    }
}
