// crates/elspeth-plugins/src/source.rs
// ============================================================================
// Module: Built-in Sources
// Description: Inline and CSV sources yielding valid or quarantined rows.
// Purpose: Provide the source plugins used by the CLI and tests.
// Dependencies: elspeth-core, serde_json
// ============================================================================

//! ## Overview
//! Sources yield a lazy, finite sequence of rows. The CSV source reads a
//! header line and emits one JSON object per data line; malformed lines are
//! quarantined rather than dropped. Both sources expose and accept schema
//! contracts; the first valid row under an observed or flexible contract
//! locks it.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::VecDeque;
use std::fs;

use elspeth_core::ContractMode;
use elspeth_core::NodeId;
use elspeth_core::PluginContext;
use elspeth_core::QuarantinedRow;
use elspeth_core::SchemaContract;
use elspeth_core::SourceError;
use elspeth_core::SourcePlugin;
use elspeth_core::SourceRow;
use serde_json::Map;
use serde_json::Value;

// ============================================================================
// SECTION: Inline Source
// ============================================================================

/// Source yielding rows embedded in the settings document.
///
/// # Invariants
/// - Rows are yielded in declaration order.
pub struct InlineSource {
    /// Remaining rows to yield.
    rows: VecDeque<Map<String, Value>>,
    /// Current schema contract.
    contract: SchemaContract,
    /// Bound graph node.
    node_id: Option<NodeId>,
}

impl InlineSource {
    /// Creates an inline source over declared rows.
    #[must_use]
    pub fn new(rows: Vec<Map<String, Value>>, contract: SchemaContract) -> Self {
        Self {
            rows: rows.into(),
            contract,
            node_id: None,
        }
    }
}

impl SourcePlugin for InlineSource {
    fn bind_node(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn node_id(&self) -> Option<&NodeId> {
        self.node_id.as_ref()
    }

    fn next_row(&mut self, _ctx: &PluginContext<'_>) -> Option<Result<SourceRow, SourceError>> {
        self.rows.pop_front().map(|raw| {
            Ok(SourceRow::Valid {
                raw,
                contract: None,
            })
        })
    }

    fn schema_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn set_schema_contract(&mut self, contract: SchemaContract) {
        self.contract = contract;
    }
}

// ============================================================================
// SECTION: CSV Source
// ============================================================================

/// Source reading a delimiter-separated file with a header line.
///
/// # Invariants
/// - The header is read once at open; data lines with a mismatched field
///   count are quarantined, not dropped.
pub struct CsvSource {
    /// Path to the file.
    path: String,
    /// Field delimiter.
    delimiter: char,
    /// Parsed header and remaining data lines, populated at open.
    parsed: Option<(Vec<String>, VecDeque<String>)>,
    /// Current schema contract.
    contract: SchemaContract,
    /// Bound graph node.
    node_id: Option<NodeId>,
}

impl CsvSource {
    /// Creates a CSV source over a file path.
    #[must_use]
    pub fn new(path: impl Into<String>, delimiter: char, mode: ContractMode) -> Self {
        Self {
            path: path.into(),
            delimiter,
            parsed: None,
            contract: SchemaContract::new(mode),
            node_id: None,
        }
    }

    /// Parses one data line against the header.
    fn parse_line(&self, header: &[String], line: &str) -> Result<Map<String, Value>, String> {
        let values: Vec<&str> = line.split(self.delimiter).collect();
        if values.len() != header.len() {
            return Err(format!(
                "expected {} fields, found {}",
                header.len(),
                values.len()
            ));
        }
        let mut raw = Map::new();
        for (name, value) in header.iter().zip(values) {
            // Numeric-looking values stay typed; everything else is a string.
            let parsed = value
                .parse::<i64>()
                .map(Value::from)
                .or_else(|_| value.parse::<f64>().map(Value::from))
                .unwrap_or_else(|_| Value::String(value.to_string()));
            raw.insert(name.clone(), parsed);
        }
        Ok(raw)
    }
}

impl SourcePlugin for CsvSource {
    fn bind_node(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn node_id(&self) -> Option<&NodeId> {
        self.node_id.as_ref()
    }

    fn open(&mut self, _ctx: &PluginContext<'_>) -> Result<(), SourceError> {
        let text =
            fs::read_to_string(&self.path).map_err(|err| SourceError::Io(err.to_string()))?;
        let mut lines = text.lines();
        let header_line = lines
            .next()
            .ok_or_else(|| SourceError::Parse(format!("{}: missing header line", self.path)))?;
        let header: Vec<String> =
            header_line.split(self.delimiter).map(str::to_string).collect();
        let data: VecDeque<String> =
            lines.filter(|line| !line.is_empty()).map(str::to_string).collect();
        self.parsed = Some((header, data));
        Ok(())
    }

    fn next_row(&mut self, _ctx: &PluginContext<'_>) -> Option<Result<SourceRow, SourceError>> {
        let (header, data) = self.parsed.as_mut()?;
        let line = data.pop_front()?;
        let header = header.clone();
        match self.parse_line(&header, &line) {
            Ok(raw) => Some(Ok(SourceRow::Valid {
                raw,
                contract: None,
            })),
            Err(error) => Some(Ok(SourceRow::Quarantined {
                row: QuarantinedRow {
                    raw: Value::String(line),
                    error,
                },
                destination: None,
            })),
        }
    }

    fn schema_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn set_schema_contract(&mut self, contract: SchemaContract) {
        self.contract = contract;
    }
}
