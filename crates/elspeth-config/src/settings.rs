// crates/elspeth-config/src/settings.rs
// ============================================================================
// Module: Elspeth Pipeline Settings
// Description: Typed, closed settings for sources, steps, and sinks.
// Purpose: Replace dynamic configuration maps with validated sum types.
// Dependencies: elspeth-core, serde, serde_json
// ============================================================================

//! ## Overview
//! Every plugin family has a closed, tagged options enum validated at
//! deserialization. Unknown fields and unknown kinds are rejected, so a
//! configuration either produces a fully-typed pipeline or a load error
//! naming the offender, never a half-understood run.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use elspeth_core::ContractMode;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

// ============================================================================
// SECTION: Pipeline Settings
// ============================================================================

/// Root pipeline settings document.
///
/// # Invariants
/// - `default_sink` names an entry in `sinks`.
/// - Step node identifiers are unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSettings {
    /// Source settings.
    pub source: SourceSettings,
    /// Ordered step settings.
    #[serde(default)]
    pub steps: Vec<StepSettings>,
    /// Sink settings keyed by sink name.
    pub sinks: BTreeMap<String, SinkSettings>,
    /// Sink receiving main-path completions.
    pub default_sink: String,
    /// Retry tuning.
    #[serde(default)]
    pub retry: RetrySettings,
    /// Landscape store location.
    pub landscape: LandscapeSettings,
    /// Payload store location.
    pub payload: PayloadSettings,
}

/// Landscape store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LandscapeSettings {
    /// Path to the SQLite database file.
    pub path: String,
}

/// Payload store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PayloadSettings {
    /// Root directory of the content-addressed store.
    pub dir: String,
}

/// Retry settings applied to capacity-exhausted transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    /// Maximum attempts including the initial call.
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single backoff delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

// ============================================================================
// SECTION: Source Settings
// ============================================================================

/// Source settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSettings {
    /// Source node identifier.
    pub node: String,
    /// Source plugin options.
    pub options: SourceOptions,
    /// Schema contract declaration.
    #[serde(default)]
    pub contract: ContractSettings,
    /// Quarantine destination: a sink name or `discard`.
    #[serde(default = "default_discard")]
    pub on_validation_failure: String,
}

/// Returns the reserved `discard` destination.
fn default_discard() -> String {
    "discard".to_string()
}

/// Closed source plugin options.
///
/// # Invariants
/// - Variants are exhaustive; unknown kinds fail deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceOptions {
    /// Inline rows embedded in the settings.
    Inline {
        /// Rows as JSON objects keyed by original field names.
        rows: Vec<Map<String, Value>>,
    },
    /// CSV file with a header row.
    Csv {
        /// Path to the CSV file.
        path: String,
        /// Field delimiter (single ASCII character).
        #[serde(default = "default_delimiter")]
        delimiter: char,
    },
}

/// Returns the default CSV delimiter.
const fn default_delimiter() -> char {
    ','
}

/// Schema contract declaration for the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContractSettings {
    /// Contract mode.
    pub mode: ContractModeSetting,
    /// Declared fields.
    #[serde(default)]
    pub fields: Vec<FieldSetting>,
}

impl Default for ContractSettings {
    fn default() -> Self {
        Self {
            mode: ContractModeSetting::Observed,
            fields: Vec::new(),
        }
    }
}

/// Contract mode as declared in settings.
///
/// # Invariants
/// - Maps 1:1 onto [`ContractMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractModeSetting {
    /// All fields declared up front.
    Fixed,
    /// Declared fields plus inferred extras.
    Flexible,
    /// Fully inferred from the first valid row.
    Observed,
}

impl From<ContractModeSetting> for ContractMode {
    fn from(value: ContractModeSetting) -> Self {
        match value {
            ContractModeSetting::Fixed => Self::Fixed,
            ContractModeSetting::Flexible => Self::Flexible,
            ContractModeSetting::Observed => Self::Observed,
        }
    }
}

/// One declared contract field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSetting {
    /// Original (source) field name.
    pub name: String,
    /// Whether the field must be present in every row.
    #[serde(default)]
    pub required: bool,
}

// ============================================================================
// SECTION: Step Settings
// ============================================================================

/// Closed step settings.
///
/// # Invariants
/// - Variants are exhaustive; unknown kinds fail deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepSettings {
    /// Row transform step.
    Transform {
        /// Step node identifier.
        node: String,
        /// Transform plugin options.
        plugin: TransformOptions,
        /// Error destination: a sink name or `discard`.
        #[serde(default = "default_discard")]
        on_error: String,
    },
    /// Routing gate step.
    Gate {
        /// Step node identifier.
        node: String,
        /// Gate plugin options.
        plugin: GateOptions,
        /// Declared route destinations keyed by route label. Destinations
        /// are a sink name or the reserved `continue` / `fork`.
        #[serde(default)]
        routes: BTreeMap<String, String>,
        /// Error destination: a sink name or `discard`.
        #[serde(default = "default_discard")]
        on_error: String,
    },
    /// Buffering aggregation step.
    Aggregation {
        /// Step node identifier.
        node: String,
        /// Output mode.
        output_mode: OutputModeSetting,
        /// Flush triggers.
        trigger: TriggerSettings,
        /// Batch transform options (required unless passthrough).
        #[serde(default)]
        plugin: Option<TransformOptions>,
        /// Error destination: a sink name or `discard`.
        #[serde(default = "default_discard")]
        on_error: String,
    },
    /// Branch coalesce step.
    Coalesce {
        /// Step node identifier.
        node: String,
        /// Branch names awaited, in merge order.
        branches: Vec<String>,
    },
}

impl StepSettings {
    /// Returns the step's node identifier.
    #[must_use]
    pub fn node(&self) -> &str {
        match self {
            Self::Transform {
                node, ..
            }
            | Self::Gate {
                node, ..
            }
            | Self::Aggregation {
                node, ..
            }
            | Self::Coalesce {
                node, ..
            } => node,
        }
    }
}

/// Aggregation output mode as declared in settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputModeSetting {
    /// One output row per batch.
    Single,
    /// Batch transform emits new rows.
    Transform,
    /// Inputs released unchanged.
    Passthrough,
}

/// Aggregation flush triggers as declared in settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerSettings {
    /// Flush when this many rows are buffered.
    #[serde(default)]
    pub count: Option<usize>,
    /// Lazy wall-clock timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<i64>,
}

/// Closed transform plugin options.
///
/// # Invariants
/// - Variants are exhaustive; unknown kinds fail deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformOptions {
    /// Pass rows through unchanged.
    Identity,
    /// Set a field to a constant value.
    SetField {
        /// Field name (original or normalized).
        name: String,
        /// Value to set.
        value: Value,
    },
    /// Rename a field.
    Rename {
        /// Existing field name.
        from: String,
        /// New field name.
        to: String,
    },
    /// Uppercase a string field.
    Uppercase {
        /// Field to uppercase.
        field: String,
    },
    /// Fail rows whose field equals a value.
    FailOn {
        /// Field to inspect.
        field: String,
        /// Value that triggers the failure.
        equals: Value,
    },
    /// Batch-aware concatenation of a field across the buffer.
    Concat {
        /// Field to concatenate.
        field: String,
        /// Separator between values.
        #[serde(default = "default_separator")]
        separator: String,
    },
}

/// Returns the default concatenation separator.
fn default_separator() -> String {
    ",".to_string()
}

/// Closed gate plugin options.
///
/// # Invariants
/// - Variants are exhaustive; unknown kinds fail deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateOptions {
    /// Emit a route label when a field equals a value, else continue.
    RouteOnEquals {
        /// Field to inspect.
        field: String,
        /// Value that triggers the route.
        equals: Value,
        /// Route label to emit.
        route: String,
    },
    /// Fork every row into the declared branches.
    ForkAll {
        /// Branch declarations.
        branches: Vec<BranchSetting>,
    },
}

/// One declared fork branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BranchSetting {
    /// Branch name assigned to the child token.
    pub branch: String,
    /// Destination: `continue` or a sink name.
    #[serde(default = "default_continue")]
    pub destination: String,
}

/// Returns the reserved `continue` destination.
fn default_continue() -> String {
    "continue".to_string()
}

// ============================================================================
// SECTION: Sink Settings
// ============================================================================

/// Sink settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkSettings {
    /// Sink plugin options.
    pub options: SinkOptions,
}

/// Closed sink plugin options.
///
/// # Invariants
/// - Variants are exhaustive; unknown kinds fail deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkOptions {
    /// CSV file sink with a header row. Supports append mode.
    Csv {
        /// Path to the output file.
        path: String,
    },
    /// In-memory sink for tests and dry runs. Write mode only.
    Memory,
}
