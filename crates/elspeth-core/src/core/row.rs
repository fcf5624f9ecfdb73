// crates/elspeth-core/src/core/row.rs
// ============================================================================
// Module: Elspeth Pipeline Rows
// Description: In-process row representation with dual-name field access.
// Purpose: Carry row data through the DAG under a schema contract.
// Dependencies: indexmap, serde, serde_json
// ============================================================================

//! ## Overview
//! A [`PipelineRow`] is the in-process, non-persisted representation of a
//! row moving through the pipeline. Fields are ordered by the schema
//! contract and reachable under both their original (source) and normalized
//! (schema) names. Quarantined rows never become pipeline rows; they carry
//! no contract by construction.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Contract Mode
// ============================================================================

/// Schema contract mode declared by the source configuration.
///
/// # Invariants
/// - Variants are stable for serialization and checkpointing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractMode {
    /// All fields declared up front; unknown fields are invalid.
    Fixed,
    /// Declared fields plus inferred extras; locks after the first valid row.
    Flexible,
    /// Fully inferred from the first valid row; locks afterwards.
    Observed,
}

/// Origin of a field specification within a contract.
///
/// # Invariants
/// - Variants are stable for serialization and checkpointing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    /// Declared in the source configuration.
    Declared,
    /// Inferred from observed row data.
    Inferred,
}

/// Coarse value classification for contract fields.
///
/// # Invariants
/// - Variants are stable for serialization and checkpointing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// JSON string.
    String,
    /// JSON integer.
    Integer,
    /// JSON non-integer number.
    Float,
    /// JSON boolean.
    Boolean,
    /// JSON null.
    Null,
    /// JSON object.
    Object,
    /// JSON array.
    Array,
}

impl ValueKind {
    /// Classifies a JSON value.
    #[must_use]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => Self::String,
            Value::Number(number) => {
                if number.is_i64() || number.is_u64() {
                    Self::Integer
                } else {
                    Self::Float
                }
            }
            Value::Bool(_) => Self::Boolean,
            Value::Null => Self::Null,
            Value::Object(_) => Self::Object,
            Value::Array(_) => Self::Array,
        }
    }
}

// ============================================================================
// SECTION: Field Specification
// ============================================================================

/// One field within a schema contract.
///
/// # Invariants
/// - `normalized_name` is unique within the contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Normalized (schema) field name.
    pub normalized_name: String,
    /// Original (source) field name.
    pub original_name: String,
    /// Coarse value classification.
    pub value_kind: ValueKind,
    /// Whether the field must be present in every row.
    pub required: bool,
    /// Where the specification came from.
    pub source: FieldSource,
}

/// Normalizes an original field name into its schema form.
///
/// Lowercases ASCII letters and replaces every non-alphanumeric character
/// with an underscore.
#[must_use]
pub fn normalize_field_name(original: &str) -> String {
    original
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

// ============================================================================
// SECTION: Schema Contract
// ============================================================================

/// Schema contract errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum ContractError {
    /// A required field is missing from the row.
    #[error("required field missing: {0}")]
    MissingField(String),
    /// The row carries a field the fixed contract does not declare.
    #[error("undeclared field under fixed contract: {0}")]
    UndeclaredField(String),
    /// Two original names normalize to the same schema name.
    #[error("field name collision after normalization: {0}")]
    NameCollision(String),
    /// The contract is locked and cannot be mutated.
    #[error("schema contract is locked")]
    Locked,
}

/// Ordered schema contract propagated with tokens.
///
/// # Invariants
/// - Field order is stable and defines row field order.
/// - Once `locked`, the field set never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaContract {
    /// Contract mode.
    pub mode: ContractMode,
    /// Ordered field specifications.
    pub fields: Vec<FieldSpec>,
    /// Whether the field set is frozen.
    pub locked: bool,
}

impl SchemaContract {
    /// Creates an empty, unlocked contract in the provided mode.
    #[must_use]
    pub const fn new(mode: ContractMode) -> Self {
        Self {
            mode,
            fields: Vec::new(),
            locked: false,
        }
    }

    /// Creates a contract from declared fields.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::NameCollision`] when two declared fields
    /// normalize to the same schema name.
    pub fn with_declared_fields(
        mode: ContractMode,
        fields: Vec<FieldSpec>,
    ) -> Result<Self, ContractError> {
        let mut seen = BTreeMap::new();
        for field in &fields {
            if seen.insert(field.normalized_name.clone(), ()).is_some() {
                return Err(ContractError::NameCollision(field.normalized_name.clone()));
            }
        }
        Ok(Self {
            mode,
            fields,
            locked: matches!(mode, ContractMode::Fixed),
        })
    }

    /// Returns the field spec for a normalized name, if declared.
    #[must_use]
    pub fn field(&self, normalized_name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.normalized_name == normalized_name)
    }

    /// Observes a raw row, inferring undeclared fields when permitted, and
    /// locks the contract.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError`] when the row violates the contract or when
    /// the contract is already locked and the row introduces new fields
    /// under [`ContractMode::Fixed`].
    pub fn observe(&mut self, raw: &Map<String, Value>) -> Result<(), ContractError> {
        for (original, value) in raw {
            let normalized = normalize_field_name(original);
            if self.field(&normalized).is_some() {
                continue;
            }
            match self.mode {
                ContractMode::Fixed => {
                    return Err(ContractError::UndeclaredField(original.clone()));
                }
                ContractMode::Flexible | ContractMode::Observed => {
                    if self.locked {
                        return Err(ContractError::Locked);
                    }
                    self.fields.push(FieldSpec {
                        normalized_name: normalized,
                        original_name: original.clone(),
                        value_kind: ValueKind::of(value),
                        required: false,
                        source: FieldSource::Inferred,
                    });
                }
            }
        }
        self.locked = true;
        Ok(())
    }

    /// Builds a pipeline row from raw source data under this contract.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::MissingField`] when a required field is
    /// absent, or [`ContractError::UndeclaredField`] for unknown fields
    /// under [`ContractMode::Fixed`].
    pub fn build_row(&self, raw: &Map<String, Value>) -> Result<PipelineRow, ContractError> {
        let mut fields = IndexMap::with_capacity(self.fields.len());
        let mut aliases = BTreeMap::new();
        for spec in &self.fields {
            match raw.get(&spec.original_name).or_else(|| raw.get(&spec.normalized_name)) {
                Some(value) => {
                    fields.insert(spec.normalized_name.clone(), value.clone());
                    aliases.insert(spec.original_name.clone(), spec.normalized_name.clone());
                }
                None if spec.required => {
                    return Err(ContractError::MissingField(spec.normalized_name.clone()));
                }
                None => {}
            }
        }
        if matches!(self.mode, ContractMode::Fixed) {
            for original in raw.keys() {
                let normalized = normalize_field_name(original);
                if self.field(&normalized).is_none() {
                    return Err(ContractError::UndeclaredField(original.clone()));
                }
            }
        }
        Ok(PipelineRow {
            fields,
            aliases,
            contract: self.clone(),
        })
    }
}

// ============================================================================
// SECTION: Pipeline Row
// ============================================================================

/// In-process row moving through the DAG.
///
/// # Invariants
/// - Field order follows the schema contract.
/// - Every field is reachable by both its original and normalized name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRow {
    /// Field values keyed by normalized name, in contract order.
    fields: IndexMap<String, Value>,
    /// Original-name aliases mapping to normalized names.
    aliases: BTreeMap<String, String>,
    /// Contract the row was built under.
    contract: SchemaContract,
}

impl PipelineRow {
    /// Returns a field value by original or normalized name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        if let Some(value) = self.fields.get(name) {
            return Some(value);
        }
        self.aliases.get(name).and_then(|normalized| self.fields.get(normalized))
    }

    /// Sets a field value by original or normalized name, appending the
    /// field when it is new.
    pub fn set(&mut self, name: &str, value: Value) {
        let normalized = match self.aliases.get(name) {
            Some(normalized) => normalized.clone(),
            None if self.fields.contains_key(name) => name.to_string(),
            None => {
                let normalized = normalize_field_name(name);
                if name != normalized {
                    self.aliases.insert(name.to_string(), normalized.clone());
                }
                normalized
            }
        };
        self.fields.insert(normalized, value);
    }

    /// Removes a field by original or normalized name.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let normalized = self.aliases.get(name).cloned().unwrap_or_else(|| name.to_string());
        self.fields.shift_remove(&normalized)
    }

    /// Returns the row's schema contract.
    #[must_use]
    pub const fn contract(&self) -> &SchemaContract {
        &self.contract
    }

    /// Returns field values in contract order, keyed by normalized name.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Returns the number of fields present in the row.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` when the row has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serializes the row's fields as a JSON object keyed by normalized
    /// name, in contract order.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (name, value) in &self.fields {
            map.insert(name.clone(), value.clone());
        }
        Value::Object(map)
    }

    /// Merges fields from `other` into this row, keeping existing fields on
    /// name conflicts.
    pub fn merge_missing(&mut self, other: &Self) {
        for (name, value) in &other.fields {
            if !self.fields.contains_key(name) {
                self.fields.insert(name.clone(), value.clone());
            }
        }
        for (original, normalized) in &other.aliases {
            self.aliases.entry(original.clone()).or_insert_with(|| normalized.clone());
        }
    }
}

// ============================================================================
// SECTION: Quarantined Rows
// ============================================================================

/// A source row rejected before admission to the pipeline.
///
/// # Invariants
/// - Quarantined rows never carry a schema contract and cannot be converted
///   into a [`PipelineRow`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantinedRow {
    /// Raw row data as produced by the source.
    pub raw: Value,
    /// Human-readable validation error.
    pub error: String,
}
