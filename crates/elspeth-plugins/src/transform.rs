// crates/elspeth-plugins/src/transform.rs
// ============================================================================
// Module: Built-in Transforms
// Description: Field-level transforms and a batch-aware concatenation.
// Purpose: Provide the transform plugins used by the CLI and tests.
// Dependencies: elspeth-core, serde_json
// ============================================================================

//! ## Overview
//! These transforms cover the common field operations plus one batch-aware
//! plugin (`ConcatTransform`) exercising the aggregation path. All of them
//! are deterministic and side-effect free.

// ============================================================================
// SECTION: Imports
// ============================================================================

use elspeth_core::NodeId;
use elspeth_core::PipelineRow;
use elspeth_core::PluginContext;
use elspeth_core::TransformFailure;
use elspeth_core::TransformPlugin;
use elspeth_core::TransformResult;
use serde_json::Value;

// ============================================================================
// SECTION: Identity
// ============================================================================

/// Transform passing rows through unchanged.
#[derive(Debug, Default)]
pub struct IdentityTransform {
    /// Bound graph node.
    node_id: Option<NodeId>,
}

impl IdentityTransform {
    /// Creates an identity transform.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransformPlugin for IdentityTransform {
    fn bind_node(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn node_id(&self) -> Option<&NodeId> {
        self.node_id.as_ref()
    }

    fn process(&mut self, row: PipelineRow, _ctx: &PluginContext<'_>) -> TransformResult {
        TransformResult::Success(row)
    }
}

// ============================================================================
// SECTION: Set Field
// ============================================================================

/// Transform setting a field to a constant value.
#[derive(Debug)]
pub struct SetFieldTransform {
    /// Field name to set.
    name: String,
    /// Value to assign.
    value: Value,
    /// Bound graph node.
    node_id: Option<NodeId>,
}

impl SetFieldTransform {
    /// Creates a set-field transform.
    #[must_use]
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            node_id: None,
        }
    }
}

impl TransformPlugin for SetFieldTransform {
    fn bind_node(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn node_id(&self) -> Option<&NodeId> {
        self.node_id.as_ref()
    }

    fn process(&mut self, mut row: PipelineRow, _ctx: &PluginContext<'_>) -> TransformResult {
        row.set(&self.name, self.value.clone());
        TransformResult::Success(row)
    }
}

// ============================================================================
// SECTION: Rename
// ============================================================================

/// Transform renaming a field, preserving its value.
#[derive(Debug)]
pub struct RenameTransform {
    /// Existing field name.
    from: String,
    /// New field name.
    to: String,
    /// Bound graph node.
    node_id: Option<NodeId>,
}

impl RenameTransform {
    /// Creates a rename transform.
    #[must_use]
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            node_id: None,
        }
    }
}

impl TransformPlugin for RenameTransform {
    fn bind_node(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn node_id(&self) -> Option<&NodeId> {
        self.node_id.as_ref()
    }

    fn process(&mut self, mut row: PipelineRow, _ctx: &PluginContext<'_>) -> TransformResult {
        match row.remove(&self.from) {
            Some(value) => {
                row.set(&self.to, value);
                TransformResult::Success(row)
            }
            None => TransformResult::Error(TransformFailure {
                reason: format!("field '{}' not present", self.from),
                details: None,
            }),
        }
    }
}

// ============================================================================
// SECTION: Uppercase
// ============================================================================

/// Transform uppercasing a string field.
#[derive(Debug)]
pub struct UppercaseTransform {
    /// Field to uppercase.
    field: String,
    /// Bound graph node.
    node_id: Option<NodeId>,
}

impl UppercaseTransform {
    /// Creates an uppercase transform.
    #[must_use]
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            node_id: None,
        }
    }
}

impl TransformPlugin for UppercaseTransform {
    fn bind_node(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn node_id(&self) -> Option<&NodeId> {
        self.node_id.as_ref()
    }

    fn process(&mut self, mut row: PipelineRow, _ctx: &PluginContext<'_>) -> TransformResult {
        match row.get(&self.field) {
            Some(Value::String(text)) => {
                let upper = text.to_uppercase();
                row.set(&self.field, Value::String(upper));
                TransformResult::Success(row)
            }
            Some(_) => TransformResult::Error(TransformFailure {
                reason: format!("field '{}' is not a string", self.field),
                details: None,
            }),
            None => TransformResult::Error(TransformFailure {
                reason: format!("field '{}' not present", self.field),
                details: None,
            }),
        }
    }
}

// ============================================================================
// SECTION: Fail On
// ============================================================================

/// Transform failing rows whose field equals a configured value.
///
/// Used to exercise per-row error routing.
#[derive(Debug)]
pub struct FailOnTransform {
    /// Field to inspect.
    field: String,
    /// Value that triggers the failure.
    equals: Value,
    /// Bound graph node.
    node_id: Option<NodeId>,
}

impl FailOnTransform {
    /// Creates a fail-on transform.
    #[must_use]
    pub fn new(field: impl Into<String>, equals: Value) -> Self {
        Self {
            field: field.into(),
            equals,
            node_id: None,
        }
    }
}

impl TransformPlugin for FailOnTransform {
    fn bind_node(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn node_id(&self) -> Option<&NodeId> {
        self.node_id.as_ref()
    }

    fn process(&mut self, row: PipelineRow, _ctx: &PluginContext<'_>) -> TransformResult {
        if row.get(&self.field) == Some(&self.equals) {
            return TransformResult::Error(TransformFailure {
                reason: format!("field '{}' matched failure value", self.field),
                details: Some(self.equals.clone()),
            });
        }
        TransformResult::Success(row)
    }
}

// ============================================================================
// SECTION: Concat (batch-aware)
// ============================================================================

/// Batch-aware transform concatenating one field across the buffer into a
/// single output row.
#[derive(Debug)]
pub struct ConcatTransform {
    /// Field to concatenate.
    field: String,
    /// Separator between values.
    separator: String,
    /// Bound graph node.
    node_id: Option<NodeId>,
}

impl ConcatTransform {
    /// Creates a concat transform.
    #[must_use]
    pub fn new(field: impl Into<String>, separator: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            separator: separator.into(),
            node_id: None,
        }
    }

    /// Renders one value as text for concatenation.
    fn render(value: &Value) -> String {
        match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

impl TransformPlugin for ConcatTransform {
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
        let Some(first) = rows.first().cloned() else {
            return TransformResult::Error(TransformFailure {
                reason: "empty batch".to_string(),
                details: None,
            });
        };
        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            match row.get(&self.field) {
                Some(value) => values.push(Self::render(value)),
                None => {
                    return TransformResult::Error(TransformFailure {
                        reason: format!("field '{}' not present in batch row", self.field),
                        details: None,
                    });
                }
            }
        }
        let mut merged = first;
        merged.set(&self.field, Value::String(values.join(&self.separator)));
        TransformResult::Success(merged)
    }
}
