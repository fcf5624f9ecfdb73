// crates/elspeth-plugins/src/gate.rs
// ============================================================================
// Module: Built-in Gates
// Description: Equality routing and unconditional fork gates.
// Purpose: Provide the gate plugins used by the CLI and tests.
// Dependencies: elspeth-core
// ============================================================================

//! ## Overview
//! Gates return [`RoutingAction`] variants; comparisons against row values
//! are structural. Route labels emitted here are resolved against the
//! declared route plan, which was validated before the first row.

// ============================================================================
// SECTION: Imports
// ============================================================================

use elspeth_core::BranchName;
use elspeth_core::ForkDestination;
use elspeth_core::ForkPath;
use elspeth_core::GateError;
use elspeth_core::GatePlugin;
use elspeth_core::NodeId;
use elspeth_core::PipelineRow;
use elspeth_core::PluginContext;
use elspeth_core::RoutingAction;
use elspeth_core::SinkName;
use serde_json::Value;

// ============================================================================
// SECTION: Route On Equals
// ============================================================================

/// Gate routing rows whose field equals a value to a named sink.
#[derive(Debug)]
pub struct RouteOnEqualsGate {
    /// Field to inspect.
    field: String,
    /// Value that triggers the route.
    equals: Value,
    /// Sink the matching rows are routed to.
    destination: SinkName,
    /// Bound graph node.
    node_id: Option<NodeId>,
}

impl RouteOnEqualsGate {
    /// Creates an equality routing gate.
    #[must_use]
    pub fn new(field: impl Into<String>, equals: Value, destination: SinkName) -> Self {
        Self {
            field: field.into(),
            equals,
            destination,
            node_id: None,
        }
    }
}

impl GatePlugin for RouteOnEqualsGate {
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
        if row.get(&self.field) == Some(&self.equals) {
            return Ok(RoutingAction::Route(self.destination.clone()));
        }
        Ok(RoutingAction::Continue)
    }
}

// ============================================================================
// SECTION: Fork All
// ============================================================================

/// Gate forking every row into the declared branch paths.
#[derive(Debug)]
pub struct ForkAllGate {
    /// Declared fork paths.
    paths: Vec<ForkPath>,
    /// Bound graph node.
    node_id: Option<NodeId>,
}

impl ForkAllGate {
    /// Creates a fork gate over `(branch, destination)` pairs, where a
    /// `None` destination continues along the main path.
    #[must_use]
    pub fn new(branches: Vec<(BranchName, Option<SinkName>)>) -> Self {
        let paths = branches
            .into_iter()
            .map(|(branch, sink)| ForkPath {
                branch,
                destination: sink.map_or(ForkDestination::Continue, ForkDestination::Sink),
            })
            .collect();
        Self {
            paths,
            node_id: None,
        }
    }
}

impl GatePlugin for ForkAllGate {
    fn bind_node(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn node_id(&self) -> Option<&NodeId> {
        self.node_id.as_ref()
    }

    fn evaluate(
        &mut self,
        _row: &PipelineRow,
        _ctx: &PluginContext<'_>,
    ) -> Result<RoutingAction, GateError> {
        Ok(RoutingAction::ForkToPaths(self.paths.clone()))
    }
}
