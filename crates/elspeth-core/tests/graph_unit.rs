// crates/elspeth-core/tests/graph_unit.rs
// ============================================================================
// Module: Execution Graph Tests
// Description: Topological order, cycle rejection, routes, topology hash.
// ============================================================================
//! ## Overview
//! Verifies graph construction invariants: acyclicity enforced at build,
//! topological tie-breaks, route resolution, route-plan validation before
//! any row, and topology-hash sensitivity to every node and edge.

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
    reason = "Test-only output and panic-based assertions are permitted."
)]

mod common;

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use common::registration;
use elspeth_core::ErrorSinkTarget;
use elspeth_core::ExecutionGraphBuilder;
use elspeth_core::GraphError;
use elspeth_core::NodeId;
use elspeth_core::NodeType;
use elspeth_core::RouteDestination;
use elspeth_core::RouteLabel;
use elspeth_core::RoutePlan;
use elspeth_core::RouteValidationError;
use elspeth_core::SinkName;
use elspeth_core::validate_route_plan;

/// Builds the linear graph `src -> t1 -> g1 -> out` plus an `err` sink.
fn sample_builder() -> ExecutionGraphBuilder {
    let mut builder = ExecutionGraphBuilder::new();
    builder.add_node(registration("src", NodeType::Source)).expect("src");
    builder.add_node(registration("t1", NodeType::Transform)).expect("t1");
    builder.add_node(registration("g1", NodeType::Gate)).expect("g1");
    builder.add_node(registration("out", NodeType::Sink)).expect("out");
    builder.add_node(registration("err", NodeType::Sink)).expect("err");
    builder
        .add_edge(NodeId::new("src"), NodeId::new("t1"), RouteLabel::new("continue"))
        .expect("edge");
    builder
        .add_edge(NodeId::new("t1"), NodeId::new("g1"), RouteLabel::new("continue"))
        .expect("edge");
    builder
        .add_edge(NodeId::new("g1"), NodeId::new("out"), RouteLabel::new("continue"))
        .expect("edge");
    builder
        .add_edge(NodeId::new("g1"), NodeId::new("err"), RouteLabel::new("reject"))
        .expect("edge");
    builder
}

#[test]
fn topological_order_respects_edges_and_tie_breaks() {
    let graph = sample_builder().build().expect("graph");
    let order = graph.topological_order();
    let position = |node: &str| {
        order.iter().position(|candidate| candidate.as_str() == node).expect("node in order")
    };
    assert!(position("src") < position("t1"));
    assert!(position("t1") < position("g1"));
    assert!(position("g1") < position("out"));
    assert!(position("g1") < position("err"));
    // Sinks tie-break lexicographically.
    assert!(position("err") < position("out"));
}

#[test]
fn cycles_are_rejected_at_build() {
    let mut builder = ExecutionGraphBuilder::new();
    builder.add_node(registration("a", NodeType::Transform)).expect("a");
    builder.add_node(registration("b", NodeType::Transform)).expect("b");
    builder.add_node(registration("src", NodeType::Source)).expect("src");
    builder.add_node(registration("out", NodeType::Sink)).expect("out");
    builder
        .add_edge(NodeId::new("src"), NodeId::new("a"), RouteLabel::new("continue"))
        .expect("edge");
    builder
        .add_edge(NodeId::new("a"), NodeId::new("b"), RouteLabel::new("continue"))
        .expect("edge");
    builder
        .add_edge(NodeId::new("b"), NodeId::new("a"), RouteLabel::new("continue"))
        .expect("edge");
    builder
        .add_edge(NodeId::new("b"), NodeId::new("out"), RouteLabel::new("continue"))
        .expect("edge");
    assert!(matches!(builder.build(), Err(GraphError::Cycle(_))));
}

#[test]
fn duplicate_nodes_are_rejected() {
    let mut builder = ExecutionGraphBuilder::new();
    builder.add_node(registration("src", NodeType::Source)).expect("first");
    assert!(matches!(
        builder.add_node(registration("src", NodeType::Source)),
        Err(GraphError::DuplicateNode(_))
    ));
}

#[test]
fn dangling_nodes_are_rejected() {
    let mut builder = ExecutionGraphBuilder::new();
    builder.add_node(registration("src", NodeType::Source)).expect("src");
    builder.add_node(registration("out", NodeType::Sink)).expect("out");
    builder.add_node(registration("floating", NodeType::Transform)).expect("floating");
    builder
        .add_edge(NodeId::new("src"), NodeId::new("out"), RouteLabel::new("continue"))
        .expect("edge");
    assert!(matches!(builder.build(), Err(GraphError::MissingIncoming(node)) if node == "floating"));
}

#[test]
fn route_resolution_map_covers_gate_edges() {
    let graph = sample_builder().build().expect("graph");
    let routes = graph.route_resolution_map();
    assert_eq!(
        routes.get(&(NodeId::new("g1"), RouteLabel::new("continue"))),
        Some(&RouteDestination::Continue)
    );
    assert_eq!(
        routes.get(&(NodeId::new("g1"), RouteLabel::new("reject"))),
        Some(&RouteDestination::Sink(SinkName::new("err")))
    );
}

#[test]
fn maps_expose_transforms_sinks_and_gates() {
    let graph = sample_builder().build().expect("graph");
    assert_eq!(graph.transform_id_map(), vec![NodeId::new("t1")]);
    assert_eq!(graph.sink_id_map().len(), 2);
    assert!(graph.config_gate_id_map().contains_key("g1"));
}

#[test]
fn topology_hash_changes_with_nodes_and_edges() {
    let base = sample_builder().build().expect("graph");
    let base_hash = base.compute_full_topology_hash().expect("hash");

    // Same construction hashes identically.
    let again = sample_builder().build().expect("graph");
    assert_eq!(again.compute_full_topology_hash().expect("hash"), base_hash);

    // An added transform changes the hash.
    let mut builder = sample_builder();
    builder.add_node(registration("t2", NodeType::Transform)).expect("t2");
    builder
        .add_edge(NodeId::new("t1"), NodeId::new("t2"), RouteLabel::new("continue"))
        .expect("edge");
    builder
        .add_edge(NodeId::new("t2"), NodeId::new("out"), RouteLabel::new("continue"))
        .expect("edge");
    let grown = builder.build().expect("graph");
    assert_ne!(grown.compute_full_topology_hash().expect("hash"), base_hash);

    // A changed edge label alone changes the hash.
    let mut builder = ExecutionGraphBuilder::new();
    builder.add_node(registration("src", NodeType::Source)).expect("src");
    builder.add_node(registration("t1", NodeType::Transform)).expect("t1");
    builder.add_node(registration("g1", NodeType::Gate)).expect("g1");
    builder.add_node(registration("out", NodeType::Sink)).expect("out");
    builder.add_node(registration("err", NodeType::Sink)).expect("err");
    builder
        .add_edge(NodeId::new("src"), NodeId::new("t1"), RouteLabel::new("continue"))
        .expect("edge");
    builder
        .add_edge(NodeId::new("t1"), NodeId::new("g1"), RouteLabel::new("continue"))
        .expect("edge");
    builder
        .add_edge(NodeId::new("g1"), NodeId::new("out"), RouteLabel::new("continue"))
        .expect("edge");
    builder
        .add_edge(NodeId::new("g1"), NodeId::new("err"), RouteLabel::new("overflow"))
        .expect("edge");
    let relabeled = builder.build().expect("graph");
    assert_ne!(relabeled.compute_full_topology_hash().expect("hash"), base_hash);
}

#[test]
fn route_plan_rejects_unknown_gate_destination() {
    let mut plan = RoutePlan::default();
    let mut routes = BTreeMap::new();
    routes.insert(
        RouteLabel::new("reject"),
        RouteDestination::Sink(SinkName::new("nowhere")),
    );
    plan.gate_routes.insert(NodeId::new("g1"), routes);
    let sinks: BTreeSet<SinkName> = [SinkName::new("out")].into_iter().collect();
    let error = validate_route_plan(&plan, &[NodeId::new("g1")], &sinks).unwrap_err();
    assert!(matches!(
        error,
        RouteValidationError::UnknownGateDestination { gate, destination, .. }
            if gate == "g1" && destination == "nowhere"
    ));
}

#[test]
fn route_plan_rejects_unknown_error_sink_and_quarantine() {
    let mut plan = RoutePlan::default();
    plan.transform_error_sinks
        .insert(NodeId::new("t1"), ErrorSinkTarget::Sink(SinkName::new("missing")));
    let sinks: BTreeSet<SinkName> = [SinkName::new("out")].into_iter().collect();
    assert!(matches!(
        validate_route_plan(&plan, &[], &sinks),
        Err(RouteValidationError::UnknownErrorSink { .. })
    ));

    let plan = RoutePlan {
        source_quarantine: Some(ErrorSinkTarget::Sink(SinkName::new("missing"))),
        ..RoutePlan::default()
    };
    assert!(matches!(
        validate_route_plan(&plan, &[], &sinks),
        Err(RouteValidationError::UnknownQuarantineSink { .. })
    ));
}

#[test]
fn duplicate_gate_names_are_rejected() {
    let plan = RoutePlan::default();
    let sinks: BTreeSet<SinkName> = [SinkName::new("out")].into_iter().collect();
    let gates = [NodeId::new("g1"), NodeId::new("g1")];
    assert!(matches!(
        validate_route_plan(&plan, &gates, &sinks),
        Err(RouteValidationError::DuplicateGate { gate }) if gate == "g1"
    ));
}

#[test]
fn discard_targets_validate_without_sinks() {
    let plan = RoutePlan {
        source_quarantine: Some(ErrorSinkTarget::Discard),
        ..RoutePlan::default()
    };
    let sinks: BTreeSet<SinkName> = BTreeSet::new();
    assert!(validate_route_plan(&plan, &[], &sinks).is_ok());
}
