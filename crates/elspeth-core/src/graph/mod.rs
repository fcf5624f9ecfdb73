// crates/elspeth-core/src/graph/mod.rs
// ============================================================================
// Module: Elspeth Execution Graph
// Description: Immutable DAG of sources, transforms, gates, and sinks.
// Purpose: Resolve routes, order nodes, and hash the topology for resume locks.
// Dependencies: crate::core::{hashing, identifiers, outcome}, serde, thiserror
// ============================================================================

//! ## Overview
//! The execution graph is constructed once from configuration and never
//! mutated afterwards. Acyclicity is enforced at construction, not defended
//! at runtime. The canonical topology hash covers every node (including its
//! config hash and determinism) and every labeled edge; resume refuses any
//! run whose stored hash differs from the current graph's.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Serialize;
use thiserror::Error;

use crate::core::hashing::DEFAULT_HASH_ALGORITHM;
use crate::core::hashing::HashDigest;
use crate::core::hashing::hash_canonical_json;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::RouteLabel;
use crate::core::identifiers::SinkName;
use crate::core::outcome::NodeRegistration;
use crate::core::outcome::NodeType;

// ============================================================================
// SECTION: Reserved Labels
// ============================================================================

/// Reserved route label continuing along the main path.
pub const ROUTE_CONTINUE: &str = "continue";
/// Reserved route label forking into branch paths.
pub const ROUTE_FORK: &str = "fork";
/// Reserved error destination discarding the token.
pub const ROUTE_DISCARD: &str = "discard";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Graph construction errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A node identifier was registered twice.
    #[error("duplicate node: {0}")]
    DuplicateNode(String),
    /// An edge references an unregistered node.
    #[error("unknown node in edge: {0}")]
    UnknownNode(String),
    /// The graph contains a cycle.
    #[error("graph contains a cycle through: {0}")]
    Cycle(String),
    /// A non-source node has no incoming edge.
    #[error("node has no incoming edge: {0}")]
    MissingIncoming(String),
    /// A non-sink node has no outgoing edge.
    #[error("node has no outgoing edge: {0}")]
    MissingOutgoing(String),
    /// The topology could not be canonicalized for hashing.
    #[error("topology hash failed: {0}")]
    Canonicalization(String),
}

/// Route validation errors raised before the first row is admitted.
///
/// # Invariants
/// - Variants name the offending node and the available sinks.
#[derive(Debug, Error)]
pub enum RouteValidationError {
    /// A gate route references a destination that is not a sink or a
    /// reserved label.
    #[error(
        "gate '{gate}' routes '{route}' to unknown destination '{destination}' (available sinks: \
         {available})"
    )]
    UnknownGateDestination {
        /// Offending gate node.
        gate: String,
        /// Route label being resolved.
        route: String,
        /// The unresolvable destination.
        destination: String,
        /// Comma-separated available sink names.
        available: String,
    },
    /// A transform `on_error` references a sink that does not exist.
    #[error(
        "transform '{transform}' on_error references unknown sink '{destination}' (available \
         sinks: {available})"
    )]
    UnknownErrorSink {
        /// Offending transform node.
        transform: String,
        /// The unresolvable destination.
        destination: String,
        /// Comma-separated available sink names.
        available: String,
    },
    /// The source `on_validation_failure` references a sink that does not
    /// exist.
    #[error(
        "source on_validation_failure references unknown sink '{destination}' (available sinks: \
         {available})"
    )]
    UnknownQuarantineSink {
        /// The unresolvable destination.
        destination: String,
        /// Comma-separated available sink names.
        available: String,
    },
    /// Two gates share the same name.
    #[error("duplicate gate name: {gate}")]
    DuplicateGate {
        /// The duplicated gate name.
        gate: String,
    },
}

// ============================================================================
// SECTION: Route Destinations
// ============================================================================

/// Resolved destination of a gate route.
///
/// # Invariants
/// - Variants are stable and exhaustive; comparisons use enum identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDestination {
    /// Continue along the main path.
    Continue,
    /// Fork into branch paths.
    Fork,
    /// Route to a named sink.
    Sink(SinkName),
}

/// Destination for error and quarantine routing.
///
/// # Invariants
/// - Variants are stable and exhaustive; comparisons use enum identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSinkTarget {
    /// Route the failed token to a named sink.
    Sink(SinkName),
    /// Drop the failed token (outcome recorded with no sink).
    Discard,
}

/// Declared route plan extracted from configuration.
///
/// # Invariants
/// - Gate routes and error sinks reference nodes by their graph identifiers.
#[derive(Debug, Clone, Default)]
pub struct RoutePlan {
    /// Per-gate route destinations keyed by route label.
    pub gate_routes: BTreeMap<NodeId, BTreeMap<RouteLabel, RouteDestination>>,
    /// Per-transform error destinations.
    pub transform_error_sinks: BTreeMap<NodeId, ErrorSinkTarget>,
    /// Source quarantine destination.
    pub source_quarantine: Option<ErrorSinkTarget>,
}

// ============================================================================
// SECTION: Graph Builder
// ============================================================================

/// Internal labeled edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct GraphEdge {
    /// Origin node.
    from: NodeId,
    /// Destination node.
    to: NodeId,
    /// Route label.
    label: RouteLabel,
}

/// Builder for an immutable [`ExecutionGraph`].
#[derive(Debug, Default)]
pub struct ExecutionGraphBuilder {
    /// Registered nodes keyed by identifier.
    nodes: BTreeMap<NodeId, NodeRegistration>,
    /// Registered edges in insertion order.
    edges: Vec<GraphEdge>,
}

impl ExecutionGraphBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateNode`] when the identifier is taken.
    pub fn add_node(&mut self, registration: NodeRegistration) -> Result<(), GraphError> {
        let node_id = registration.node_id.clone();
        if self.nodes.insert(node_id.clone(), registration).is_some() {
            return Err(GraphError::DuplicateNode(node_id.as_str().to_string()));
        }
        Ok(())
    }

    /// Registers a labeled edge between two nodes.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownNode`] when either endpoint is not
    /// registered.
    pub fn add_edge(
        &mut self,
        from: NodeId,
        to: NodeId,
        label: RouteLabel,
    ) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&from) {
            return Err(GraphError::UnknownNode(from.as_str().to_string()));
        }
        if !self.nodes.contains_key(&to) {
            return Err(GraphError::UnknownNode(to.as_str().to_string()));
        }
        self.edges.push(GraphEdge {
            from,
            to,
            label,
        });
        Ok(())
    }

    /// Finalizes the graph, enforcing acyclicity and edge coverage.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError`] when the graph is cyclic or a node is missing
    /// required incoming/outgoing edges.
    pub fn build(self) -> Result<ExecutionGraph, GraphError> {
        let graph = ExecutionGraph {
            nodes: self.nodes,
            edges: self.edges,
        };
        graph.validate_shape()?;
        Ok(graph)
    }
}

// ============================================================================
// SECTION: Execution Graph
// ============================================================================

/// Immutable DAG of pipeline nodes.
///
/// # Invariants
/// - Acyclic by construction.
/// - Never mutated after `build()`.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    /// Registered nodes keyed by identifier.
    nodes: BTreeMap<NodeId, NodeRegistration>,
    /// Registered edges in insertion order.
    edges: Vec<GraphEdge>,
}

impl ExecutionGraph {
    /// Returns a registered node, if present.
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<&NodeRegistration> {
        self.nodes.get(node_id)
    }

    /// Returns all registered nodes in identifier order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeRegistration> {
        self.nodes.values()
    }

    /// Returns all edges as `(from, to, label)` triples.
    #[must_use]
    pub fn edges(&self) -> Vec<(NodeId, NodeId, RouteLabel)> {
        self.edges
            .iter()
            .map(|edge| (edge.from.clone(), edge.to.clone(), edge.label.clone()))
            .collect()
    }

    /// Returns node identifiers in topological order.
    ///
    /// Ready nodes are tie-broken by node-type priority (source < transform
    /// < gate < sink), then lexicographic identifier.
    #[must_use]
    pub fn topological_order(&self) -> Vec<NodeId> {
        let mut incoming: BTreeMap<&NodeId, usize> =
            self.nodes.keys().map(|node| (node, 0)).collect();
        for edge in &self.edges {
            if let Some(count) = incoming.get_mut(&edge.to) {
                *count += 1;
            }
        }
        let mut ready: BTreeSet<(NodeType, &NodeId)> = incoming
            .iter()
            .filter(|(_, count)| **count == 0)
            .filter_map(|(node, _)| {
                self.nodes.get(*node).map(|registration| (registration.node_type, *node))
            })
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(&(node_type, node)) = ready.iter().next() {
            ready.remove(&(node_type, node));
            order.push(node.clone());
            for edge in &self.edges {
                if edge.from == *node
                    && let Some(count) = incoming.get_mut(&edge.to)
                {
                    *count -= 1;
                    if *count == 0
                        && let Some(registration) = self.nodes.get(&edge.to)
                    {
                        ready.insert((registration.node_type, &edge.to));
                    }
                }
            }
        }
        order
    }

    /// Returns the sequence-index-to-node map for transform nodes.
    #[must_use]
    pub fn transform_id_map(&self) -> Vec<NodeId> {
        self.topological_order()
            .into_iter()
            .filter(|node| {
                self.nodes
                    .get(node)
                    .is_some_and(|registration| registration.node_type == NodeType::Transform)
            })
            .collect()
    }

    /// Returns the sink-name-to-node map.
    ///
    /// Sink names are the sink nodes' graph identifiers.
    #[must_use]
    pub fn sink_id_map(&self) -> BTreeMap<SinkName, NodeId> {
        self.nodes
            .iter()
            .filter(|(_, registration)| registration.node_type == NodeType::Sink)
            .map(|(node, _)| (SinkName::new(node.as_str()), node.clone()))
            .collect()
    }

    /// Returns the gate-name-to-node map.
    #[must_use]
    pub fn config_gate_id_map(&self) -> BTreeMap<String, NodeId> {
        self.nodes
            .iter()
            .filter(|(_, registration)| registration.node_type == NodeType::Gate)
            .map(|(node, _)| (node.as_str().to_string(), node.clone()))
            .collect()
    }

    /// Returns the `(gate, route label)` to destination resolution map.
    #[must_use]
    pub fn route_resolution_map(&self) -> BTreeMap<(NodeId, RouteLabel), RouteDestination> {
        let sinks = self.sink_id_map();
        let mut map = BTreeMap::new();
        for edge in &self.edges {
            let Some(registration) = self.nodes.get(&edge.from) else {
                continue;
            };
            if registration.node_type != NodeType::Gate {
                continue;
            }
            let destination = match edge.label.as_str() {
                ROUTE_CONTINUE => RouteDestination::Continue,
                ROUTE_FORK => RouteDestination::Fork,
                _ => {
                    let sink_name = SinkName::new(edge.to.as_str());
                    if sinks.contains_key(&sink_name) {
                        RouteDestination::Sink(sink_name)
                    } else {
                        continue;
                    }
                }
            };
            map.insert((edge.from.clone(), edge.label.clone()), destination);
        }
        map
    }

    /// Computes the canonical hash over the full topology.
    ///
    /// Covers every node (identifier, type, plugin, version, determinism,
    /// config hash) and every labeled edge, both in sorted order.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Canonicalization`] when hashing fails.
    pub fn compute_full_topology_hash(&self) -> Result<HashDigest, GraphError> {
        /// Canonical node projection for hashing.
        #[derive(Serialize)]
        struct NodeProjection<'a> {
            /// Node identifier.
            node_id: &'a str,
            /// Node role.
            node_type: NodeType,
            /// Plugin name.
            plugin_name: &'a str,
            /// Plugin version.
            plugin_version: &'a str,
            /// Determinism classification.
            determinism: crate::core::outcome::Determinism,
            /// Node config hash value.
            config_hash: &'a str,
        }
        /// Canonical edge projection for hashing.
        #[derive(Serialize)]
        struct EdgeProjection<'a> {
            /// Origin node.
            from: &'a str,
            /// Destination node.
            to: &'a str,
            /// Route label.
            label: &'a str,
        }
        /// Canonical topology projection for hashing.
        #[derive(Serialize)]
        struct TopologyProjection<'a> {
            /// Sorted nodes.
            nodes: Vec<NodeProjection<'a>>,
            /// Sorted edges.
            edges: Vec<EdgeProjection<'a>>,
        }

        let nodes = self
            .nodes
            .values()
            .map(|registration| NodeProjection {
                node_id: registration.node_id.as_str(),
                node_type: registration.node_type,
                plugin_name: registration.plugin_name.as_str(),
                plugin_version: registration.plugin_version.as_str(),
                determinism: registration.determinism,
                config_hash: registration.config_hash.value.as_str(),
            })
            .collect();
        let mut edges: Vec<EdgeProjection<'_>> = self
            .edges
            .iter()
            .map(|edge| EdgeProjection {
                from: edge.from.as_str(),
                to: edge.to.as_str(),
                label: edge.label.as_str(),
            })
            .collect();
        edges.sort_by(|a, b| (a.from, a.to, a.label).cmp(&(b.from, b.to, b.label)));
        let projection = TopologyProjection {
            nodes,
            edges,
        };
        hash_canonical_json(DEFAULT_HASH_ALGORITHM, &projection)
            .map_err(|err| GraphError::Canonicalization(err.to_string()))
    }

    /// Validates graph shape: acyclicity and edge coverage.
    fn validate_shape(&self) -> Result<(), GraphError> {
        let order = self.topological_order();
        if order.len() != self.nodes.len() {
            let ordered: BTreeSet<&NodeId> = order.iter().collect();
            let stuck = self
                .nodes
                .keys()
                .find(|node| !ordered.contains(node))
                .map_or_else(String::new, |node| node.as_str().to_string());
            return Err(GraphError::Cycle(stuck));
        }
        let has_incoming: BTreeSet<&NodeId> = self.edges.iter().map(|edge| &edge.to).collect();
        let has_outgoing: BTreeSet<&NodeId> = self.edges.iter().map(|edge| &edge.from).collect();
        for (node, registration) in &self.nodes {
            if registration.node_type != NodeType::Source && !has_incoming.contains(node) {
                return Err(GraphError::MissingIncoming(node.as_str().to_string()));
            }
            if registration.node_type != NodeType::Sink && !has_outgoing.contains(node) {
                return Err(GraphError::MissingOutgoing(node.as_str().to_string()));
            }
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Route Validation
// ============================================================================

/// Validates a declared route plan against the available sinks.
///
/// Performed at pipeline initialization, before any row is processed. Gate
/// destinations must resolve to a sink or a reserved label; transform and
/// source error destinations must resolve to a sink or `discard`.
///
/// # Errors
///
/// Returns [`RouteValidationError`] naming the offender and the available
/// sinks.
pub fn validate_route_plan(
    plan: &RoutePlan,
    gate_names: &[NodeId],
    available_sinks: &BTreeSet<SinkName>,
) -> Result<(), RouteValidationError> {
    let available = available_sinks
        .iter()
        .map(SinkName::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    let mut seen_gates = BTreeSet::new();
    for gate in gate_names {
        if !seen_gates.insert(gate) {
            return Err(RouteValidationError::DuplicateGate {
                gate: gate.as_str().to_string(),
            });
        }
    }
    for (gate, routes) in &plan.gate_routes {
        for (route, destination) in routes {
            if let RouteDestination::Sink(sink) = destination
                && !available_sinks.contains(sink)
            {
                return Err(RouteValidationError::UnknownGateDestination {
                    gate: gate.as_str().to_string(),
                    route: route.as_str().to_string(),
                    destination: sink.as_str().to_string(),
                    available: available.clone(),
                });
            }
        }
    }
    for (transform, target) in &plan.transform_error_sinks {
        if let ErrorSinkTarget::Sink(sink) = target
            && !available_sinks.contains(sink)
        {
            return Err(RouteValidationError::UnknownErrorSink {
                transform: transform.as_str().to_string(),
                destination: sink.as_str().to_string(),
                available: available.clone(),
            });
        }
    }
    if let Some(ErrorSinkTarget::Sink(sink)) = &plan.source_quarantine
        && !available_sinks.contains(sink)
    {
        return Err(RouteValidationError::UnknownQuarantineSink {
            destination: sink.as_str().to_string(),
            available,
        });
    }
    Ok(())
}
