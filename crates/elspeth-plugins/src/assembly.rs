// crates/elspeth-plugins/src/assembly.rs
// ============================================================================
// Module: Pipeline Assembly
// Description: Builds an orchestrator pipeline from validated settings.
// Purpose: Instantiate plugins, routes, and registrations from the config.
// Dependencies: elspeth-config, elspeth-core, serde_json
// ============================================================================

//! ## Overview
//! Assembly turns a validated settings document into a fully-typed
//! [`Pipeline`]: plugin instances, the declared route plan, and one
//! registration payload per node (each carrying the canonical hash of its
//! own settings fragment, which the resume lock compares against).

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use elspeth_config::ConfigError;
use elspeth_config::ContractSettings;
use elspeth_config::GateOptions;
use elspeth_config::OutputModeSetting;
use elspeth_config::PipelineSettings;
use elspeth_config::SinkOptions;
use elspeth_config::SourceOptions;
use elspeth_config::StepSettings;
use elspeth_config::TransformOptions;
use elspeth_config::hash_value;
use elspeth_config::settings_hash;
use elspeth_core::AggregationPolicy;
use elspeth_core::AggregationStep;
use elspeth_core::AggregationTrigger;
use elspeth_core::BranchName;
use elspeth_core::CoalesceStep;
use elspeth_core::ContractMode;
use elspeth_core::Determinism;
use elspeth_core::ErrorSinkTarget;
use elspeth_core::FieldSource;
use elspeth_core::FieldSpec;
use elspeth_core::GatePlugin;
use elspeth_core::NodeId;
use elspeth_core::NodeRegistration;
use elspeth_core::NodeType;
use elspeth_core::OutputMode;
use elspeth_core::Pipeline;
use elspeth_core::PipelineStep;
use elspeth_core::PluginName;
use elspeth_core::RouteDestination;
use elspeth_core::RouteLabel;
use elspeth_core::RoutePlan;
use elspeth_core::SchemaContract;
use elspeth_core::SinkBinding;
use elspeth_core::SinkName;
use elspeth_core::SourcePlugin;
use elspeth_core::StepBody;
use elspeth_core::TransformPlugin;
use elspeth_core::ValueKind;
use elspeth_core::normalize_field_name;
use thiserror::Error;

use crate::gate::ForkAllGate;
use crate::gate::RouteOnEqualsGate;
use crate::sink::CsvSink;
use crate::sink::MemorySink;
use crate::source::CsvSource;
use crate::source::InlineSource;
use crate::transform::ConcatTransform;
use crate::transform::FailOnTransform;
use crate::transform::IdentityTransform;
use crate::transform::RenameTransform;
use crate::transform::SetFieldTransform;
use crate::transform::UppercaseTransform;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Pipeline assembly errors.
///
/// # Invariants
/// - Messages name the offending node or option.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Settings-level failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The settings reference something assembly cannot satisfy.
    #[error("pipeline assembly error: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Assembly
// ============================================================================

/// Builds a fully-typed pipeline from validated settings.
///
/// # Errors
///
/// Returns [`BuildError`] when a settings fragment cannot be hashed or a
/// gate route cannot be resolved.
pub fn build_pipeline(settings: &PipelineSettings) -> Result<Pipeline, BuildError> {
    let source_node = NodeId::new(settings.source.node.clone());
    let contract = build_contract(&settings.source.contract)?;
    let mut source = build_source(&settings.source.options, contract.mode);
    source.set_schema_contract(contract);

    let mut steps = Vec::with_capacity(settings.steps.len());
    let mut route_plan = RoutePlan {
        source_quarantine: Some(parse_error_target(&settings.source.on_validation_failure)),
        ..RoutePlan::default()
    };
    let mut registrations = vec![NodeRegistration {
        node_id: source_node.clone(),
        plugin_name: PluginName::new(source_plugin_name(&settings.source.options)),
        node_type: NodeType::Source,
        plugin_version: env!("CARGO_PKG_VERSION").to_string(),
        determinism: source_determinism(&settings.source.options),
        config_hash: hash_value(&settings.source).map_err(BuildError::Config)?,
        schema_config_json: Some(
            serde_json::to_value(&settings.source.contract)
                .map_err(|err| BuildError::Invalid(err.to_string()))?,
        ),
    }];

    for step in &settings.steps {
        let node_id = NodeId::new(step.node());
        let config_hash = hash_value(step).map_err(BuildError::Config)?;
        let (body, plugin_name) = match step {
            StepSettings::Transform {
                plugin,
                on_error,
                ..
            } => {
                route_plan
                    .transform_error_sinks
                    .insert(node_id.clone(), parse_error_target(on_error));
                (
                    StepBody::Transform(build_transform(plugin)),
                    transform_plugin_name(plugin),
                )
            }
            StepSettings::Gate {
                node,
                plugin,
                routes,
                on_error,
            } => {
                route_plan
                    .transform_error_sinks
                    .insert(node_id.clone(), parse_error_target(on_error));
                let mut destinations = BTreeMap::new();
                for (label, destination) in routes {
                    destinations
                        .insert(RouteLabel::new(label.clone()), parse_route(destination));
                }
                route_plan.gate_routes.insert(node_id.clone(), destinations);
                (
                    StepBody::Gate(build_gate(node, plugin, routes)?),
                    gate_plugin_name(plugin),
                )
            }
            StepSettings::Aggregation {
                output_mode,
                trigger,
                plugin,
                on_error,
                ..
            } => {
                route_plan
                    .transform_error_sinks
                    .insert(node_id.clone(), parse_error_target(on_error));
                let transform = plugin.as_ref().map(build_transform);
                let step = AggregationStep {
                    transform,
                    policy: AggregationPolicy {
                        trigger: AggregationTrigger {
                            max_count: trigger.count,
                            wall_clock_timeout_ms: trigger.timeout_ms,
                        },
                        output_mode: match output_mode {
                            OutputModeSetting::Single => OutputMode::Single,
                            OutputModeSetting::Transform => OutputMode::Transform,
                            OutputModeSetting::Passthrough => OutputMode::Passthrough,
                        },
                    },
                };
                (StepBody::Aggregation(step), "aggregation")
            }
            StepSettings::Coalesce {
                branches, ..
            } => (
                StepBody::Coalesce(CoalesceStep {
                    awaited: branches.iter().cloned().map(BranchName::new).collect(),
                }),
                "coalesce",
            ),
        };
        registrations.push(NodeRegistration {
            node_id: node_id.clone(),
            plugin_name: PluginName::new(plugin_name),
            node_type: match body {
                StepBody::Gate(_) => NodeType::Gate,
                StepBody::Transform(_) | StepBody::Coalesce(_) | StepBody::Aggregation(_) => {
                    NodeType::Transform
                }
            },
            plugin_version: env!("CARGO_PKG_VERSION").to_string(),
            determinism: Determinism::Deterministic,
            config_hash,
            schema_config_json: None,
        });
        steps.push(PipelineStep {
            node_id,
            body,
        });
    }

    let mut sinks = Vec::with_capacity(settings.sinks.len());
    for (name, sink_settings) in &settings.sinks {
        let node_id = NodeId::new(name.clone());
        let plugin: Box<dyn elspeth_core::SinkPlugin> = match &sink_settings.options {
            SinkOptions::Csv {
                path,
            } => Box::new(CsvSink::new(path.clone())),
            SinkOptions::Memory => Box::new(MemorySink::new()),
        };
        registrations.push(NodeRegistration {
            node_id: node_id.clone(),
            plugin_name: PluginName::new(sink_plugin_name(&sink_settings.options)),
            node_type: NodeType::Sink,
            plugin_version: env!("CARGO_PKG_VERSION").to_string(),
            determinism: Determinism::IoWrite,
            config_hash: hash_value(sink_settings).map_err(BuildError::Config)?,
            schema_config_json: None,
        });
        sinks.push(SinkBinding {
            name: SinkName::new(name.clone()),
            node_id,
            plugin,
        });
    }

    Ok(Pipeline {
        source_node,
        source,
        steps,
        sinks,
        default_sink: SinkName::new(settings.default_sink.clone()),
        route_plan,
        node_registrations: registrations,
        config_hash: settings_hash(settings).map_err(BuildError::Config)?,
    })
}

// ============================================================================
// SECTION: Builders
// ============================================================================

/// Builds the declared schema contract.
fn build_contract(settings: &ContractSettings) -> Result<SchemaContract, BuildError> {
    let mode: ContractMode = settings.mode.into();
    let fields = settings
        .fields
        .iter()
        .map(|field| FieldSpec {
            normalized_name: normalize_field_name(&field.name),
            original_name: field.name.clone(),
            value_kind: ValueKind::String,
            required: field.required,
            source: FieldSource::Declared,
        })
        .collect();
    SchemaContract::with_declared_fields(mode, fields)
        .map_err(|err| BuildError::Invalid(err.to_string()))
}

/// Instantiates the source plugin.
fn build_source(options: &SourceOptions, mode: ContractMode) -> Box<dyn SourcePlugin> {
    match options {
        SourceOptions::Inline {
            rows,
        } => Box::new(InlineSource::new(rows.clone(), SchemaContract::new(mode))),
        SourceOptions::Csv {
            path,
            delimiter,
        } => Box::new(CsvSource::new(path.clone(), *delimiter, mode)),
    }
}

/// Instantiates a transform plugin.
fn build_transform(options: &TransformOptions) -> Box<dyn TransformPlugin> {
    match options {
        TransformOptions::Identity => Box::new(IdentityTransform::new()),
        TransformOptions::SetField {
            name,
            value,
        } => Box::new(SetFieldTransform::new(name.clone(), value.clone())),
        TransformOptions::Rename {
            from,
            to,
        } => Box::new(RenameTransform::new(from.clone(), to.clone())),
        TransformOptions::Uppercase {
            field,
        } => Box::new(UppercaseTransform::new(field.clone())),
        TransformOptions::FailOn {
            field,
            equals,
        } => Box::new(FailOnTransform::new(field.clone(), equals.clone())),
        TransformOptions::Concat {
            field,
            separator,
        } => Box::new(ConcatTransform::new(field.clone(), separator.clone())),
    }
}

/// Instantiates a gate plugin, resolving its emitted route labels.
fn build_gate(
    node: &str,
    options: &GateOptions,
    routes: &BTreeMap<String, String>,
) -> Result<Box<dyn GatePlugin>, BuildError> {
    match options {
        GateOptions::RouteOnEquals {
            field,
            equals,
            route,
        } => {
            let destination = routes.get(route).ok_or_else(|| {
                BuildError::Invalid(format!(
                    "gate '{node}' emits route '{route}' with no declared destination"
                ))
            })?;
            match parse_route(destination) {
                RouteDestination::Sink(sink) => Ok(Box::new(RouteOnEqualsGate::new(
                    field.clone(),
                    equals.clone(),
                    sink,
                ))),
                RouteDestination::Continue | RouteDestination::Fork => {
                    Err(BuildError::Invalid(format!(
                        "gate '{node}' route '{route}' must name a sink"
                    )))
                }
            }
        }
        GateOptions::ForkAll {
            branches,
        } => {
            let paths = branches
                .iter()
                .map(|branch| {
                    let destination = if branch.destination == "continue" {
                        None
                    } else {
                        Some(SinkName::new(branch.destination.clone()))
                    };
                    (BranchName::new(branch.branch.clone()), destination)
                })
                .collect();
            Ok(Box::new(ForkAllGate::new(paths)))
        }
    }
}

/// Parses a route destination string into its closed form.
fn parse_route(destination: &str) -> RouteDestination {
    match destination {
        "continue" => RouteDestination::Continue,
        "fork" => RouteDestination::Fork,
        sink => RouteDestination::Sink(SinkName::new(sink)),
    }
}

/// Parses a `discard`-or-sink destination into its closed form.
fn parse_error_target(destination: &str) -> ErrorSinkTarget {
    if destination == "discard" {
        ErrorSinkTarget::Discard
    } else {
        ErrorSinkTarget::Sink(SinkName::new(destination))
    }
}

/// Returns the stable plugin name for source options.
const fn source_plugin_name(options: &SourceOptions) -> &'static str {
    match options {
        SourceOptions::Inline {
            ..
        } => "inline_source",
        SourceOptions::Csv {
            ..
        } => "csv_source",
    }
}

/// Returns the determinism classification for source options.
const fn source_determinism(options: &SourceOptions) -> Determinism {
    match options {
        SourceOptions::Inline {
            ..
        } => Determinism::Deterministic,
        SourceOptions::Csv {
            ..
        } => Determinism::IoRead,
    }
}

/// Returns the stable plugin name for transform options.
const fn transform_plugin_name(options: &TransformOptions) -> &'static str {
    match options {
        TransformOptions::Identity => "identity",
        TransformOptions::SetField {
            ..
        } => "set_field",
        TransformOptions::Rename {
            ..
        } => "rename",
        TransformOptions::Uppercase {
            ..
        } => "uppercase",
        TransformOptions::FailOn {
            ..
        } => "fail_on",
        TransformOptions::Concat {
            ..
        } => "concat",
    }
}

/// Returns the stable plugin name for gate options.
const fn gate_plugin_name(options: &GateOptions) -> &'static str {
    match options {
        GateOptions::RouteOnEquals {
            ..
        } => "route_on_equals",
        GateOptions::ForkAll {
            ..
        } => "fork_all",
    }
}

/// Returns the stable plugin name for sink options.
const fn sink_plugin_name(options: &SinkOptions) -> &'static str {
    match options {
        SinkOptions::Csv {
            ..
        } => "csv_sink",
        SinkOptions::Memory => "memory_sink",
    }
}
