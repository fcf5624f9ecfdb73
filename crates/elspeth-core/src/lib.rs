// crates/elspeth-core/src/lib.rs
// ============================================================================
// Module: Elspeth Core
// Description: Orchestration core for the Elspeth data pipeline engine.
// Purpose: Expose the graph, processor, orchestrator, and contract surfaces.
// Dependencies: indexmap, rand, serde, serde_jcs, serde_json, sha2, thiserror
// ============================================================================

//! ## Overview
//! Elspeth is a row-oriented, single-run pipeline engine with an
//! audit-grade execution trail: every admitted row ends in exactly one
//! terminal outcome record, and resume continues from checkpoints that
//! correspond to actually-persisted sink output. This crate is the
//! orchestration core: the execution graph, the row processor, the
//! orchestrator, and the contracts for sources, transforms, gates, sinks,
//! recorders, payload stores, and secrets providers.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod graph;
pub mod interfaces;
pub mod landscape;
pub mod runtime;
pub mod telemetry;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use crate::core::hashing;
pub use crate::core::identifiers::BatchId;
pub use crate::core::identifiers::BranchName;
pub use crate::core::identifiers::CheckpointId;
pub use crate::core::identifiers::EdgeId;
pub use crate::core::identifiers::ExpandGroupId;
pub use crate::core::identifiers::ForkGroupId;
pub use crate::core::identifiers::JoinGroupId;
pub use crate::core::identifiers::NodeId;
pub use crate::core::identifiers::OperationId;
pub use crate::core::identifiers::OutcomeId;
pub use crate::core::identifiers::PluginName;
pub use crate::core::identifiers::RouteLabel;
pub use crate::core::identifiers::RowId;
pub use crate::core::identifiers::RunId;
pub use crate::core::identifiers::SinkName;
pub use crate::core::identifiers::StateId;
pub use crate::core::identifiers::TokenId;
pub use crate::core::outcome::BatchMemberRecord;
pub use crate::core::outcome::BatchMemberRole;
pub use crate::core::outcome::BatchRecord;
pub use crate::core::outcome::BatchStatus;
pub use crate::core::outcome::CHECKPOINT_FORMAT_VERSION;
pub use crate::core::outcome::CheckpointRecord;
pub use crate::core::outcome::CheckpointRequest;
pub use crate::core::outcome::Determinism;
pub use crate::core::outcome::EdgeRecord;
pub use crate::core::outcome::ExportStatus;
pub use crate::core::outcome::NodeRecord;
pub use crate::core::outcome::NodeRegistration;
pub use crate::core::outcome::NodeStateRecord;
pub use crate::core::outcome::NodeStateStatus;
pub use crate::core::outcome::NodeType;
pub use crate::core::outcome::OutcomeContext;
pub use crate::core::outcome::OutcomeKind;
pub use crate::core::outcome::RowRecord;
pub use crate::core::outcome::RunConfig;
pub use crate::core::outcome::RunRecord;
pub use crate::core::outcome::RunStatus;
pub use crate::core::outcome::TokenOutcomeRecord;
pub use crate::core::outcome::TokenRecord;
pub use crate::core::outcome::TriggerReason;
pub use crate::core::row::ContractError;
pub use crate::core::row::ContractMode;
pub use crate::core::row::FieldSource;
pub use crate::core::row::FieldSpec;
pub use crate::core::row::PipelineRow;
pub use crate::core::row::QuarantinedRow;
pub use crate::core::row::SchemaContract;
pub use crate::core::row::ValueKind;
pub use crate::core::row::normalize_field_name;
pub use crate::core::time::Clock;
pub use crate::core::time::ManualClock;
pub use crate::core::time::SystemClock;
pub use crate::core::time::Timestamp;
pub use crate::graph::ErrorSinkTarget;
pub use crate::graph::ExecutionGraph;
pub use crate::graph::ExecutionGraphBuilder;
pub use crate::graph::GraphError;
pub use crate::graph::ROUTE_CONTINUE;
pub use crate::graph::ROUTE_DISCARD;
pub use crate::graph::ROUTE_FORK;
pub use crate::graph::RouteDestination;
pub use crate::graph::RoutePlan;
pub use crate::graph::RouteValidationError;
pub use crate::graph::validate_route_plan;
pub use crate::interfaces::ArtifactDescriptor;
pub use crate::interfaces::CapacityNotice;
pub use crate::interfaces::FingerprintKey;
pub use crate::interfaces::ForkDestination;
pub use crate::interfaces::ForkPath;
pub use crate::interfaces::GateError;
pub use crate::interfaces::GatePlugin;
pub use crate::interfaces::Landscape;
pub use crate::interfaces::LandscapeError;
pub use crate::interfaces::NewRow;
pub use crate::interfaces::PayloadError;
pub use crate::interfaces::PayloadHash;
pub use crate::interfaces::PayloadStore;
pub use crate::interfaces::PluginContext;
pub use crate::interfaces::RoutingAction;
pub use crate::interfaces::SecretsError;
pub use crate::interfaces::SecretsProvider;
pub use crate::interfaces::SignedExport;
pub use crate::interfaces::SinkError;
pub use crate::interfaces::SinkMode;
pub use crate::interfaces::SinkPayload;
pub use crate::interfaces::SinkPlugin;
pub use crate::interfaces::SinkToken;
pub use crate::interfaces::SinkWriteContext;
pub use crate::interfaces::SourceError;
pub use crate::interfaces::SourcePlugin;
pub use crate::interfaces::SourceRow;
pub use crate::interfaces::TransformFailure;
pub use crate::interfaces::TransformPlugin;
pub use crate::interfaces::TransformResult;
pub use crate::landscape::memory::MemoryLandscape;
pub use crate::runtime::batch::BatchAdapterError;
pub use crate::runtime::batch::BatchWorkerPool;
pub use crate::runtime::batch::RendezvousRegistry;
pub use crate::runtime::batch::SharedBatchAdapter;
pub use crate::runtime::orchestrator::Orchestrator;
pub use crate::runtime::orchestrator::OrchestratorError;
pub use crate::runtime::orchestrator::OrchestratorSettings;
pub use crate::runtime::orchestrator::Pipeline;
pub use crate::runtime::orchestrator::ResumeReport;
pub use crate::runtime::orchestrator::RunCounters;
pub use crate::runtime::orchestrator::RunReport;
pub use crate::runtime::orchestrator::SinkBinding;
pub use crate::runtime::processor::AggregationPolicy;
pub use crate::runtime::processor::AggregationStep;
pub use crate::runtime::processor::AggregationTrigger;
pub use crate::runtime::processor::CoalesceStep;
pub use crate::runtime::processor::MAX_WORK_QUEUE_ITERATIONS;
pub use crate::runtime::processor::OutputMode;
pub use crate::runtime::processor::PendingEmit;
pub use crate::runtime::processor::PipelineStep;
pub use crate::runtime::processor::ProcessEnv;
pub use crate::runtime::processor::ProcessorError;
pub use crate::runtime::processor::RowOutput;
pub use crate::runtime::processor::RowProcessor;
pub use crate::runtime::processor::StepBody;
pub use crate::runtime::processor::TokenCtx;
pub use crate::runtime::retry::DefaultErrorClassifier;
pub use crate::runtime::retry::ErrorClass;
pub use crate::runtime::retry::ErrorClassifier;
pub use crate::runtime::retry::RetryDecision;
pub use crate::runtime::retry::RetryManager;
pub use crate::runtime::retry::RetryPolicy;
pub use crate::telemetry::CallStatus;
pub use crate::telemetry::NoopTelemetry;
pub use crate::telemetry::Telemetry;
pub use crate::telemetry::TelemetryEvent;
