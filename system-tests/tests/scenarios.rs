// system-tests/tests/scenarios.rs
// ============================================================================
// Module: End-to-End Scenarios
// Description: Full runs through the SQLite landscape and payload stores.
// ============================================================================
//! ## Overview
//! The literal end-to-end scenarios: happy path, crash mid-sink with
//! resume, lazy aggregation timeout, fork-and-coalesce, topology lock, and
//! the fingerprint-key boundary. Each drives the public orchestrator API
//! against the durable stores.

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
    reason = "Test-only assertions and helpers are permitted."
)]

use std::sync::Arc;

use elspeth_core::AggregationPolicy;
use elspeth_core::AggregationStep;
use elspeth_core::AggregationTrigger;
use elspeth_core::BranchName;
use elspeth_core::CoalesceStep;
use elspeth_core::Landscape;
use elspeth_core::LandscapeError;
use elspeth_core::ManualClock;
use elspeth_core::NodeId;
use elspeth_core::NodeType;
use elspeth_core::NoopTelemetry;
use elspeth_core::Orchestrator;
use elspeth_core::OrchestratorError;
use elspeth_core::OrchestratorSettings;
use elspeth_core::OutputMode;
use elspeth_core::Pipeline;
use elspeth_core::PipelineStep;
use elspeth_core::RoutePlan;
use elspeth_core::RunStatus;
use elspeth_core::SinkBinding;
use elspeth_core::SinkName;
use elspeth_core::StepBody;
use elspeth_core::SystemClock;
use elspeth_core::hashing::DEFAULT_HASH_ALGORITHM;
use elspeth_core::hashing::hash_canonical_json;
use elspeth_landscape_sqlite::SqliteLandscape;
use elspeth_landscape_sqlite::SqliteLandscapeConfig;
use elspeth_payload::FsPayloadStore;
use elspeth_plugins::ConcatTransform;
use elspeth_plugins::CsvSink;
use elspeth_plugins::ForkAllGate;
use elspeth_plugins::IdentityTransform;
use elspeth_plugins::InlineSource;
use elspeth_plugins::MemorySink;
use elspeth_plugins::StaticSecretsProvider;
use elspeth_core::ContractMode;
use elspeth_core::SchemaContract;
use serde_json::Value;
use serde_json::json;
use system_tests::FailingCsvSink;
use system_tests::PausingSource;
use system_tests::raw_from;
use system_tests::registration;
use tempfile::TempDir;

/// Opens a durable landscape and payload store under a temp directory.
fn stores(dir: &TempDir) -> (SqliteLandscape, FsPayloadStore) {
    let landscape =
        SqliteLandscape::open(&SqliteLandscapeConfig::for_path(dir.path().join("landscape.db")))
            .expect("open landscape");
    let payload =
        FsPayloadStore::open(dir.path().join("payloads")).expect("open payload store");
    (landscape, payload)
}

/// Builds the S1/S2 pipeline: inline source, identity transform, one sink.
fn linear_pipeline(rows: Vec<&[(&str, Value)]>, sink: Box<dyn elspeth_core::SinkPlugin>) -> Pipeline {
    let raw_rows = rows.into_iter().map(raw_from).collect();
    let transform = PipelineStep {
        node_id: NodeId::new("t1"),
        body: StepBody::Transform(Box::new(IdentityTransform::new())),
    };
    Pipeline {
        source_node: NodeId::new("src"),
        source: Box::new(InlineSource::new(
            raw_rows,
            SchemaContract::new(ContractMode::Observed),
        )),
        steps: vec![transform],
        sinks: vec![SinkBinding {
            name: SinkName::new("out"),
            node_id: NodeId::new("out"),
            plugin: sink,
        }],
        default_sink: SinkName::new("out"),
        route_plan: RoutePlan::default(),
        node_registrations: vec![
            registration("src", NodeType::Source),
            registration("t1", NodeType::Transform),
            registration("out", NodeType::Sink),
        ],
        config_hash: hash_canonical_json(DEFAULT_HASH_ALGORITHM, &json!({ "scenario": "linear" }))
            .expect("config hash"),
    }
}

/// Collects every recorded outcome of a run via the signed export.
fn run_outcomes(landscape: &SqliteLandscape, run_id: elspeth_core::RunId) -> Vec<(String, bool)> {
    let secrets = StaticSecretsProvider::new(b"scenario-key".to_vec(), None);
    let export = landscape.export_run(run_id, &secrets).expect("export");
    export.payload["outcomes"]
        .as_array()
        .expect("outcomes array")
        .iter()
        .map(|outcome| {
            (
                outcome["outcome"].as_str().expect("kind").to_string(),
                outcome["is_terminal"].as_bool().expect("terminal flag"),
            )
        })
        .collect()
}

#[test]
fn s1_happy_path_completes_and_clears_checkpoints() {
    let dir = TempDir::new().expect("tempdir");
    let (landscape, payload) = stores(&dir);
    let telemetry = NoopTelemetry;
    let clock = SystemClock;
    let orchestrator = Orchestrator::new(
        &landscape,
        &payload,
        &telemetry,
        &clock,
        OrchestratorSettings::default(),
    );
    let (sink, handle) = {
        let sink = MemorySink::new();
        let handle = sink.handle();
        (Box::new(sink), handle)
    };
    let pipeline = linear_pipeline(
        vec![&[("id", json!(1))], &[("id", json!(2))], &[("id", json!(3))]],
        sink,
    );
    let report = orchestrator.run(pipeline).expect("run");

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.counters.rows_admitted, 3);
    assert_eq!(handle.records().len(), 3);
    assert!(landscape.list_checkpoints(report.run_id).expect("list").is_empty());

    let outcomes = run_outcomes(&landscape, report.run_id);
    let completed =
        outcomes.iter().filter(|(kind, terminal)| kind == "completed" && *terminal).count();
    assert_eq!(completed, 3);
}

#[test]
fn s2_crash_mid_sink_then_resume_completes_the_output() {
    let dir = TempDir::new().expect("tempdir");
    let (landscape, payload) = stores(&dir);
    let telemetry = NoopTelemetry;
    let clock = SystemClock;
    let orchestrator = Orchestrator::new(
        &landscape,
        &payload,
        &telemetry,
        &clock,
        OrchestratorSettings::default(),
    );
    let output = dir.path().join("out.csv");

    // First run: the sink persists two tokens and fails on the third.
    let pipeline = linear_pipeline(
        vec![&[("id", json!(1))], &[("id", json!(2))], &[("id", json!(3))]],
        Box::new(FailingCsvSink::new(output.clone(), 2)),
    );
    let report = orchestrator.run(pipeline).expect("run");
    assert_eq!(report.status, RunStatus::Failed);

    let checkpoints = landscape.list_checkpoints(report.run_id).expect("list");
    assert_eq!(checkpoints.len(), 2);
    let outcomes = run_outcomes(&landscape, report.run_id);
    assert_eq!(outcomes.iter().filter(|(kind, _)| kind == "completed").count(), 2);
    assert_eq!(
        landscape.get_unprocessed_row_ids(report.run_id).expect("unprocessed").len(),
        1
    );

    // Dry run reports the resume point without touching anything.
    let inspect_pipeline =
        linear_pipeline(vec![], Box::new(CsvSink::new(output.clone())));
    let resume_report = orchestrator
        .resume_report(report.run_id, &inspect_pipeline)
        .expect("resume report");
    assert_eq!(resume_report.unprocessed_rows, 1);
    assert_eq!(resume_report.checkpoint_node, Some(NodeId::new("out")));

    // Execute the resume with a healthy sink in append mode.
    let resume_pipeline = linear_pipeline(vec![], Box::new(CsvSink::new(output.clone())));
    let resumed = orchestrator.resume(report.run_id, resume_pipeline).expect("resume");
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.counters.rows_admitted, 1);

    // Final output contains all three rows exactly once.
    let text = std::fs::read_to_string(&output).expect("read output");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines, vec!["id", "1", "2", "3"]);
    assert!(landscape.list_checkpoints(report.run_id).expect("list").is_empty());
}

#[test]
fn s3_aggregation_timeout_flushes_lazily() {
    let dir = TempDir::new().expect("tempdir");
    let (landscape, payload) = stores(&dir);
    let telemetry = NoopTelemetry;
    let clock = Arc::new(ManualClock::starting_at(0));
    let orchestrator = Orchestrator::new(
        &landscape,
        &payload,
        &telemetry,
        clock.as_ref(),
        OrchestratorSettings::default(),
    );

    let rows = (1 ..= 5_i64).map(|id| raw_from(&[("id", json!(id))])).collect();
    // The gap opens before row 4 (zero-based index 3).
    let source = PausingSource::new(rows, 3, 2_000, Arc::clone(&clock));
    let (sink, handle) = {
        let sink = MemorySink::new();
        let handle = sink.handle();
        (Box::new(sink), handle)
    };
    let pipeline = Pipeline {
        source_node: NodeId::new("src"),
        source: Box::new(source),
        steps: vec![PipelineStep {
            node_id: NodeId::new("agg"),
            body: StepBody::Aggregation(AggregationStep {
                transform: Some(Box::new(ConcatTransform::new("id", "+"))),
                policy: AggregationPolicy {
                    trigger: AggregationTrigger {
                        max_count: Some(5),
                        wall_clock_timeout_ms: Some(1_000),
                    },
                    output_mode: OutputMode::Single,
                },
            }),
        }],
        sinks: vec![SinkBinding {
            name: SinkName::new("out"),
            node_id: NodeId::new("out"),
            plugin: sink,
        }],
        default_sink: SinkName::new("out"),
        route_plan: RoutePlan::default(),
        node_registrations: vec![
            registration("src", NodeType::Source),
            registration("agg", NodeType::Transform),
            registration("out", NodeType::Sink),
        ],
        config_hash: hash_canonical_json(
            DEFAULT_HASH_ALGORITHM,
            &json!({ "scenario": "aggregation" }),
        )
        .expect("config hash"),
    };

    let report = orchestrator.run(pipeline).expect("run");
    assert_eq!(report.status, RunStatus::Completed);

    // The timeout flushed [1,2,3]; end-of-source flushed [4,5].
    let written: Vec<Value> =
        handle.records().into_iter().map(|record| record.payload["id"].clone()).collect();
    assert_eq!(written, vec![json!("1+2+3"), json!("4+5")]);

    // Inputs buffered then consumed, exactly one terminal each.
    let outcomes = run_outcomes(&landscape, report.run_id);
    let consumed =
        outcomes.iter().filter(|(kind, _)| kind == "consumed_in_batch").count();
    assert_eq!(consumed, 5);
    let buffered = outcomes.iter().filter(|(kind, terminal)| kind == "buffered" && !terminal);
    assert_eq!(buffered.count(), 5);
}

#[test]
fn s4_fork_and_coalesce_merges_both_branches() {
    let dir = TempDir::new().expect("tempdir");
    let (landscape, payload) = stores(&dir);
    let telemetry = NoopTelemetry;
    let clock = SystemClock;
    let orchestrator = Orchestrator::new(
        &landscape,
        &payload,
        &telemetry,
        &clock,
        OrchestratorSettings::default(),
    );
    let (sink, handle) = {
        let sink = MemorySink::new();
        let handle = sink.handle();
        (Box::new(sink), handle)
    };
    let pipeline = Pipeline {
        source_node: NodeId::new("src"),
        source: Box::new(InlineSource::new(
            vec![raw_from(&[("id", json!(1))])],
            SchemaContract::new(ContractMode::Observed),
        )),
        steps: vec![
            PipelineStep {
                node_id: NodeId::new("fork"),
                body: StepBody::Gate(Box::new(ForkAllGate::new(vec![
                    (BranchName::new("branchA"), None),
                    (BranchName::new("branchB"), None),
                ]))),
            },
            PipelineStep {
                node_id: NodeId::new("work"),
                body: StepBody::Transform(Box::new(IdentityTransform::new())),
            },
            PipelineStep {
                node_id: NodeId::new("join"),
                body: StepBody::Coalesce(CoalesceStep {
                    awaited: vec![BranchName::new("branchA"), BranchName::new("branchB")],
                }),
            },
        ],
        sinks: vec![SinkBinding {
            name: SinkName::new("out"),
            node_id: NodeId::new("out"),
            plugin: sink,
        }],
        default_sink: SinkName::new("out"),
        route_plan: RoutePlan::default(),
        node_registrations: vec![
            registration("src", NodeType::Source),
            registration("fork", NodeType::Gate),
            registration("work", NodeType::Transform),
            registration("join", NodeType::Transform),
            registration("out", NodeType::Sink),
        ],
        config_hash: hash_canonical_json(DEFAULT_HASH_ALGORITHM, &json!({ "scenario": "fork" }))
            .expect("config hash"),
    };

    let report = orchestrator.run(pipeline).expect("run");
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(handle.records().len(), 1);

    let outcomes = run_outcomes(&landscape, report.run_id);
    let count_of = |expected: &str| {
        outcomes.iter().filter(|(kind, _)| kind == expected).count()
    };
    assert_eq!(count_of("forked"), 1);
    assert_eq!(count_of("coalesced"), 2);
    assert_eq!(count_of("completed"), 1);
}

#[test]
fn s5_topology_change_refuses_resume() {
    let dir = TempDir::new().expect("tempdir");
    let (landscape, payload) = stores(&dir);
    let telemetry = NoopTelemetry;
    let clock = SystemClock;
    let orchestrator = Orchestrator::new(
        &landscape,
        &payload,
        &telemetry,
        &clock,
        OrchestratorSettings::default(),
    );
    let output = dir.path().join("out.csv");

    // Run with two transforms; the sink fails after two of five rows.
    let two_transforms = |sink: Box<dyn elspeth_core::SinkPlugin>, extra: bool| {
        let mut steps = vec![
            PipelineStep {
                node_id: NodeId::new("t1"),
                body: StepBody::Transform(Box::new(IdentityTransform::new())),
            },
            PipelineStep {
                node_id: NodeId::new("t2"),
                body: StepBody::Transform(Box::new(IdentityTransform::new())),
            },
        ];
        let mut registrations = vec![
            registration("src", NodeType::Source),
            registration("t1", NodeType::Transform),
            registration("t2", NodeType::Transform),
            registration("out", NodeType::Sink),
        ];
        if extra {
            steps.push(PipelineStep {
                node_id: NodeId::new("t3"),
                body: StepBody::Transform(Box::new(IdentityTransform::new())),
            });
            registrations.push(registration("t3", NodeType::Transform));
        }
        Pipeline {
            source_node: NodeId::new("src"),
            source: Box::new(InlineSource::new(
                (1 ..= 5_i64).map(|id| raw_from(&[("id", json!(id))])).collect(),
                SchemaContract::new(ContractMode::Observed),
            )),
            steps,
            sinks: vec![SinkBinding {
                name: SinkName::new("out"),
                node_id: NodeId::new("out"),
                plugin: sink,
            }],
            default_sink: SinkName::new("out"),
            route_plan: RoutePlan::default(),
            node_registrations: registrations,
            config_hash: hash_canonical_json(
                DEFAULT_HASH_ALGORITHM,
                &json!({ "scenario": "topology" }),
            )
            .expect("config hash"),
        }
    };

    let report = orchestrator
        .run(two_transforms(Box::new(FailingCsvSink::new(output.clone(), 2)), false))
        .expect("run");
    assert_eq!(report.status, RunStatus::Failed);
    let outcomes_before = run_outcomes(&landscape, report.run_id).len();

    // Resume with a third transform: hard refusal, nothing processed.
    let result = orchestrator.resume(
        report.run_id,
        two_transforms(Box::new(CsvSink::new(output)), true),
    );
    assert!(matches!(result, Err(OrchestratorError::CheckpointIncompatible(_))));
    assert_eq!(run_outcomes(&landscape, report.run_id).len(), outcomes_before);
}

#[test]
fn fingerprint_key_boundary_fails_closed() {
    let dir = TempDir::new().expect("tempdir");
    let (landscape, payload) = stores(&dir);
    let telemetry = NoopTelemetry;
    let clock = SystemClock;
    let orchestrator = Orchestrator::new(
        &landscape,
        &payload,
        &telemetry,
        &clock,
        OrchestratorSettings::default(),
    );
    let (sink, _handle) = {
        let sink = MemorySink::new();
        let handle = sink.handle();
        (Box::new(sink), handle)
    };
    let report = orchestrator
        .run(linear_pipeline(vec![&[("id", json!(1))]], sink))
        .expect("run");

    // An empty static key is refused at provider construction time.
    let empty = StaticSecretsProvider::new(Vec::new(), None);
    let result = landscape.export_run(report.run_id, &empty);
    assert!(matches!(result, Err(LandscapeError::FingerprintKeyUnavailable(_))));

    // A configured key signs successfully.
    let secrets = StaticSecretsProvider::new(b"key".to_vec(), Some("k1".to_string()));
    let export = landscape.export_run(report.run_id, &secrets).expect("export");
    assert_eq!(export.key_id.as_deref(), Some("k1"));
}
