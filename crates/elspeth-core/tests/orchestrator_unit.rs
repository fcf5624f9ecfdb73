// crates/elspeth-core/tests/orchestrator_unit.rs
// ============================================================================
// Module: Orchestrator Tests
// Description: Run lifecycle over the in-memory landscape and payload store.
// ============================================================================
//! ## Overview
//! Drives full runs through the orchestrator: happy path with outcomes and
//! checkpoint cleanup, quarantine routing, partial sink failure leaving
//! rows resumable, resume that reprocesses exactly the unwritten rows, and
//! the checkpoint compatibility lock.

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

mod common;

use common::CollectSink;
use common::CollectedStore;
use common::MapPayloadStore;
use common::VecSource;
use common::raw_from;
use common::registration;
use common::transform_step;
use elspeth_core::ErrorSinkTarget;
use elspeth_core::Landscape;
use elspeth_core::ManualClock;
use elspeth_core::MemoryLandscape;
use elspeth_core::NodeId;
use elspeth_core::NodeType;
use elspeth_core::NoopTelemetry;
use elspeth_core::Orchestrator;
use elspeth_core::OrchestratorError;
use elspeth_core::OrchestratorSettings;
use elspeth_core::OutcomeKind;
use elspeth_core::Pipeline;
use elspeth_core::PipelineStep;
use elspeth_core::QuarantinedRow;
use elspeth_core::RoutePlan;
use elspeth_core::RunStatus;
use elspeth_core::SinkBinding;
use elspeth_core::SinkName;
use elspeth_core::SourceRow;
use elspeth_core::TransformResult;
use elspeth_core::hashing::DEFAULT_HASH_ALGORITHM;
use elspeth_core::hashing::hash_canonical_json;
use serde_json::json;

/// Builds a linear pipeline `src -> t1 -> out` over a vector source.
fn linear_pipeline(
    source: VecSource,
    sink: CollectSink,
    steps: Vec<PipelineStep>,
) -> Pipeline {
    let mut registrations = vec![
        registration("src", NodeType::Source),
        registration("out", NodeType::Sink),
    ];
    for step in &steps {
        registrations.push(registration(step.node_id.as_str(), NodeType::Transform));
    }
    Pipeline {
        source_node: NodeId::new("src"),
        source: Box::new(source),
        steps,
        sinks: vec![SinkBinding {
            name: SinkName::new("out"),
            node_id: NodeId::new("out"),
            plugin: Box::new(sink),
        }],
        default_sink: SinkName::new("out"),
        route_plan: RoutePlan::default(),
        node_registrations: registrations,
        config_hash: hash_canonical_json(DEFAULT_HASH_ALGORITHM, &json!({ "pipeline": "test" }))
            .expect("config hash"),
    }
}

#[test]
fn happy_path_records_outcomes_and_clears_checkpoints() {
    let landscape = MemoryLandscape::new();
    let payload = MapPayloadStore::new();
    let telemetry = NoopTelemetry;
    let clock = ManualClock::starting_at(0);
    let orchestrator = Orchestrator::new(
        &landscape,
        &payload,
        &telemetry,
        &clock,
        OrchestratorSettings::default(),
    );
    let source = VecSource::of_valid(vec![
        raw_from(&[("id", json!(1))]),
        raw_from(&[("id", json!(2))]),
        raw_from(&[("id", json!(3))]),
    ]);
    let (sink, store) = CollectSink::new();
    let pipeline = linear_pipeline(source, sink, vec![transform_step("t1", TransformResult::Success)]);

    let report = orchestrator.run(pipeline).expect("run");
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.counters.rows_admitted, 3);
    assert_eq!(report.counters.tokens_written, 3);

    // Three completed outcomes naming the sink.
    let completed: Vec<_> = landscape
        .outcomes()
        .into_iter()
        .filter(|record| record.outcome == OutcomeKind::Completed)
        .collect();
    assert_eq!(completed.len(), 3);
    assert!(
        completed
            .iter()
            .all(|record| record.context.sink_name == Some(SinkName::new("out")))
    );

    // Checkpoints deleted on clean completion.
    assert!(landscape.list_checkpoints(report.run_id).expect("list").is_empty());

    // Sink saw the rows in admission order.
    let written = store.lock().expect("store lock");
    assert_eq!(written.len(), 3);
    assert_eq!(written[0].payload, json!({ "id": 1 }));
    assert_eq!(written[2].payload, json!({ "id": 3 }));
}

#[test]
fn quarantined_rows_route_to_the_configured_sink() {
    let landscape = MemoryLandscape::new();
    let payload = MapPayloadStore::new();
    let telemetry = NoopTelemetry;
    let clock = ManualClock::starting_at(0);
    let orchestrator = Orchestrator::new(
        &landscape,
        &payload,
        &telemetry,
        &clock,
        OrchestratorSettings::default(),
    );
    let source = VecSource::of_results(vec![
        Ok(SourceRow::Valid {
            raw: raw_from(&[("id", json!(1))]),
            contract: None,
        }),
        Ok(SourceRow::Quarantined {
            row: QuarantinedRow {
                raw: json!("not,an,object"),
                error: "unparsable line".to_string(),
            },
            destination: None,
        }),
    ]);
    let (sink, _out_store) = CollectSink::new();
    let (quarantine_sink, quarantine_store): (CollectSink, CollectedStore) = CollectSink::new();
    let mut pipeline = linear_pipeline(source, sink, vec![]);
    pipeline.node_registrations.push(registration("quarantine", NodeType::Sink));
    pipeline.sinks.push(SinkBinding {
        name: SinkName::new("quarantine"),
        node_id: NodeId::new("quarantine"),
        plugin: Box::new(quarantine_sink),
    });
    pipeline.route_plan.source_quarantine =
        Some(ErrorSinkTarget::Sink(SinkName::new("quarantine")));

    let report = orchestrator.run(pipeline).expect("run");
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.counters.rows_admitted, 1);
    assert_eq!(report.counters.rows_quarantined, 1);

    let quarantined = quarantine_store.lock().expect("store lock");
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].payload["error"], json!("unparsable line"));

    let outcome_kinds: Vec<OutcomeKind> =
        landscape.outcomes().into_iter().map(|record| record.outcome).collect();
    assert!(outcome_kinds.contains(&OutcomeKind::Quarantined));
}

#[test]
fn partial_sink_failure_leaves_rows_resumable() {
    let landscape = MemoryLandscape::new();
    let payload = MapPayloadStore::new();
    let telemetry = NoopTelemetry;
    let clock = ManualClock::starting_at(0);
    let orchestrator = Orchestrator::new(
        &landscape,
        &payload,
        &telemetry,
        &clock,
        OrchestratorSettings::default(),
    );
    let source = VecSource::of_valid(vec![
        raw_from(&[("id", json!(1))]),
        raw_from(&[("id", json!(2))]),
        raw_from(&[("id", json!(3))]),
    ]);
    // The sink confirms two tokens and fails on the third.
    let (sink, store) = CollectSink::failing_after(2);
    let pipeline = linear_pipeline(source, sink, vec![]);

    let report = orchestrator.run(pipeline).expect("run");
    assert_eq!(report.status, RunStatus::Failed);

    // Two durable outcomes and checkpoints; the third row has neither.
    let completed = landscape
        .outcomes()
        .into_iter()
        .filter(|record| record.outcome == OutcomeKind::Completed)
        .count();
    assert_eq!(completed, 2);
    let checkpoints = landscape.list_checkpoints(report.run_id).expect("list");
    assert_eq!(checkpoints.len(), 2);
    assert_eq!(checkpoints[0].request.node_id, NodeId::new("out"));

    let unprocessed = landscape.get_unprocessed_row_ids(report.run_id).expect("unprocessed");
    assert_eq!(unprocessed.len(), 1);

    // Resume with an identical pipeline reprocesses exactly that row.
    let resume_source = VecSource::of_valid(vec![]);
    let (resume_sink, resume_store) = CollectSink::new();
    let resume_pipeline = linear_pipeline(resume_source, resume_sink, vec![]);
    let resume_report =
        orchestrator.resume(report.run_id, resume_pipeline).expect("resume");
    assert_eq!(resume_report.status, RunStatus::Completed);
    assert_eq!(resume_report.counters.rows_admitted, 1);
    assert_eq!(resume_report.counters.tokens_written, 1);
    let resumed = resume_store.lock().expect("store lock");
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].payload, json!({ "id": 3 }));
    drop(resumed);
    drop(store);

    // After resume, nothing is left unprocessed and checkpoints are gone.
    assert!(landscape.get_unprocessed_row_ids(report.run_id).expect("query").is_empty());
    assert!(landscape.list_checkpoints(report.run_id).expect("list").is_empty());
}

#[test]
fn resume_refuses_a_changed_topology() {
    let landscape = MemoryLandscape::new();
    let payload = MapPayloadStore::new();
    let telemetry = NoopTelemetry;
    let clock = ManualClock::starting_at(0);
    let orchestrator = Orchestrator::new(
        &landscape,
        &payload,
        &telemetry,
        &clock,
        OrchestratorSettings::default(),
    );
    let source = VecSource::of_valid(vec![
        raw_from(&[("id", json!(1))]),
        raw_from(&[("id", json!(2))]),
        raw_from(&[("id", json!(3))]),
    ]);
    let (sink, _store) = CollectSink::failing_after(2);
    let pipeline = linear_pipeline(source, sink, vec![transform_step("t1", TransformResult::Success)]);
    let report = orchestrator.run(pipeline).expect("run");
    assert_eq!(report.status, RunStatus::Failed);
    let outcomes_before = landscape.outcomes().len();

    // Same run, one more transform: the topology hash no longer matches.
    let resume_source = VecSource::of_valid(vec![]);
    let (resume_sink, _resume_store) = CollectSink::new();
    let resume_pipeline = linear_pipeline(resume_source, resume_sink, vec![
        transform_step("t1", TransformResult::Success),
        transform_step("t2", TransformResult::Success),
    ]);
    let result = orchestrator.resume(report.run_id, resume_pipeline);
    assert!(matches!(result, Err(OrchestratorError::CheckpointIncompatible(_))));
    // No rows were processed by the refused resume.
    assert_eq!(landscape.outcomes().len(), outcomes_before);
}

#[test]
fn cancellation_flushes_and_fails_the_run() {
    let landscape = MemoryLandscape::new();
    let payload = MapPayloadStore::new();
    let telemetry = NoopTelemetry;
    let clock = ManualClock::starting_at(0);
    let orchestrator = Orchestrator::new(
        &landscape,
        &payload,
        &telemetry,
        &clock,
        OrchestratorSettings::default(),
    );
    let source = VecSource::of_results(vec![
        Ok(SourceRow::Valid {
            raw: raw_from(&[("id", json!(1))]),
            contract: None,
        }),
        Err(elspeth_core::SourceError::Cancelled("operator stop".to_string())),
        Ok(SourceRow::Valid {
            raw: raw_from(&[("id", json!(2))]),
            contract: None,
        }),
    ]);
    let (sink, store) = CollectSink::new();
    let pipeline = linear_pipeline(source, sink, vec![]);
    let report = orchestrator.run(pipeline).expect("run");

    // Admission stopped at the cancellation; the first row still wrote.
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.counters.rows_admitted, 1);
    assert_eq!(store.lock().expect("store lock").len(), 1);
    // Checkpoints stay in place for a later resume.
    assert_eq!(landscape.list_checkpoints(report.run_id).expect("list").len(), 1);
}

#[test]
fn purged_payload_is_fatal_on_resume() {
    let landscape = MemoryLandscape::new();
    let payload = MapPayloadStore::new();
    let telemetry = NoopTelemetry;
    let clock = ManualClock::starting_at(0);
    let orchestrator = Orchestrator::new(
        &landscape,
        &payload,
        &telemetry,
        &clock,
        OrchestratorSettings::default(),
    );
    let source = VecSource::of_valid(vec![
        raw_from(&[("id", json!(1))]),
        raw_from(&[("id", json!(2))]),
    ]);
    let (sink, _store) = CollectSink::failing_after(1);
    let pipeline = linear_pipeline(source, sink, vec![]);
    let report = orchestrator.run(pipeline).expect("run");
    assert_eq!(report.status, RunStatus::Failed);

    // Purge the unwritten row's payload, then attempt resume.
    let unprocessed = landscape.get_unprocessed_row_ids(report.run_id).expect("unprocessed");
    let rows = landscape.get_rows(report.run_id, &unprocessed).expect("rows");
    payload.purge(&elspeth_core::PayloadHash::new(rows[0].source_data_ref.clone()));

    let resume_source = VecSource::of_valid(vec![]);
    let (resume_sink, _resume_store) = CollectSink::new();
    let resume_pipeline = linear_pipeline(resume_source, resume_sink, vec![]);
    let result = orchestrator.resume(report.run_id, resume_pipeline);
    assert!(matches!(
        result,
        Err(OrchestratorError::Payload(elspeth_core::PayloadError::Purged(_)))
    ));
    // The refused resume marked the run failed again, not completed.
    let run = landscape.get_run(report.run_id).expect("query").expect("run");
    assert_eq!(run.status, RunStatus::Failed);
}
