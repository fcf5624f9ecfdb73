// crates/elspeth-landscape-sqlite/tests/landscape_unit.rs
// ============================================================================
// Module: SQLite Landscape Integrity Tests
// Description: Durability pragmas, ledger invariants, batches, checkpoints.
// ============================================================================
//! ## Overview
//! Unit-level tests for the durable recorder:
//! - Durability pragmas applied on every construction path
//! - Terminal outcome uniqueness via the partial unique index
//! - Outcome-then-checkpoint ordering
//! - Batch lifecycle and retry attempts
//! - Unprocessed-row recovery query

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

use elspeth_core::BatchMemberRole;
use elspeth_core::BatchStatus;
use elspeth_core::CheckpointRequest;
use elspeth_core::Landscape;
use elspeth_core::LandscapeError;
use elspeth_core::NewRow;
use elspeth_core::NodeId;
use elspeth_core::OutcomeContext;
use elspeth_core::OutcomeKind;
use elspeth_core::RowId;
use elspeth_core::RunConfig;
use elspeth_core::RunId;
use elspeth_core::RunStatus;
use elspeth_core::SinkName;
use elspeth_core::Timestamp;
use elspeth_core::TokenId;
use elspeth_core::TriggerReason;
use elspeth_core::hashing::DEFAULT_HASH_ALGORITHM;
use elspeth_core::hashing::hash_bytes;
use elspeth_landscape_sqlite::SqliteLandscape;
use elspeth_landscape_sqlite::SqliteLandscapeConfig;
use elspeth_landscape_sqlite::SqliteLandscapeError;
use serde_json::json;
use tempfile::TempDir;

fn begin_run(store: &SqliteLandscape) -> RunId {
    store
        .begin_run(&RunConfig {
            config_hash: hash_bytes(DEFAULT_HASH_ALGORITHM, b"config"),
            canonical_version: "1".to_string(),
            started_at: Timestamp::from_unix_millis(0),
        })
        .expect("begin run")
        .run_id
}

fn admit(store: &SqliteLandscape, run_id: RunId, index: u64) -> (RowId, TokenId) {
    let row_id = store
        .create_row(&NewRow {
            run_id,
            source_node_id: NodeId::new("src"),
            row_index: index,
            source_data_hash: hash_bytes(DEFAULT_HASH_ALGORITHM, b"row"),
            source_data_ref: format!("ref-{index}"),
            created_at: Timestamp::from_unix_millis(0),
        })
        .expect("create row");
    let token_id =
        store.create_token(row_id, None, None, Timestamp::from_unix_millis(0)).expect("token");
    (row_id, token_id)
}

#[test]
fn durability_pragmas_apply_on_every_construction_path() {
    // Default file path.
    let dir = TempDir::new().expect("tempdir");
    let config = SqliteLandscapeConfig::for_path(dir.path().join("landscape.db"));
    let store = SqliteLandscape::open(&config).expect("open file store");
    let (foreign_keys, journal_mode) = store.durability_pragmas().expect("pragmas");
    assert!(foreign_keys);
    assert_eq!(journal_mode, "wal");

    // URL-based path.
    let url = format!("file:{}", dir.path().join("url.db").display());
    let url_store = SqliteLandscape::open_url(
        &url,
        &SqliteLandscapeConfig::for_path(dir.path().join("url.db")),
    )
    .expect("open url store");
    let (foreign_keys, journal_mode) = url_store.durability_pragmas().expect("pragmas");
    assert!(foreign_keys);
    assert_eq!(journal_mode, "wal");

    // In-memory path: foreign keys still enforced; SQLite reports the
    // memory journal for transient databases.
    let memory = SqliteLandscape::open_in_memory().expect("open memory store");
    let (foreign_keys, journal_mode) = memory.durability_pragmas().expect("pragmas");
    assert!(foreign_keys);
    assert_eq!(journal_mode, "memory");
}

#[test]
fn store_path_must_not_be_a_directory() {
    let dir = TempDir::new().expect("tempdir");
    let config = SqliteLandscapeConfig::for_path(dir.path());
    assert!(matches!(
        SqliteLandscape::open(&config),
        Err(SqliteLandscapeError::Invalid(_))
    ));
}

#[test]
fn second_terminal_outcome_is_rejected() {
    let store = SqliteLandscape::open_in_memory().expect("store");
    let run_id = begin_run(&store);
    let (_, token_id) = admit(&store, run_id, 0);

    store
        .record_token_outcome(
            run_id,
            token_id,
            OutcomeKind::Completed,
            &OutcomeContext {
                sink_name: Some(SinkName::new("a")),
                ..OutcomeContext::default()
            },
            Timestamp::from_unix_millis(1),
        )
        .expect("first terminal outcome");

    let second = store.record_token_outcome(
        run_id,
        token_id,
        OutcomeKind::Routed,
        &OutcomeContext {
            sink_name: Some(SinkName::new("b")),
            ..OutcomeContext::default()
        },
        Timestamp::from_unix_millis(2),
    );
    assert!(matches!(
        second,
        Err(LandscapeError::DuplicateTerminalOutcome { token_id: duplicate })
            if duplicate == token_id
    ));
}

#[test]
fn buffered_outcomes_do_not_block_a_terminal() {
    let store = SqliteLandscape::open_in_memory().expect("store");
    let run_id = begin_run(&store);
    let (_, token_id) = admit(&store, run_id, 0);

    for stamp in 1 ..= 2 {
        store
            .record_token_outcome(
                run_id,
                token_id,
                OutcomeKind::Buffered,
                &OutcomeContext::default(),
                Timestamp::from_unix_millis(stamp),
            )
            .expect("buffered outcome");
    }
    store
        .record_token_outcome(
            run_id,
            token_id,
            OutcomeKind::ConsumedInBatch,
            &OutcomeContext::default(),
            Timestamp::from_unix_millis(3),
        )
        .expect("terminal after buffered");

    // Latest is terminal-preferred.
    let outcome = store.get_token_outcome(token_id).expect("query").expect("outcome");
    assert_eq!(outcome.outcome, OutcomeKind::ConsumedInBatch);
    assert!(outcome.is_terminal);
}

#[test]
fn checkpoint_requires_a_terminal_outcome() {
    let store = SqliteLandscape::open_in_memory().expect("store");
    let run_id = begin_run(&store);
    let (_, token_id) = admit(&store, run_id, 0);
    let request = CheckpointRequest {
        run_id,
        token_id,
        node_id: NodeId::new("out"),
        upstream_topology_hash: hash_bytes(DEFAULT_HASH_ALGORITHM, b"topo"),
        checkpoint_node_config_hash: hash_bytes(DEFAULT_HASH_ALGORITHM, b"sink"),
        aggregation_state_json: None,
        format_version: 1,
        created_at: Timestamp::from_unix_millis(1),
    };
    // No outcome yet: the checkpoint is refused.
    assert!(store.create_checkpoint(&request).is_err());

    store
        .record_token_outcome(
            run_id,
            token_id,
            OutcomeKind::Completed,
            &OutcomeContext::default(),
            Timestamp::from_unix_millis(1),
        )
        .expect("terminal outcome");
    let record = store.create_checkpoint(&request).expect("checkpoint");
    assert_eq!(record.sequence_number, 1);

    let listed = store.list_checkpoints(run_id).expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].request.node_id, NodeId::new("out"));

    assert_eq!(store.delete_checkpoints(run_id).expect("delete"), 1);
    assert!(store.list_checkpoints(run_id).expect("list").is_empty());
}

#[test]
fn checkpoint_sequence_numbers_are_monotonic() {
    let store = SqliteLandscape::open_in_memory().expect("store");
    let run_id = begin_run(&store);
    for index in 0 .. 3 {
        let (_, token_id) = admit(&store, run_id, index);
        store
            .record_token_outcome(
                run_id,
                token_id,
                OutcomeKind::Completed,
                &OutcomeContext::default(),
                Timestamp::from_unix_millis(1),
            )
            .expect("outcome");
        store
            .create_checkpoint(&CheckpointRequest {
                run_id,
                token_id,
                node_id: NodeId::new("out"),
                upstream_topology_hash: hash_bytes(DEFAULT_HASH_ALGORITHM, b"topo"),
                checkpoint_node_config_hash: hash_bytes(DEFAULT_HASH_ALGORITHM, b"sink"),
                aggregation_state_json: Some(json!({ "buffers": {} })),
                format_version: 1,
                created_at: Timestamp::from_unix_millis(1),
            })
            .expect("checkpoint");
    }
    let sequences: Vec<u64> = store
        .list_checkpoints(run_id)
        .expect("list")
        .into_iter()
        .map(|checkpoint| checkpoint.sequence_number)
        .collect();
    assert_eq!(sequences, vec![1, 2, 3]);
}

#[test]
fn batch_lifecycle_tracks_status_and_attempts() {
    let store = SqliteLandscape::open_in_memory().expect("store");
    let run_id = begin_run(&store);
    let (_, token_id) = admit(&store, run_id, 0);
    let batch_id = store
        .create_batch(run_id, &NodeId::new("agg"), Timestamp::from_unix_millis(0))
        .expect("batch");
    store.add_batch_member(batch_id, token_id, BatchMemberRole::Input).expect("member");

    let incomplete = store.get_incomplete_batches(run_id).expect("incomplete");
    assert_eq!(incomplete.len(), 1);
    assert_eq!(incomplete[0].status, BatchStatus::Draft);
    assert_eq!(incomplete[0].attempt, 1);

    assert_eq!(store.retry_batch(batch_id).expect("retry"), 2);

    store
        .update_batch_status(
            batch_id,
            BatchStatus::Completed,
            Some(TriggerReason::Count),
            Some(Timestamp::from_unix_millis(5)),
            None,
        )
        .expect("complete batch");
    assert!(store.get_incomplete_batches(run_id).expect("incomplete").is_empty());

    let members = store.get_batch_members(batch_id).expect("members");
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].role, BatchMemberRole::Input);
}

#[test]
fn unprocessed_rows_exclude_terminal_and_checkpointed() {
    let store = SqliteLandscape::open_in_memory().expect("store");
    let run_id = begin_run(&store);

    // Row 0: terminal outcome plus checkpoint (fully durable).
    let (_, done) = admit(&store, run_id, 0);
    store
        .record_token_outcome(
            run_id,
            done,
            OutcomeKind::Completed,
            &OutcomeContext::default(),
            Timestamp::from_unix_millis(1),
        )
        .expect("outcome");
    store
        .create_checkpoint(&CheckpointRequest {
            run_id,
            token_id: done,
            node_id: NodeId::new("out"),
            upstream_topology_hash: hash_bytes(DEFAULT_HASH_ALGORITHM, b"topo"),
            checkpoint_node_config_hash: hash_bytes(DEFAULT_HASH_ALGORITHM, b"sink"),
            aggregation_state_json: None,
            format_version: 1,
            created_at: Timestamp::from_unix_millis(1),
        })
        .expect("checkpoint");

    // Row 1: buffered only (non-terminal).
    let (buffered_row, buffered) = admit(&store, run_id, 1);
    store
        .record_token_outcome(
            run_id,
            buffered,
            OutcomeKind::Buffered,
            &OutcomeContext::default(),
            Timestamp::from_unix_millis(1),
        )
        .expect("buffered");

    // Row 2: nothing recorded.
    let (untouched_row, _) = admit(&store, run_id, 2);

    let unprocessed = store.get_unprocessed_row_ids(run_id).expect("unprocessed");
    assert_eq!(unprocessed, vec![buffered_row, untouched_row]);

    // Row metadata comes back in admission order.
    let rows = store.get_rows(run_id, &unprocessed).expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].row_index, 1);
    assert_eq!(rows[1].row_index, 2);

    // The initial token is the parentless, unbranched one.
    assert_eq!(store.get_initial_token(buffered_row).expect("initial"), Some(buffered));
}

#[test]
fn run_lifecycle_round_trips() {
    let store = SqliteLandscape::open_in_memory().expect("store");
    let run_id = begin_run(&store);
    let run = store.get_run(run_id).expect("query").expect("run");
    assert_eq!(run.status, RunStatus::Running);

    store
        .complete_run(run_id, RunStatus::Failed, Timestamp::from_unix_millis(9))
        .expect("complete");
    let run = store.get_run(run_id).expect("query").expect("run");
    assert_eq!(run.status, RunStatus::Failed);

    let runs = store.list_runs().expect("list");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, run_id);
}
