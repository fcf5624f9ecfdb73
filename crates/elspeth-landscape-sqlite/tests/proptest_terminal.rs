// crates/elspeth-landscape-sqlite/tests/proptest_terminal.rs
// ============================================================================
// Module: Terminal Uniqueness Property Tests
// Description: At most one terminal outcome per token, for any sequence.
// ============================================================================
//! ## Overview
//! Property: for any sequence of outcome kinds recorded against one token,
//! every kind up to and including the first terminal is accepted and every
//! terminal after it raises `DuplicateTerminalOutcome`. Non-terminal
//! records after a terminal remain accepted (the ledger stays append-only).

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

use elspeth_core::Landscape;
use elspeth_core::LandscapeError;
use elspeth_core::NewRow;
use elspeth_core::NodeId;
use elspeth_core::OutcomeContext;
use elspeth_core::OutcomeKind;
use elspeth_core::RunConfig;
use elspeth_core::Timestamp;
use elspeth_core::hashing::DEFAULT_HASH_ALGORITHM;
use elspeth_core::hashing::hash_bytes;
use elspeth_landscape_sqlite::SqliteLandscape;
use proptest::prelude::*;

/// All outcome kinds, for strategy sampling.
const KINDS: [OutcomeKind; 9] = [
    OutcomeKind::Completed,
    OutcomeKind::Routed,
    OutcomeKind::Forked,
    OutcomeKind::Coalesced,
    OutcomeKind::Expanded,
    OutcomeKind::Buffered,
    OutcomeKind::ConsumedInBatch,
    OutcomeKind::Failed,
    OutcomeKind::Quarantined,
];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn at_most_one_terminal_outcome_per_token(
        sequence in proptest::collection::vec(0_usize .. KINDS.len(), 1 .. 12)
    ) {
        let store = SqliteLandscape::open_in_memory().expect("store");
        let run_id = store
            .begin_run(&RunConfig {
                config_hash: hash_bytes(DEFAULT_HASH_ALGORITHM, b"config"),
                canonical_version: "1".to_string(),
                started_at: Timestamp::from_unix_millis(0),
            })
            .expect("begin run")
            .run_id;
        let row_id = store
            .create_row(&NewRow {
                run_id,
                source_node_id: NodeId::new("src"),
                row_index: 0,
                source_data_hash: hash_bytes(DEFAULT_HASH_ALGORITHM, b"row"),
                source_data_ref: "ref".to_string(),
                created_at: Timestamp::from_unix_millis(0),
            })
            .expect("row");
        let token_id = store
            .create_token(row_id, None, None, Timestamp::from_unix_millis(0))
            .expect("token");

        let mut terminal_recorded = false;
        for (stamp, index) in sequence.into_iter().enumerate() {
            let kind = KINDS[index];
            let result = store.record_token_outcome(
                run_id,
                token_id,
                kind,
                &OutcomeContext::default(),
                Timestamp::from_unix_millis(i64::try_from(stamp).expect("stamp fits")),
            );
            if kind.is_terminal() && terminal_recorded {
                let is_duplicate_terminal =
                    matches!(result, Err(LandscapeError::DuplicateTerminalOutcome { .. }));
                prop_assert!(is_duplicate_terminal);
            } else {
                prop_assert!(result.is_ok());
                terminal_recorded |= kind.is_terminal();
            }
        }
    }
}
