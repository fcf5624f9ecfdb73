// crates/elspeth-core/tests/batch_adapter.rs
// ============================================================================
// Module: Shared Batch Adapter Tests
// Description: Pool ordering and rendez-vous coordination, event-driven.
// ============================================================================
//! ## Overview
//! Verifies that the worker pool returns results in input-position order
//! regardless of completion order, and that rendez-vous channels deliver
//! exactly once per `(token, state)` key. Coordination uses explicit
//! signalling primitives, never wall-clock delays.

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
use std::sync::mpsc;
use std::thread;

use elspeth_core::BatchAdapterError;
use elspeth_core::BatchWorkerPool;
use elspeth_core::RendezvousRegistry;
use elspeth_core::SharedBatchAdapter;
use elspeth_core::StateId;
use elspeth_core::TokenId;

fn token(raw: u64) -> TokenId {
    TokenId::from_raw(raw).expect("nonzero token")
}

fn state(raw: u64) -> StateId {
    StateId::from_raw(raw).expect("nonzero state")
}

#[test]
fn pool_requires_at_least_one_worker() {
    assert!(matches!(BatchWorkerPool::new(0), Err(BatchAdapterError::NoWorkers)));
    assert_eq!(BatchWorkerPool::new(4).expect("pool").workers(), 4);
}

#[test]
fn pool_returns_results_in_input_order() {
    let pool = BatchWorkerPool::new(2).expect("pool");
    // Two jobs with a strict completion inversion: job 0 blocks until job 1
    // signals, so job 1 always finishes first.
    let (first_may_finish, first_gate) = mpsc::channel::<()>();
    let jobs: Vec<Box<dyn FnOnce() -> usize + Send>> = vec![
        Box::new(move || {
            first_gate.recv().expect("gate signal");
            0
        }),
        Box::new(move || {
            first_may_finish.send(()).expect("signal first job");
            1
        }),
    ];
    let results = pool.dispatch(jobs);
    assert_eq!(results, vec![0, 1]);
}

#[test]
fn pool_handles_more_jobs_than_workers() {
    let pool = BatchWorkerPool::new(3).expect("pool");
    let jobs: Vec<Box<dyn FnOnce() -> usize + Send>> =
        (0 .. 32_usize).map(|index| Box::new(move || index * 2) as Box<dyn FnOnce() -> usize + Send>).collect();
    let results = pool.dispatch(jobs);
    assert_eq!(results, (0 .. 32).map(|index| index * 2).collect::<Vec<_>>());
}

#[test]
fn rendezvous_delivers_to_the_registered_waiter() {
    let registry: Arc<RendezvousRegistry<u32>> = Arc::new(RendezvousRegistry::new());
    let receiver = registry.register(token(1), state(1)).expect("register");
    assert_eq!(registry.waiter_count(), 1);

    let completer = Arc::clone(&registry);
    let handle = thread::spawn(move || completer.complete(token(1), state(1), 42));
    assert_eq!(receiver.recv().expect("result"), 42);
    handle.join().expect("join").expect("complete");
    assert_eq!(registry.waiter_count(), 0);
}

#[test]
fn duplicate_registration_is_rejected() {
    let registry: RendezvousRegistry<u32> = RendezvousRegistry::new();
    let _receiver = registry.register(token(1), state(1)).expect("register");
    assert!(matches!(
        registry.register(token(1), state(1)),
        Err(BatchAdapterError::DuplicateWaiter { .. })
    ));
    // A different state on the same token is its own slot.
    assert!(registry.register(token(1), state(2)).is_ok());
}

#[test]
fn completing_an_unknown_waiter_fails() {
    let registry: RendezvousRegistry<u32> = RendezvousRegistry::new();
    assert!(matches!(
        registry.complete(token(9), state(9), 1),
        Err(BatchAdapterError::UnknownWaiter { .. })
    ));
}

#[test]
fn adapter_combines_pool_and_registry() {
    let adapter: SharedBatchAdapter<u32> = SharedBatchAdapter::new(2).expect("adapter");
    assert_eq!(adapter.pool().workers(), 2);
    assert_eq!(adapter.registry().waiter_count(), 0);
}
