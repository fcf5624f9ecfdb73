// crates/elspeth-core/src/runtime/batch.rs
// ============================================================================
// Module: Elspeth Shared Batch Adapter
// Description: Bounded worker pool and rendez-vous coordination for batches.
// Purpose: Dispatch external calls in parallel with deterministic ordering.
// Dependencies: crate::core::identifiers, thiserror
// ============================================================================

//! ## Overview
//! Batch-aware transforms may dispatch external calls (for example LLM
//! requests) through a bounded worker pool. Results are returned in input
//! position order regardless of completion order; the orchestrator never
//! reorders. Waiters coordinate through per-`(token_id, state_id)`
//! rendez-vous channels. Synchronization is event-based, never sleep-based;
//! tests drive these components with explicit signalling.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::SyncSender;
use std::thread;

use thiserror::Error;

use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Batch adapter errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum BatchAdapterError {
    /// The worker pool was configured with zero workers.
    #[error("worker pool requires at least one worker")]
    NoWorkers,
    /// A waiter is already registered for the key.
    #[error("duplicate waiter for token {token_id} state {state_id}")]
    DuplicateWaiter {
        /// Token of the duplicate registration.
        token_id: TokenId,
        /// State of the duplicate registration.
        state_id: StateId,
    },
    /// No waiter is registered for the key.
    #[error("unknown waiter for token {token_id} state {state_id}")]
    UnknownWaiter {
        /// Token of the missing registration.
        token_id: TokenId,
        /// State of the missing registration.
        state_id: StateId,
    },
    /// The waiter hung up before the result arrived.
    #[error("waiter disconnected for token {token_id} state {state_id}")]
    Disconnected {
        /// Token of the disconnected waiter.
        token_id: TokenId,
        /// State of the disconnected waiter.
        state_id: StateId,
    },
}

// ============================================================================
// SECTION: Worker Pool
// ============================================================================

/// Bounded worker pool with position-ordered results.
///
/// # Invariants
/// - `dispatch` returns results keyed by input position, regardless of
///   completion order.
#[derive(Debug, Clone, Copy)]
pub struct BatchWorkerPool {
    /// Number of workers used per dispatch.
    workers: usize,
}

impl BatchWorkerPool {
    /// Creates a pool with the declared worker count.
    ///
    /// # Errors
    ///
    /// Returns [`BatchAdapterError::NoWorkers`] when `workers` is zero.
    pub const fn new(workers: usize) -> Result<Self, BatchAdapterError> {
        if workers == 0 {
            return Err(BatchAdapterError::NoWorkers);
        }
        Ok(Self {
            workers,
        })
    }

    /// Returns the configured worker count.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Runs all jobs on the pool, returning results in input order.
    pub fn dispatch<T, F>(&self, jobs: Vec<F>) -> Vec<T>
    where
        T: Send,
        F: FnOnce() -> T + Send,
    {
        let total = jobs.len();
        if total == 0 {
            return Vec::new();
        }
        let queue: Mutex<VecDeque<(usize, F)>> = Mutex::new(jobs.into_iter().enumerate().collect());
        let slots: Mutex<Vec<Option<T>>> =
            Mutex::new(std::iter::repeat_with(|| None).take(total).collect());
        let worker_count = self.workers.min(total);
        thread::scope(|scope| {
            for _ in 0 .. worker_count {
                scope.spawn(|| {
                    loop {
                        let next = {
                            let mut guard =
                                queue.lock().unwrap_or_else(PoisonError::into_inner);
                            guard.pop_front()
                        };
                        let Some((index, job)) = next else {
                            break;
                        };
                        let result = job();
                        let mut guard = slots.lock().unwrap_or_else(PoisonError::into_inner);
                        if let Some(slot) = guard.get_mut(index) {
                            *slot = Some(result);
                        }
                    }
                });
            }
        });
        slots
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .flatten()
            .collect()
    }
}

// ============================================================================
// SECTION: Rendez-vous Registry
// ============================================================================

/// Per-`(token, state)` rendez-vous channels between callers and completers.
///
/// # Invariants
/// - Channels are zero-capacity: `complete` blocks until the waiter picks
///   the result up (event-based, never sleep-based).
#[derive(Debug)]
pub struct RendezvousRegistry<T> {
    /// Registered waiters keyed by `(token, state)`.
    slots: Mutex<BTreeMap<(TokenId, StateId), SyncSender<T>>>,
}

impl<T> Default for RendezvousRegistry<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<T> RendezvousRegistry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter, returning the receiver it blocks on.
    ///
    /// # Errors
    ///
    /// Returns [`BatchAdapterError::DuplicateWaiter`] when the key is
    /// already registered.
    pub fn register(
        &self,
        token_id: TokenId,
        state_id: StateId,
    ) -> Result<Receiver<T>, BatchAdapterError> {
        let mut guard = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.contains_key(&(token_id, state_id)) {
            return Err(BatchAdapterError::DuplicateWaiter {
                token_id,
                state_id,
            });
        }
        let (sender, receiver) = mpsc::sync_channel(0);
        guard.insert((token_id, state_id), sender);
        Ok(receiver)
    }

    /// Delivers a result to the registered waiter and removes the slot.
    ///
    /// Blocks until the waiter receives the value.
    ///
    /// # Errors
    ///
    /// Returns [`BatchAdapterError::UnknownWaiter`] when no waiter is
    /// registered, or [`BatchAdapterError::Disconnected`] when the waiter
    /// hung up.
    pub fn complete(
        &self,
        token_id: TokenId,
        state_id: StateId,
        value: T,
    ) -> Result<(), BatchAdapterError> {
        let sender = {
            let mut guard = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            guard.remove(&(token_id, state_id))
        };
        let Some(sender) = sender else {
            return Err(BatchAdapterError::UnknownWaiter {
                token_id,
                state_id,
            });
        };
        sender.send(value).map_err(|_| BatchAdapterError::Disconnected {
            token_id,
            state_id,
        })
    }

    /// Returns the number of registered waiters.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

// ============================================================================
// SECTION: Shared Batch Adapter
// ============================================================================

/// Worker pool plus rendez-vous registry for batch-aware transforms.
///
/// # Invariants
/// - Pool results preserve input order; rendez-vous delivery is event-based.
#[derive(Debug)]
pub struct SharedBatchAdapter<T> {
    /// Bounded worker pool.
    pool: BatchWorkerPool,
    /// Rendez-vous channels for out-of-band completions.
    registry: RendezvousRegistry<T>,
}

impl<T> SharedBatchAdapter<T> {
    /// Creates an adapter with the declared worker count.
    ///
    /// # Errors
    ///
    /// Returns [`BatchAdapterError::NoWorkers`] when `workers` is zero.
    pub fn new(workers: usize) -> Result<Self, BatchAdapterError> {
        Ok(Self {
            pool: BatchWorkerPool::new(workers)?,
            registry: RendezvousRegistry::new(),
        })
    }

    /// Returns the underlying worker pool.
    #[must_use]
    pub const fn pool(&self) -> &BatchWorkerPool {
        &self.pool
    }

    /// Returns the rendez-vous registry.
    #[must_use]
    pub const fn registry(&self) -> &RendezvousRegistry<T> {
        &self.registry
    }
}
