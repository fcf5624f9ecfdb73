// crates/elspeth-payload/src/memory.rs
// ============================================================================
// Module: In-Memory Payload Store
// Description: Content-addressed store backed by a map.
// Purpose: Support tests and embedders without filesystem access.
// Dependencies: elspeth-core
// ============================================================================

//! ## Overview
//! A mutex-guarded map keyed by content hash. Semantics are identical to
//! the filesystem store: idempotent writes, purged-hash failures on read.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::PoisonError;

use elspeth_core::PayloadError;
use elspeth_core::PayloadHash;
use elspeth_core::PayloadStore;

use crate::payload_hash_of;

// ============================================================================
// SECTION: Store
// ============================================================================

/// In-memory content-addressed payload store.
///
/// # Invariants
/// - Append-only: entries are never mutated or removed by this type.
#[derive(Debug, Default)]
pub struct MemoryPayloadStore {
    /// Stored payloads keyed by content hash.
    entries: Mutex<BTreeMap<PayloadHash, Vec<u8>>>,
}

impl MemoryPayloadStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of distinct payloads stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` when the store holds no payloads.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes a payload, simulating retention purging in tests.
    pub fn purge(&self, hash: &PayloadHash) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).remove(hash);
    }
}

impl PayloadStore for MemoryPayloadStore {
    fn store(&self, bytes: &[u8]) -> Result<PayloadHash, PayloadError> {
        let hash = payload_hash_of(bytes);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.entry(hash.clone()).or_insert_with(|| bytes.to_vec());
        Ok(hash)
    }

    fn retrieve(&self, hash: &PayloadHash) -> Result<Vec<u8>, PayloadError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(hash)
            .cloned()
            .ok_or_else(|| PayloadError::Purged(hash.as_str().to_string()))
    }
}
