// crates/elspeth-payload/src/lib.rs
// ============================================================================
// Module: Elspeth Payload Stores
// Description: Content-addressed byte stores for admitted row data.
// Purpose: Provide filesystem and in-memory PayloadStore implementations.
// Dependencies: elspeth-core, sha2, thiserror
// ============================================================================

//! ## Overview
//! Payload stores are append-only and content-addressed: storing the same
//! bytes twice returns the same hash, and retrieval of an absent hash
//! surfaces [`elspeth_core::PayloadError::Purged`] unmodified. The
//! orchestrator never mutates a payload; the recorder stores only the hash.

// ============================================================================
// SECTION: Modules
// ============================================================================

mod fs;
mod memory;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use fs::FsPayloadStore;
pub use memory::MemoryPayloadStore;

// ============================================================================
// SECTION: Hashing
// ============================================================================

use elspeth_core::PayloadHash;
use elspeth_core::hashing::DEFAULT_HASH_ALGORITHM;
use elspeth_core::hashing::hash_bytes;

/// Computes the content address of a payload.
#[must_use]
pub fn payload_hash_of(bytes: &[u8]) -> PayloadHash {
    PayloadHash::new(hash_bytes(DEFAULT_HASH_ALGORITHM, bytes).value)
}
