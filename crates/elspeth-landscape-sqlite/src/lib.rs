// crates/elspeth-landscape-sqlite/src/lib.rs
// ============================================================================
// Module: Elspeth SQLite Landscape
// Description: Durable Landscape recorder backed by SQLite WAL.
// Purpose: Persist the audit trail with transactional, fail-closed writes.
// Dependencies: elspeth-core, rusqlite, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! The SQLite landscape is the durable truth of a run. Foreign-key
//! enforcement and write-ahead logging are applied by a single connection
//! helper used by **every** construction path; terminal outcome uniqueness
//! is enforced by a partial unique index; every mutation runs inside a
//! transaction so a crash cannot leave half-registered state.

// ============================================================================
// SECTION: Modules
// ============================================================================

mod store;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use store::SqliteJournalMode;
pub use store::SqliteLandscape;
pub use store::SqliteLandscapeConfig;
pub use store::SqliteLandscapeError;
pub use store::SqliteSyncMode;
