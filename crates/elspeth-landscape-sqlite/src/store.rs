// crates/elspeth-landscape-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Landscape Store
// Description: Durable Landscape recorder backed by SQLite WAL.
// Purpose: Persist runs, rows, tokens, outcomes, batches, and checkpoints.
// Dependencies: elspeth-core, rusqlite, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! This module implements the durable [`Landscape`] over SQLite. Durability
//! pragmas (foreign keys ON, WAL, synchronous, busy timeout) are applied by
//! one `open_connection` helper shared by every construction path (file,
//! URL, and in-memory), because a factory path that skips them is an
//! audit-integrity bug. The token-outcome ledger carries a partial unique
//! index over `(token_id) WHERE is_terminal = 1`; a second terminal record
//! for a token surfaces as [`LandscapeError::DuplicateTerminalOutcome`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::PoisonError;

use elspeth_core::BatchId;
use elspeth_core::BatchMemberRecord;
use elspeth_core::BatchMemberRole;
use elspeth_core::BatchRecord;
use elspeth_core::BatchStatus;
use elspeth_core::BranchName;
use elspeth_core::CheckpointId;
use elspeth_core::CheckpointRecord;
use elspeth_core::CheckpointRequest;
use elspeth_core::Determinism;
use elspeth_core::EdgeId;
use elspeth_core::ExportStatus;
use elspeth_core::Landscape;
use elspeth_core::LandscapeError;
use elspeth_core::NewRow;
use elspeth_core::NodeId;
use elspeth_core::NodeRegistration;
use elspeth_core::NodeStateStatus;
use elspeth_core::NodeType;
use elspeth_core::OutcomeContext;
use elspeth_core::OutcomeId;
use elspeth_core::OutcomeKind;
use elspeth_core::RouteLabel;
use elspeth_core::RowId;
use elspeth_core::RowRecord;
use elspeth_core::RunConfig;
use elspeth_core::RunId;
use elspeth_core::RunRecord;
use elspeth_core::RunStatus;
use elspeth_core::SecretsProvider;
use elspeth_core::SignedExport;
use elspeth_core::SinkName;
use elspeth_core::StateId;
use elspeth_core::TokenId;
use elspeth_core::TokenOutcomeRecord;
use elspeth_core::TriggerReason;
use elspeth_core::Timestamp;
use elspeth_core::hashing::DEFAULT_HASH_ALGORITHM;
use elspeth_core::hashing::HashAlgorithm;
use elspeth_core::hashing::HashDigest;
use elspeth_core::hashing::canonical_json_bytes;
use elspeth_core::hashing::hash_bytes;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::params;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// SQLite schema version for the landscape store.
const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// SECTION: Config
// ============================================================================

/// SQLite journal mode configuration.
///
/// # Invariants
/// - Values map 1:1 to SQLite `journal_mode` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteJournalMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl SqliteJournalMode {
    /// Returns the SQLite pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// SQLite sync mode configuration.
///
/// # Invariants
/// - Values map 1:1 to SQLite `synchronous` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl SqliteSyncMode {
    /// Returns the SQLite pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration for the SQLite landscape.
///
/// # Invariants
/// - `path` must resolve to a file path (not a directory).
/// - `busy_timeout_ms` is interpreted as milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteLandscapeConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// SQLite journal mode.
    #[serde(default)]
    pub journal_mode: SqliteJournalMode,
    /// SQLite sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

impl SqliteLandscapeConfig {
    /// Creates a configuration with defaults for a database path.
    #[must_use]
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: SqliteJournalMode::default(),
            sync_mode: SqliteSyncMode::default(),
        }
    }
}

/// Returns the default busy timeout for SQLite connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// SQLite landscape errors.
///
/// # Invariants
/// - Error messages avoid embedding raw row payloads.
#[derive(Debug, Error, Clone)]
pub enum SqliteLandscapeError {
    /// Store I/O error.
    #[error("sqlite landscape io error: {0}")]
    Io(String),
    /// SQLite engine error.
    #[error("sqlite landscape db error: {0}")]
    Db(String),
    /// Store corruption or integrity-check failure.
    #[error("sqlite landscape corruption: {0}")]
    Corrupt(String),
    /// Store schema version mismatch.
    #[error("sqlite landscape version mismatch: {0}")]
    VersionMismatch(String),
    /// Invalid store data.
    #[error("sqlite landscape invalid data: {0}")]
    Invalid(String),
}

impl From<SqliteLandscapeError> for LandscapeError {
    fn from(error: SqliteLandscapeError) -> Self {
        match error {
            SqliteLandscapeError::Io(message) => Self::Io(message),
            SqliteLandscapeError::Db(message) => Self::Db(message),
            SqliteLandscapeError::Corrupt(message) => Self::Corrupt(message),
            SqliteLandscapeError::VersionMismatch(message) => Self::VersionMismatch(message),
            SqliteLandscapeError::Invalid(message) => Self::Invalid(message),
        }
    }
}

/// Maps a rusqlite error into a store error.
fn db_err(error: &rusqlite::Error) -> SqliteLandscapeError {
    SqliteLandscapeError::Db(error.to_string())
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// SQLite-backed landscape recorder with WAL support.
///
/// # Invariants
/// - Connection access is serialized through a mutex.
/// - Every mutation runs inside a transaction.
pub struct SqliteLandscape {
    /// Shared connection guarded by a mutex.
    connection: Mutex<Connection>,
}

impl SqliteLandscape {
    /// Opens a SQLite landscape at a file path.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteLandscapeError`] when the database cannot be opened
    /// or initialized.
    pub fn open(config: &SqliteLandscapeConfig) -> Result<Self, SqliteLandscapeError> {
        validate_store_path(&config.path)?;
        ensure_parent_dir(&config.path)?;
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let connection =
            Connection::open_with_flags(&config.path, flags).map_err(|err| db_err(&err))?;
        Self::from_connection(connection, config)
    }

    /// Opens a SQLite landscape from a `file:` URI.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteLandscapeError`] when the database cannot be opened
    /// or initialized.
    pub fn open_url(
        url: &str,
        config: &SqliteLandscapeConfig,
    ) -> Result<Self, SqliteLandscapeError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;
        let connection = Connection::open_with_flags(url, flags).map_err(|err| db_err(&err))?;
        Self::from_connection(connection, config)
    }

    /// Opens an in-memory SQLite landscape.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteLandscapeError`] when initialization fails.
    pub fn open_in_memory() -> Result<Self, SqliteLandscapeError> {
        let connection = Connection::open_in_memory().map_err(|err| db_err(&err))?;
        let config = SqliteLandscapeConfig::for_path(":memory:");
        Self::from_connection(connection, &config)
    }

    /// Shared tail of every construction path: pragmas, then schema.
    fn from_connection(
        mut connection: Connection,
        config: &SqliteLandscapeConfig,
    ) -> Result<Self, SqliteLandscapeError> {
        apply_pragmas(&connection, config)?;
        initialize_schema(&mut connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// Locks the connection, recovering from poisoning.
    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the pragma values currently active, for durability checks.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteLandscapeError`] when the pragma query fails.
    pub fn durability_pragmas(&self) -> Result<(bool, String), SqliteLandscapeError> {
        let guard = self.lock();
        let foreign_keys: i64 = guard
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .map_err(|err| db_err(&err))?;
        let journal_mode: String = guard
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .map_err(|err| db_err(&err))?;
        Ok((foreign_keys == 1, journal_mode))
    }
}

// ============================================================================
// SECTION: Connection Setup
// ============================================================================

/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;

/// Validates store paths for safety limits.
fn validate_store_path(path: &Path) -> Result<(), SqliteLandscapeError> {
    if path.as_os_str().is_empty() {
        return Err(SqliteLandscapeError::Invalid("store path must not be empty".to_string()));
    }
    let path_string = path.display().to_string();
    if path_string.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(SqliteLandscapeError::Invalid(
            "store path exceeds length limit".to_string(),
        ));
    }
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if name.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(SqliteLandscapeError::Invalid(
                "store path contains an overlong component".to_string(),
            ));
        }
    }
    if path.exists() && path.is_dir() {
        return Err(SqliteLandscapeError::Invalid(
            "store path must be a file, not a directory".to_string(),
        ));
    }
    Ok(())
}

/// Creates the parent directory for the database file when needed.
fn ensure_parent_dir(path: &Path) -> Result<(), SqliteLandscapeError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent).map_err(|err| SqliteLandscapeError::Io(err.to_string()))
}

/// Applies SQLite pragmas required for durability.
fn apply_pragmas(
    connection: &Connection,
    config: &SqliteLandscapeConfig,
) -> Result<(), SqliteLandscapeError> {
    connection.execute_batch("PRAGMA foreign_keys = ON;").map_err(|err| db_err(&err))?;
    connection
        .execute_batch(&format!(
            "PRAGMA journal_mode = {};",
            config.journal_mode.pragma_value()
        ))
        .map_err(|err| db_err(&err))?;
    connection
        .execute_batch(&format!("PRAGMA synchronous = {};", config.sync_mode.pragma_value()))
        .map_err(|err| db_err(&err))?;
    connection
        .busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))
        .map_err(|err| db_err(&err))?;
    Ok(())
}

/// Initializes the SQLite schema or validates the existing version.
fn initialize_schema(connection: &mut Connection) -> Result<(), SqliteLandscapeError> {
    let tx = connection.transaction().map_err(|err| db_err(&err))?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")
        .map_err(|err| db_err(&err))?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| row.get(0))
        .optional()
        .map_err(|err| db_err(&err))?;
    match version {
        None => {
            tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])
                .map_err(|err| db_err(&err))?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS runs (
                    run_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    started_at INTEGER NOT NULL,
                    config_hash TEXT NOT NULL,
                    canonical_version TEXT NOT NULL,
                    status TEXT NOT NULL,
                    export_status TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS nodes (
                    run_id INTEGER NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                    node_id TEXT NOT NULL,
                    plugin_name TEXT NOT NULL,
                    node_type TEXT NOT NULL,
                    plugin_version TEXT NOT NULL,
                    determinism TEXT NOT NULL,
                    config_hash TEXT NOT NULL,
                    schema_config_json TEXT,
                    registered_at INTEGER NOT NULL,
                    PRIMARY KEY (run_id, node_id)
                );
                CREATE TABLE IF NOT EXISTS edges (
                    edge_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL,
                    from_node_id TEXT NOT NULL,
                    to_node_id TEXT NOT NULL,
                    label TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    FOREIGN KEY (run_id, from_node_id)
                        REFERENCES nodes(run_id, node_id) ON DELETE CASCADE,
                    FOREIGN KEY (run_id, to_node_id)
                        REFERENCES nodes(run_id, node_id) ON DELETE CASCADE
                );
                CREATE TABLE IF NOT EXISTS rows (
                    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                    source_node_id TEXT NOT NULL,
                    row_index INTEGER NOT NULL,
                    source_data_hash TEXT NOT NULL,
                    source_data_ref TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    UNIQUE (run_id, row_index)
                );
                CREATE TABLE IF NOT EXISTS tokens (
                    token_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    row_id INTEGER NOT NULL REFERENCES rows(row_id) ON DELETE CASCADE,
                    branch_name TEXT,
                    parent_token_id INTEGER REFERENCES tokens(token_id),
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_tokens_row ON tokens (row_id);
                CREATE TABLE IF NOT EXISTS node_states (
                    state_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL,
                    token_id INTEGER NOT NULL REFERENCES tokens(token_id) ON DELETE CASCADE,
                    node_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    started_at INTEGER NOT NULL,
                    completed_at INTEGER,
                    error_hash TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_node_states_token ON node_states (token_id);
                CREATE TABLE IF NOT EXISTS token_outcomes (
                    outcome_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL,
                    token_id INTEGER NOT NULL REFERENCES tokens(token_id) ON DELETE CASCADE,
                    outcome TEXT NOT NULL,
                    is_terminal INTEGER NOT NULL,
                    recorded_at INTEGER NOT NULL,
                    sink_name TEXT,
                    batch_id INTEGER,
                    fork_group_id INTEGER,
                    join_group_id INTEGER,
                    expand_group_id INTEGER,
                    error_hash TEXT,
                    context_json TEXT
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_token_outcomes_terminal
                    ON token_outcomes (token_id) WHERE is_terminal = 1;
                CREATE INDEX IF NOT EXISTS idx_token_outcomes_token
                    ON token_outcomes (token_id);
                CREATE TABLE IF NOT EXISTS batches (
                    batch_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                    aggregation_node_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    attempt INTEGER NOT NULL,
                    trigger_reason TEXT,
                    opened_at INTEGER NOT NULL,
                    closed_at INTEGER,
                    state_id INTEGER
                );
                CREATE TABLE IF NOT EXISTS batch_members (
                    batch_id INTEGER NOT NULL REFERENCES batches(batch_id) ON DELETE CASCADE,
                    token_id INTEGER NOT NULL REFERENCES tokens(token_id),
                    role TEXT NOT NULL,
                    PRIMARY KEY (batch_id, token_id, role)
                );
                CREATE TABLE IF NOT EXISTS checkpoints (
                    checkpoint_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                    token_id INTEGER NOT NULL REFERENCES tokens(token_id),
                    node_id TEXT NOT NULL,
                    sequence_number INTEGER NOT NULL,
                    upstream_topology_hash TEXT NOT NULL,
                    checkpoint_node_config_hash TEXT NOT NULL,
                    aggregation_state_json TEXT,
                    format_version INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    UNIQUE (run_id, sequence_number)
                );",
            )
            .map_err(|err| db_err(&err))?;
        }
        Some(value) if value == SCHEMA_VERSION => {}
        Some(value) => {
            return Err(SqliteLandscapeError::VersionMismatch(format!(
                "unsupported schema version: {value}"
            )));
        }
    }
    tx.commit().map_err(|err| db_err(&err))?;
    Ok(())
}

// ============================================================================
// SECTION: Label Mapping
// ============================================================================

/// Serializes a digest into its stored `algorithm:value` form.
fn digest_label(digest: &HashDigest) -> String {
    format!("{}:{}", digest.algorithm.as_str(), digest.value)
}

/// Parses a stored `algorithm:value` digest label.
fn parse_digest(label: &str) -> Result<HashDigest, SqliteLandscapeError> {
    let (algorithm, value) = label.split_once(':').ok_or_else(|| {
        SqliteLandscapeError::Corrupt(format!("malformed digest label: {label}"))
    })?;
    let algorithm = HashAlgorithm::parse(algorithm).ok_or_else(|| {
        SqliteLandscapeError::Corrupt(format!("unsupported hash algorithm: {algorithm}"))
    })?;
    Ok(HashDigest {
        algorithm,
        value: value.to_string(),
    })
}

/// Returns the stable label for a run status.
const fn run_status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

/// Parses a stored run status label.
fn parse_run_status(label: &str) -> Result<RunStatus, SqliteLandscapeError> {
    match label {
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        other => Err(SqliteLandscapeError::Corrupt(format!("unknown run status: {other}"))),
    }
}

/// Returns the stable label for an export status.
const fn export_status_label(status: ExportStatus) -> &'static str {
    match status {
        ExportStatus::NotExported => "not_exported",
        ExportStatus::Exported => "exported",
    }
}

/// Parses a stored export status label.
fn parse_export_status(label: &str) -> Result<ExportStatus, SqliteLandscapeError> {
    match label {
        "not_exported" => Ok(ExportStatus::NotExported),
        "exported" => Ok(ExportStatus::Exported),
        other => {
            Err(SqliteLandscapeError::Corrupt(format!("unknown export status: {other}")))
        }
    }
}

/// Returns the stable label for a node type.
const fn node_type_label(node_type: NodeType) -> &'static str {
    match node_type {
        NodeType::Source => "source",
        NodeType::Transform => "transform",
        NodeType::Gate => "gate",
        NodeType::Sink => "sink",
    }
}

/// Returns the stable label for a determinism class.
const fn determinism_label(determinism: Determinism) -> &'static str {
    match determinism {
        Determinism::Deterministic => "deterministic",
        Determinism::NonDeterministic => "non_deterministic",
        Determinism::IoRead => "io_read",
        Determinism::IoWrite => "io_write",
    }
}

/// Returns the stable label for a node state status.
const fn node_state_label(status: NodeStateStatus) -> &'static str {
    match status {
        NodeStateStatus::Executing => "executing",
        NodeStateStatus::Completed => "completed",
        NodeStateStatus::Failed => "failed",
        NodeStateStatus::Routed => "routed",
        NodeStateStatus::Quarantined => "quarantined",
    }
}

/// Returns the stable label for an outcome kind.
const fn outcome_label(outcome: OutcomeKind) -> &'static str {
    match outcome {
        OutcomeKind::Completed => "completed",
        OutcomeKind::Routed => "routed",
        OutcomeKind::Forked => "forked",
        OutcomeKind::Coalesced => "coalesced",
        OutcomeKind::Expanded => "expanded",
        OutcomeKind::Buffered => "buffered",
        OutcomeKind::ConsumedInBatch => "consumed_in_batch",
        OutcomeKind::Failed => "failed",
        OutcomeKind::Quarantined => "quarantined",
    }
}

/// Parses a stored outcome label.
fn parse_outcome(label: &str) -> Result<OutcomeKind, SqliteLandscapeError> {
    match label {
        "completed" => Ok(OutcomeKind::Completed),
        "routed" => Ok(OutcomeKind::Routed),
        "forked" => Ok(OutcomeKind::Forked),
        "coalesced" => Ok(OutcomeKind::Coalesced),
        "expanded" => Ok(OutcomeKind::Expanded),
        "buffered" => Ok(OutcomeKind::Buffered),
        "consumed_in_batch" => Ok(OutcomeKind::ConsumedInBatch),
        "failed" => Ok(OutcomeKind::Failed),
        "quarantined" => Ok(OutcomeKind::Quarantined),
        other => Err(SqliteLandscapeError::Corrupt(format!("unknown outcome: {other}"))),
    }
}

/// Returns the stable label for a batch status.
const fn batch_status_label(status: BatchStatus) -> &'static str {
    match status {
        BatchStatus::Draft => "draft",
        BatchStatus::Executing => "executing",
        BatchStatus::Failed => "failed",
        BatchStatus::Completed => "completed",
    }
}

/// Parses a stored batch status label.
fn parse_batch_status(label: &str) -> Result<BatchStatus, SqliteLandscapeError> {
    match label {
        "draft" => Ok(BatchStatus::Draft),
        "executing" => Ok(BatchStatus::Executing),
        "failed" => Ok(BatchStatus::Failed),
        "completed" => Ok(BatchStatus::Completed),
        other => Err(SqliteLandscapeError::Corrupt(format!("unknown batch status: {other}"))),
    }
}

/// Returns the stable label for a trigger reason.
const fn trigger_label(reason: TriggerReason) -> &'static str {
    match reason {
        TriggerReason::Count => "count",
        TriggerReason::WallClockTimeout => "wall_clock_timeout",
        TriggerReason::EndOfSource => "end_of_source",
    }
}

/// Parses a stored trigger reason label.
fn parse_trigger(label: &str) -> Result<TriggerReason, SqliteLandscapeError> {
    match label {
        "count" => Ok(TriggerReason::Count),
        "wall_clock_timeout" => Ok(TriggerReason::WallClockTimeout),
        "end_of_source" => Ok(TriggerReason::EndOfSource),
        other => {
            Err(SqliteLandscapeError::Corrupt(format!("unknown trigger reason: {other}")))
        }
    }
}

/// Returns the stable label for a batch member role.
const fn role_label(role: BatchMemberRole) -> &'static str {
    match role {
        BatchMemberRole::Input => "input",
        BatchMemberRole::Output => "output",
    }
}

/// Parses a stored batch member role label.
fn parse_role(label: &str) -> Result<BatchMemberRole, SqliteLandscapeError> {
    match label {
        "input" => Ok(BatchMemberRole::Input),
        "output" => Ok(BatchMemberRole::Output),
        other => Err(SqliteLandscapeError::Corrupt(format!("unknown member role: {other}"))),
    }
}

/// Converts a database integer into a non-zero identifier.
fn id_from_i64<T, F>(value: i64, build: F, what: &str) -> Result<T, SqliteLandscapeError>
where
    F: FnOnce(u64) -> Option<T>,
{
    u64::try_from(value)
        .ok()
        .and_then(build)
        .ok_or_else(|| SqliteLandscapeError::Corrupt(format!("invalid {what} id: {value}")))
}

/// Converts an identifier into a database integer.
fn id_to_i64(value: u64, what: &str) -> Result<i64, SqliteLandscapeError> {
    i64::try_from(value)
        .map_err(|_| SqliteLandscapeError::Invalid(format!("{what} id out of range: {value}")))
}

// ============================================================================
// SECTION: Landscape Implementation
// ============================================================================

impl Landscape for SqliteLandscape {
    fn begin_run(&self, config: &RunConfig) -> Result<RunRecord, LandscapeError> {
        let mut guard = self.lock();
        let tx = guard.transaction().map_err(|err| LandscapeError::from(db_err(&err)))?;
        tx.execute(
            "INSERT INTO runs (started_at, config_hash, canonical_version, status, \
             export_status) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                config.started_at.as_unix_millis(),
                digest_label(&config.config_hash),
                config.canonical_version,
                run_status_label(RunStatus::Running),
                export_status_label(ExportStatus::NotExported),
            ],
        )
        .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let raw_id = tx.last_insert_rowid();
        tx.commit().map_err(|err| LandscapeError::from(db_err(&err)))?;
        let run_id = id_from_i64(raw_id, RunId::from_raw, "run")
            .map_err(LandscapeError::from)?;
        Ok(RunRecord {
            run_id,
            started_at: config.started_at,
            config_hash: config.config_hash.clone(),
            canonical_version: config.canonical_version.clone(),
            status: RunStatus::Running,
            export_status: ExportStatus::NotExported,
        })
    }

    fn update_run_status(&self, run_id: RunId, status: RunStatus) -> Result<(), LandscapeError> {
        let mut guard = self.lock();
        let tx = guard.transaction().map_err(|err| LandscapeError::from(db_err(&err)))?;
        let changed = tx
            .execute(
                "UPDATE runs SET status = ?1 WHERE run_id = ?2",
                params![
                    run_status_label(status),
                    id_to_i64(run_id.get(), "run").map_err(LandscapeError::from)?
                ],
            )
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        tx.commit().map_err(|err| LandscapeError::from(db_err(&err)))?;
        if changed == 0 {
            return Err(LandscapeError::Invalid(format!("unknown run: {run_id}")));
        }
        Ok(())
    }

    fn complete_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        _completed_at: Timestamp,
    ) -> Result<(), LandscapeError> {
        self.update_run_status(run_id, status)
    }

    fn register_node(
        &self,
        run_id: RunId,
        registration: &NodeRegistration,
        registered_at: Timestamp,
    ) -> Result<(), LandscapeError> {
        let mut guard = self.lock();
        let tx = guard.transaction().map_err(|err| LandscapeError::from(db_err(&err)))?;
        let schema_config = registration
            .schema_config_json
            .as_ref()
            .map(ToString::to_string);
        let result = tx.execute(
            "INSERT INTO nodes (run_id, node_id, plugin_name, node_type, plugin_version, \
             determinism, config_hash, schema_config_json, registered_at) VALUES (?1, ?2, ?3, \
             ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id_to_i64(run_id.get(), "run").map_err(LandscapeError::from)?,
                registration.node_id.as_str(),
                registration.plugin_name.as_str(),
                node_type_label(registration.node_type),
                registration.plugin_version,
                determinism_label(registration.determinism),
                digest_label(&registration.config_hash),
                schema_config,
                registered_at.as_unix_millis(),
            ],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(failure, message))
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                return Err(LandscapeError::Invalid(format!(
                    "node already registered: {} ({})",
                    registration.node_id,
                    message.unwrap_or_default()
                )));
            }
            Err(err) => return Err(LandscapeError::from(db_err(&err))),
        }
        tx.commit().map_err(|err| LandscapeError::from(db_err(&err)))?;
        Ok(())
    }

    fn register_edge(
        &self,
        run_id: RunId,
        from: &NodeId,
        to: &NodeId,
        label: &RouteLabel,
        created_at: Timestamp,
    ) -> Result<EdgeId, LandscapeError> {
        let mut guard = self.lock();
        let tx = guard.transaction().map_err(|err| LandscapeError::from(db_err(&err)))?;
        tx.execute(
            "INSERT INTO edges (run_id, from_node_id, to_node_id, label, created_at) VALUES \
             (?1, ?2, ?3, ?4, ?5)",
            params![
                id_to_i64(run_id.get(), "run").map_err(LandscapeError::from)?,
                from.as_str(),
                to.as_str(),
                label.as_str(),
                created_at.as_unix_millis(),
            ],
        )
        .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let raw_id = tx.last_insert_rowid();
        tx.commit().map_err(|err| LandscapeError::from(db_err(&err)))?;
        id_from_i64(raw_id, EdgeId::from_raw, "edge").map_err(LandscapeError::from)
    }

    fn create_row(&self, row: &NewRow) -> Result<RowId, LandscapeError> {
        let mut guard = self.lock();
        let tx = guard.transaction().map_err(|err| LandscapeError::from(db_err(&err)))?;
        tx.execute(
            "INSERT INTO rows (run_id, source_node_id, row_index, source_data_hash, \
             source_data_ref, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id_to_i64(row.run_id.get(), "run").map_err(LandscapeError::from)?,
                row.source_node_id.as_str(),
                id_to_i64(row.row_index, "row index").map_err(LandscapeError::from)?,
                digest_label(&row.source_data_hash),
                row.source_data_ref,
                row.created_at.as_unix_millis(),
            ],
        )
        .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let raw_id = tx.last_insert_rowid();
        tx.commit().map_err(|err| LandscapeError::from(db_err(&err)))?;
        id_from_i64(raw_id, RowId::from_raw, "row").map_err(LandscapeError::from)
    }

    fn create_token(
        &self,
        row_id: RowId,
        parent: Option<TokenId>,
        branch: Option<&BranchName>,
        created_at: Timestamp,
    ) -> Result<TokenId, LandscapeError> {
        let mut guard = self.lock();
        let tx = guard.transaction().map_err(|err| LandscapeError::from(db_err(&err)))?;
        let parent_raw = parent
            .map(|token| id_to_i64(token.get(), "token"))
            .transpose()
            .map_err(LandscapeError::from)?;
        tx.execute(
            "INSERT INTO tokens (row_id, branch_name, parent_token_id, created_at) VALUES (?1, \
             ?2, ?3, ?4)",
            params![
                id_to_i64(row_id.get(), "row").map_err(LandscapeError::from)?,
                branch.map(BranchName::as_str),
                parent_raw,
                created_at.as_unix_millis(),
            ],
        )
        .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let raw_id = tx.last_insert_rowid();
        tx.commit().map_err(|err| LandscapeError::from(db_err(&err)))?;
        id_from_i64(raw_id, TokenId::from_raw, "token").map_err(LandscapeError::from)
    }

    fn record_node_state(
        &self,
        run_id: RunId,
        token_id: TokenId,
        node_id: &NodeId,
        started_at: Timestamp,
    ) -> Result<StateId, LandscapeError> {
        let mut guard = self.lock();
        let tx = guard.transaction().map_err(|err| LandscapeError::from(db_err(&err)))?;
        tx.execute(
            "INSERT INTO node_states (run_id, token_id, node_id, status, started_at) VALUES \
             (?1, ?2, ?3, ?4, ?5)",
            params![
                id_to_i64(run_id.get(), "run").map_err(LandscapeError::from)?,
                id_to_i64(token_id.get(), "token").map_err(LandscapeError::from)?,
                node_id.as_str(),
                node_state_label(NodeStateStatus::Executing),
                started_at.as_unix_millis(),
            ],
        )
        .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let raw_id = tx.last_insert_rowid();
        tx.commit().map_err(|err| LandscapeError::from(db_err(&err)))?;
        id_from_i64(raw_id, StateId::from_raw, "state").map_err(LandscapeError::from)
    }

    fn complete_node_state(
        &self,
        state_id: StateId,
        status: NodeStateStatus,
        completed_at: Timestamp,
        error_hash: Option<&HashDigest>,
    ) -> Result<(), LandscapeError> {
        let mut guard = self.lock();
        let tx = guard.transaction().map_err(|err| LandscapeError::from(db_err(&err)))?;
        let changed = tx
            .execute(
                "UPDATE node_states SET status = ?1, completed_at = ?2, error_hash = ?3 WHERE \
                 state_id = ?4",
                params![
                    node_state_label(status),
                    completed_at.as_unix_millis(),
                    error_hash.map(digest_label),
                    id_to_i64(state_id.get(), "state").map_err(LandscapeError::from)?,
                ],
            )
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        tx.commit().map_err(|err| LandscapeError::from(db_err(&err)))?;
        if changed == 0 {
            return Err(LandscapeError::Invalid(format!("unknown node state: {state_id}")));
        }
        Ok(())
    }

    fn record_token_outcome(
        &self,
        run_id: RunId,
        token_id: TokenId,
        outcome: OutcomeKind,
        context: &OutcomeContext,
        recorded_at: Timestamp,
    ) -> Result<OutcomeId, LandscapeError> {
        let mut guard = self.lock();
        let tx = guard.transaction().map_err(|err| LandscapeError::from(db_err(&err)))?;
        let result = tx.execute(
            "INSERT INTO token_outcomes (run_id, token_id, outcome, is_terminal, recorded_at, \
             sink_name, batch_id, fork_group_id, join_group_id, expand_group_id, error_hash, \
             context_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                id_to_i64(run_id.get(), "run").map_err(LandscapeError::from)?,
                id_to_i64(token_id.get(), "token").map_err(LandscapeError::from)?,
                outcome_label(outcome),
                i64::from(outcome.is_terminal()),
                recorded_at.as_unix_millis(),
                context.sink_name.as_ref().map(SinkName::as_str),
                context
                    .batch_id
                    .map(|id| id_to_i64(id.get(), "batch"))
                    .transpose()
                    .map_err(LandscapeError::from)?,
                context
                    .fork_group_id
                    .map(|id| id_to_i64(id.get(), "fork group"))
                    .transpose()
                    .map_err(LandscapeError::from)?,
                context
                    .join_group_id
                    .map(|id| id_to_i64(id.get(), "join group"))
                    .transpose()
                    .map_err(LandscapeError::from)?,
                context
                    .expand_group_id
                    .map(|id| id_to_i64(id.get(), "expand group"))
                    .transpose()
                    .map_err(LandscapeError::from)?,
                context.error_hash.as_ref().map(digest_label),
                context.context_json.as_ref().map(ToString::to_string),
            ],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                // The partial unique index rejected a second terminal record.
                return Err(LandscapeError::DuplicateTerminalOutcome {
                    token_id,
                });
            }
            Err(err) => return Err(LandscapeError::from(db_err(&err))),
        }
        let raw_id = tx.last_insert_rowid();
        tx.commit().map_err(|err| LandscapeError::from(db_err(&err)))?;
        id_from_i64(raw_id, OutcomeId::from_raw, "outcome").map_err(LandscapeError::from)
    }

    fn get_token_outcome(
        &self,
        token_id: TokenId,
    ) -> Result<Option<TokenOutcomeRecord>, LandscapeError> {
        let guard = self.lock();
        let raw_token = id_to_i64(token_id.get(), "token").map_err(LandscapeError::from)?;
        let record = guard
            .query_row(
                "SELECT outcome_id, run_id, outcome, is_terminal, recorded_at, sink_name, \
                 batch_id, fork_group_id, join_group_id, expand_group_id, error_hash, \
                 context_json FROM token_outcomes WHERE token_id = ?1 ORDER BY is_terminal \
                 DESC, outcome_id DESC LIMIT 1",
                params![raw_token],
                map_outcome_row,
            )
            .optional()
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        record
            .map(|raw| build_outcome_record(raw, token_id))
            .transpose()
            .map_err(LandscapeError::from)
    }

    fn create_batch(
        &self,
        run_id: RunId,
        aggregation_node_id: &NodeId,
        opened_at: Timestamp,
    ) -> Result<BatchId, LandscapeError> {
        let mut guard = self.lock();
        let tx = guard.transaction().map_err(|err| LandscapeError::from(db_err(&err)))?;
        tx.execute(
            "INSERT INTO batches (run_id, aggregation_node_id, status, attempt, opened_at) \
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![
                id_to_i64(run_id.get(), "run").map_err(LandscapeError::from)?,
                aggregation_node_id.as_str(),
                batch_status_label(BatchStatus::Draft),
                opened_at.as_unix_millis(),
            ],
        )
        .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let raw_id = tx.last_insert_rowid();
        tx.commit().map_err(|err| LandscapeError::from(db_err(&err)))?;
        id_from_i64(raw_id, BatchId::from_raw, "batch").map_err(LandscapeError::from)
    }

    fn add_batch_member(
        &self,
        batch_id: BatchId,
        token_id: TokenId,
        role: BatchMemberRole,
    ) -> Result<(), LandscapeError> {
        let mut guard = self.lock();
        let tx = guard.transaction().map_err(|err| LandscapeError::from(db_err(&err)))?;
        tx.execute(
            "INSERT INTO batch_members (batch_id, token_id, role) VALUES (?1, ?2, ?3)",
            params![
                id_to_i64(batch_id.get(), "batch").map_err(LandscapeError::from)?,
                id_to_i64(token_id.get(), "token").map_err(LandscapeError::from)?,
                role_label(role),
            ],
        )
        .map_err(|err| LandscapeError::from(db_err(&err)))?;
        tx.commit().map_err(|err| LandscapeError::from(db_err(&err)))?;
        Ok(())
    }

    fn update_batch_status(
        &self,
        batch_id: BatchId,
        status: BatchStatus,
        trigger_reason: Option<TriggerReason>,
        closed_at: Option<Timestamp>,
        state_id: Option<StateId>,
    ) -> Result<(), LandscapeError> {
        let mut guard = self.lock();
        let tx = guard.transaction().map_err(|err| LandscapeError::from(db_err(&err)))?;
        let changed = tx
            .execute(
                "UPDATE batches SET status = ?1, trigger_reason = COALESCE(?2, \
                 trigger_reason), closed_at = COALESCE(?3, closed_at), state_id = COALESCE(?4, \
                 state_id) WHERE batch_id = ?5",
                params![
                    batch_status_label(status),
                    trigger_reason.map(trigger_label),
                    closed_at.map(Timestamp::as_unix_millis),
                    state_id
                        .map(|id| id_to_i64(id.get(), "state"))
                        .transpose()
                        .map_err(LandscapeError::from)?,
                    id_to_i64(batch_id.get(), "batch").map_err(LandscapeError::from)?,
                ],
            )
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        tx.commit().map_err(|err| LandscapeError::from(db_err(&err)))?;
        if changed == 0 {
            return Err(LandscapeError::Invalid(format!("unknown batch: {batch_id}")));
        }
        Ok(())
    }

    fn retry_batch(&self, batch_id: BatchId) -> Result<u32, LandscapeError> {
        let mut guard = self.lock();
        let tx = guard.transaction().map_err(|err| LandscapeError::from(db_err(&err)))?;
        let raw_batch = id_to_i64(batch_id.get(), "batch").map_err(LandscapeError::from)?;
        let changed = tx
            .execute("UPDATE batches SET attempt = attempt + 1 WHERE batch_id = ?1", params![
                raw_batch
            ])
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        if changed == 0 {
            return Err(LandscapeError::Invalid(format!("unknown batch: {batch_id}")));
        }
        let attempt: i64 = tx
            .query_row("SELECT attempt FROM batches WHERE batch_id = ?1", params![raw_batch], |row| {
                row.get(0)
            })
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        tx.commit().map_err(|err| LandscapeError::from(db_err(&err)))?;
        u32::try_from(attempt)
            .map_err(|_| LandscapeError::Corrupt(format!("invalid attempt count: {attempt}")))
    }

    fn get_incomplete_batches(&self, run_id: RunId) -> Result<Vec<BatchRecord>, LandscapeError> {
        let guard = self.lock();
        let mut stmt = guard
            .prepare(
                "SELECT batch_id, aggregation_node_id, status, attempt, trigger_reason, \
                 opened_at, closed_at, state_id FROM batches WHERE run_id = ?1 AND status != \
                 'completed' ORDER BY batch_id ASC",
            )
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let raw_run = id_to_i64(run_id.get(), "run").map_err(LandscapeError::from)?;
        let rows = stmt
            .query_map(params![raw_run], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                    row.get::<_, Option<i64>>(7)?,
                ))
            })
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let mut batches = Vec::new();
        for row in rows {
            let (raw_batch, node, status, attempt, trigger, opened_at, closed_at, state) =
                row.map_err(|err| LandscapeError::from(db_err(&err)))?;
            batches.push(BatchRecord {
                batch_id: id_from_i64(raw_batch, BatchId::from_raw, "batch")
                    .map_err(LandscapeError::from)?,
                run_id,
                aggregation_node_id: NodeId::new(node),
                status: parse_batch_status(&status).map_err(LandscapeError::from)?,
                attempt: u32::try_from(attempt).map_err(|_| {
                    LandscapeError::Corrupt(format!("invalid attempt count: {attempt}"))
                })?,
                trigger_reason: trigger
                    .as_deref()
                    .map(parse_trigger)
                    .transpose()
                    .map_err(LandscapeError::from)?,
                opened_at: Timestamp::from_unix_millis(opened_at),
                closed_at: closed_at.map(Timestamp::from_unix_millis),
                state_id: state
                    .map(|raw| id_from_i64(raw, StateId::from_raw, "state"))
                    .transpose()
                    .map_err(LandscapeError::from)?,
            });
        }
        Ok(batches)
    }

    fn get_batch_members(
        &self,
        batch_id: BatchId,
    ) -> Result<Vec<BatchMemberRecord>, LandscapeError> {
        let guard = self.lock();
        let mut stmt = guard
            .prepare(
                "SELECT token_id, role FROM batch_members WHERE batch_id = ?1 ORDER BY rowid \
                 ASC",
            )
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let raw_batch = id_to_i64(batch_id.get(), "batch").map_err(LandscapeError::from)?;
        let rows = stmt
            .query_map(params![raw_batch], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let mut members = Vec::new();
        for row in rows {
            let (raw_token, role) = row.map_err(|err| LandscapeError::from(db_err(&err)))?;
            members.push(BatchMemberRecord {
                batch_id,
                token_id: id_from_i64(raw_token, TokenId::from_raw, "token")
                    .map_err(LandscapeError::from)?,
                role: parse_role(&role).map_err(LandscapeError::from)?,
            });
        }
        Ok(members)
    }

    fn create_checkpoint(
        &self,
        request: &CheckpointRequest,
    ) -> Result<CheckpointRecord, LandscapeError> {
        let mut guard = self.lock();
        let tx = guard.transaction().map_err(|err| LandscapeError::from(db_err(&err)))?;
        let raw_run = id_to_i64(request.run_id.get(), "run").map_err(LandscapeError::from)?;
        let raw_token =
            id_to_i64(request.token_id.get(), "token").map_err(LandscapeError::from)?;
        // Checkpoints follow their token's terminal outcome, never precede it.
        let has_terminal: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM token_outcomes WHERE token_id = ?1 AND is_terminal = 1",
                params![raw_token],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        if has_terminal.is_none() {
            return Err(LandscapeError::Invalid(format!(
                "checkpoint for token {} without terminal outcome",
                request.token_id
            )));
        }
        let sequence_number: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM checkpoints WHERE run_id = \
                 ?1",
                params![raw_run],
                |row| row.get(0),
            )
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        tx.execute(
            "INSERT INTO checkpoints (run_id, token_id, node_id, sequence_number, \
             upstream_topology_hash, checkpoint_node_config_hash, aggregation_state_json, \
             format_version, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                raw_run,
                raw_token,
                request.node_id.as_str(),
                sequence_number,
                digest_label(&request.upstream_topology_hash),
                digest_label(&request.checkpoint_node_config_hash),
                request.aggregation_state_json.as_ref().map(ToString::to_string),
                i64::from(request.format_version),
                request.created_at.as_unix_millis(),
            ],
        )
        .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let raw_id = tx.last_insert_rowid();
        tx.commit().map_err(|err| LandscapeError::from(db_err(&err)))?;
        Ok(CheckpointRecord {
            checkpoint_id: id_from_i64(raw_id, CheckpointId::from_raw, "checkpoint")
                .map_err(LandscapeError::from)?,
            sequence_number: u64::try_from(sequence_number).map_err(|_| {
                LandscapeError::Corrupt(format!("invalid sequence number: {sequence_number}"))
            })?,
            request: request.clone(),
        })
    }

    fn delete_checkpoints(&self, run_id: RunId) -> Result<u64, LandscapeError> {
        let mut guard = self.lock();
        let tx = guard.transaction().map_err(|err| LandscapeError::from(db_err(&err)))?;
        let deleted = tx
            .execute("DELETE FROM checkpoints WHERE run_id = ?1", params![
                id_to_i64(run_id.get(), "run").map_err(LandscapeError::from)?
            ])
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        tx.commit().map_err(|err| LandscapeError::from(db_err(&err)))?;
        Ok(deleted as u64)
    }

    fn list_checkpoints(&self, run_id: RunId) -> Result<Vec<CheckpointRecord>, LandscapeError> {
        let guard = self.lock();
        let mut stmt = guard
            .prepare(
                "SELECT checkpoint_id, token_id, node_id, sequence_number, \
                 upstream_topology_hash, checkpoint_node_config_hash, aggregation_state_json, \
                 format_version, created_at FROM checkpoints WHERE run_id = ?1 ORDER BY \
                 sequence_number ASC",
            )
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let raw_run = id_to_i64(run_id.get(), "run").map_err(LandscapeError::from)?;
        let rows = stmt
            .query_map(params![raw_run], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            })
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let mut checkpoints = Vec::new();
        for row in rows {
            let (
                raw_checkpoint,
                raw_token,
                node,
                sequence,
                topology,
                node_config,
                aggregation_state,
                format_version,
                created_at,
            ) = row.map_err(|err| LandscapeError::from(db_err(&err)))?;
            let aggregation_state_json = aggregation_state
                .map(|text| {
                    serde_json::from_str::<Value>(&text).map_err(|err| {
                        LandscapeError::Corrupt(format!("malformed aggregation state: {err}"))
                    })
                })
                .transpose()?;
            checkpoints.push(CheckpointRecord {
                checkpoint_id: id_from_i64(raw_checkpoint, CheckpointId::from_raw, "checkpoint")
                    .map_err(LandscapeError::from)?,
                sequence_number: u64::try_from(sequence).map_err(|_| {
                    LandscapeError::Corrupt(format!("invalid sequence number: {sequence}"))
                })?,
                request: CheckpointRequest {
                    run_id,
                    token_id: id_from_i64(raw_token, TokenId::from_raw, "token")
                        .map_err(LandscapeError::from)?,
                    node_id: NodeId::new(node),
                    upstream_topology_hash: parse_digest(&topology)
                        .map_err(LandscapeError::from)?,
                    checkpoint_node_config_hash: parse_digest(&node_config)
                        .map_err(LandscapeError::from)?,
                    aggregation_state_json,
                    format_version: u32::try_from(format_version).map_err(|_| {
                        LandscapeError::Corrupt(format!(
                            "invalid format version: {format_version}"
                        ))
                    })?,
                    created_at: Timestamp::from_unix_millis(created_at),
                },
            });
        }
        Ok(checkpoints)
    }

    fn get_unprocessed_row_ids(&self, run_id: RunId) -> Result<Vec<RowId>, LandscapeError> {
        let guard = self.lock();
        let mut stmt = guard
            .prepare(
                "SELECT r.row_id FROM rows r WHERE r.run_id = ?1
                 AND NOT EXISTS (
                     SELECT 1 FROM token_outcomes o
                     JOIN tokens t ON o.token_id = t.token_id
                     WHERE t.row_id = r.row_id AND o.is_terminal = 1)
                 AND NOT EXISTS (
                     SELECT 1 FROM checkpoints c
                     JOIN tokens t2 ON c.token_id = t2.token_id
                     WHERE t2.row_id = r.row_id)
                 ORDER BY r.row_index ASC",
            )
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let raw_run = id_to_i64(run_id.get(), "run").map_err(LandscapeError::from)?;
        let rows = stmt
            .query_map(params![raw_run], |row| row.get::<_, i64>(0))
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let mut row_ids = Vec::new();
        for row in rows {
            let raw = row.map_err(|err| LandscapeError::from(db_err(&err)))?;
            row_ids
                .push(id_from_i64(raw, RowId::from_raw, "row").map_err(LandscapeError::from)?);
        }
        Ok(row_ids)
    }

    fn get_rows(&self, run_id: RunId, row_ids: &[RowId]) -> Result<Vec<RowRecord>, LandscapeError> {
        let guard = self.lock();
        let mut stmt = guard
            .prepare(
                "SELECT row_id, source_node_id, row_index, source_data_hash, source_data_ref, \
                 created_at FROM rows WHERE run_id = ?1 ORDER BY row_index ASC",
            )
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let raw_run = id_to_i64(run_id.get(), "run").map_err(LandscapeError::from)?;
        let rows = stmt
            .query_map(params![raw_run], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let mut records = Vec::new();
        for row in rows {
            let (raw_row, source_node, row_index, data_hash, data_ref, created_at) =
                row.map_err(|err| LandscapeError::from(db_err(&err)))?;
            let row_id =
                id_from_i64(raw_row, RowId::from_raw, "row").map_err(LandscapeError::from)?;
            if !row_ids.contains(&row_id) {
                continue;
            }
            records.push(RowRecord {
                row_id,
                run_id,
                source_node_id: NodeId::new(source_node),
                row_index: u64::try_from(row_index).map_err(|_| {
                    LandscapeError::Corrupt(format!("invalid row index: {row_index}"))
                })?,
                source_data_hash: parse_digest(&data_hash).map_err(LandscapeError::from)?,
                source_data_ref: data_ref,
                created_at: Timestamp::from_unix_millis(created_at),
            });
        }
        Ok(records)
    }

    fn get_initial_token(&self, row_id: RowId) -> Result<Option<TokenId>, LandscapeError> {
        let guard = self.lock();
        let raw = guard
            .query_row(
                "SELECT token_id FROM tokens WHERE row_id = ?1 AND parent_token_id IS NULL AND \
                 branch_name IS NULL ORDER BY token_id ASC LIMIT 1",
                params![id_to_i64(row_id.get(), "row").map_err(LandscapeError::from)?],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        raw.map(|value| id_from_i64(value, TokenId::from_raw, "token"))
            .transpose()
            .map_err(LandscapeError::from)
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, LandscapeError> {
        let guard = self.lock();
        let raw_run = id_to_i64(run_id.get(), "run").map_err(LandscapeError::from)?;
        let record = guard
            .query_row(
                "SELECT started_at, config_hash, canonical_version, status, export_status FROM \
                 runs WHERE run_id = ?1",
                params![raw_run],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        record
            .map(|(started_at, config_hash, canonical_version, status, export_status)| {
                Ok::<RunRecord, SqliteLandscapeError>(RunRecord {
                    run_id,
                    started_at: Timestamp::from_unix_millis(started_at),
                    config_hash: parse_digest(&config_hash)?,
                    canonical_version,
                    status: parse_run_status(&status)?,
                    export_status: parse_export_status(&export_status)?,
                })
            })
            .transpose()
            .map_err(LandscapeError::from)
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>, LandscapeError> {
        let guard = self.lock();
        let mut stmt = guard
            .prepare(
                "SELECT run_id, started_at, config_hash, canonical_version, status, \
                 export_status FROM runs ORDER BY run_id DESC",
            )
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let rows = stmt
            .query_map(params![], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let mut runs = Vec::new();
        for row in rows {
            let (raw_run, started_at, config_hash, canonical_version, status, export_status) =
                row.map_err(|err| LandscapeError::from(db_err(&err)))?;
            runs.push(RunRecord {
                run_id: id_from_i64(raw_run, RunId::from_raw, "run")
                    .map_err(LandscapeError::from)?,
                started_at: Timestamp::from_unix_millis(started_at),
                config_hash: parse_digest(&config_hash).map_err(LandscapeError::from)?,
                canonical_version,
                status: parse_run_status(&status).map_err(LandscapeError::from)?,
                export_status: parse_export_status(&export_status)
                    .map_err(LandscapeError::from)?,
            });
        }
        Ok(runs)
    }

    fn export_run(
        &self,
        run_id: RunId,
        secrets: &dyn SecretsProvider,
    ) -> Result<SignedExport, LandscapeError> {
        let key = secrets
            .fingerprint_key()
            .map_err(|err| LandscapeError::FingerprintKeyUnavailable(err.to_string()))?;
        let run = self
            .get_run(run_id)?
            .ok_or_else(|| LandscapeError::Invalid(format!("unknown run: {run_id}")))?;
        let outcomes = self.collect_run_outcomes(run_id)?;
        let checkpoints = self.list_checkpoints(run_id)?;
        let payload = json!({
            "run": run,
            "outcomes": outcomes,
            "checkpoints": checkpoints,
        });
        let bytes = canonical_json_bytes(&payload)
            .map_err(|err| LandscapeError::Invalid(err.to_string()))?;
        let payload_hash = hash_bytes(DEFAULT_HASH_ALGORITHM, &bytes);
        let mut keyed = key.material().to_vec();
        keyed.push(0);
        keyed.extend_from_slice(&bytes);
        let signature = hash_bytes(DEFAULT_HASH_ALGORITHM, &keyed).value;
        {
            let mut guard = self.lock();
            let tx = guard.transaction().map_err(|err| LandscapeError::from(db_err(&err)))?;
            tx.execute(
                "UPDATE runs SET export_status = ?1 WHERE run_id = ?2",
                params![
                    export_status_label(ExportStatus::Exported),
                    id_to_i64(run_id.get(), "run").map_err(LandscapeError::from)?
                ],
            )
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
            tx.commit().map_err(|err| LandscapeError::from(db_err(&err)))?;
        }
        Ok(SignedExport {
            run_id,
            payload,
            payload_hash,
            signature,
            key_id: key.key_id.clone(),
        })
    }
}

// ============================================================================
// SECTION: Query Helpers
// ============================================================================

/// Raw outcome row shape shared by outcome queries.
type RawOutcomeRow = (
    i64,
    i64,
    String,
    i64,
    i64,
    Option<String>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<String>,
    Option<String>,
);

/// Maps one outcome row into its raw tuple.
fn map_outcome_row(row: &rusqlite::Row<'_>) -> Result<RawOutcomeRow, rusqlite::Error> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

/// Builds a typed outcome record from a raw row.
fn build_outcome_record(
    raw: RawOutcomeRow,
    token_id: TokenId,
) -> Result<TokenOutcomeRecord, SqliteLandscapeError> {
    let (
        raw_outcome_id,
        raw_run,
        outcome,
        is_terminal,
        recorded_at,
        sink_name,
        batch_id,
        fork_group,
        join_group,
        expand_group,
        error_hash,
        context_json,
    ) = raw;
    let context_json = context_json
        .map(|text| {
            serde_json::from_str::<Value>(&text).map_err(|err| {
                SqliteLandscapeError::Corrupt(format!("malformed outcome context: {err}"))
            })
        })
        .transpose()?;
    Ok(TokenOutcomeRecord {
        outcome_id: id_from_i64(raw_outcome_id, OutcomeId::from_raw, "outcome")?,
        run_id: id_from_i64(raw_run, RunId::from_raw, "run")?,
        token_id,
        outcome: parse_outcome(&outcome)?,
        is_terminal: is_terminal != 0,
        recorded_at: Timestamp::from_unix_millis(recorded_at),
        context: OutcomeContext {
            sink_name: sink_name.map(SinkName::new),
            batch_id: batch_id
                .map(|raw| id_from_i64(raw, BatchId::from_raw, "batch"))
                .transpose()?,
            fork_group_id: fork_group
                .map(|raw| id_from_i64(raw, elspeth_core::ForkGroupId::from_raw, "fork group"))
                .transpose()?,
            join_group_id: join_group
                .map(|raw| id_from_i64(raw, elspeth_core::JoinGroupId::from_raw, "join group"))
                .transpose()?,
            expand_group_id: expand_group
                .map(|raw| {
                    id_from_i64(raw, elspeth_core::ExpandGroupId::from_raw, "expand group")
                })
                .transpose()?,
            error_hash: error_hash.as_deref().map(parse_digest).transpose()?,
            context_json,
        },
    })
}

impl SqliteLandscape {
    /// Collects all outcomes of a run for export.
    fn collect_run_outcomes(
        &self,
        run_id: RunId,
    ) -> Result<Vec<TokenOutcomeRecord>, LandscapeError> {
        let guard = self.lock();
        let mut stmt = guard
            .prepare(
                "SELECT outcome_id, run_id, outcome, is_terminal, recorded_at, sink_name, \
                 batch_id, fork_group_id, join_group_id, expand_group_id, error_hash, \
                 context_json, token_id FROM token_outcomes WHERE run_id = ?1 ORDER BY \
                 outcome_id ASC",
            )
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let raw_run = id_to_i64(run_id.get(), "run").map_err(LandscapeError::from)?;
        let rows = stmt
            .query_map(params![raw_run], |row| {
                let raw = map_outcome_row(row)?;
                let token: i64 = row.get(12)?;
                Ok((raw, token))
            })
            .map_err(|err| LandscapeError::from(db_err(&err)))?;
        let mut outcomes = Vec::new();
        for row in rows {
            let (raw, raw_token) = row.map_err(|err| LandscapeError::from(db_err(&err)))?;
            let token_id = id_from_i64(raw_token, TokenId::from_raw, "token")
                .map_err(LandscapeError::from)?;
            outcomes.push(build_outcome_record(raw, token_id).map_err(LandscapeError::from)?);
        }
        Ok(outcomes)
    }
}
