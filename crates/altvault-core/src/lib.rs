//! Dialect-agnostic identity/alt persistence engine.
//!
//! One identity owns one or more named alternative profiles (alts),
//! exactly one of which is active at a time, plus per-alt permission
//! grants and an opaque inventory snapshot. The engine implements the
//! consistency model once, against a portable primitive set
//! ([`Dialect`] for SQL text, [`Backend`] for statement execution),
//! so every backend shares the same limit, uniqueness, ownership and
//! session-switch behavior.

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("connection unavailable: {0}")]
    Unavailable(String),
    #[error("unique constraint violation: {0}")]
    UniqueViolation(String),
    #[error("backend failure: {0}")]
    Other(String),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("unexpected row shape: {0}")]
    Row(String),
}

/// Stable external identifier for an end user (e.g. a UUID string).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(raw: impl Into<String>) -> Result<Self, EngineError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(EngineError::Validation(
                "identity id must be non-empty".to_string(),
            ));
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for IdentityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Alt identifier, derived as `{identity_id}-{index}` with index 0 as
/// the primary alt.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AltId(String);

impl AltId {
    pub fn new(raw: impl Into<String>) -> Result<Self, EngineError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(EngineError::Validation(
                "alt id must be non-empty".to_string(),
            ));
        }
        Ok(Self(raw))
    }

    /// Index-derived alt id. The next index is the current alt count,
    /// not `MAX(index) + 1`; see the engine notes on index reuse.
    #[must_use]
    pub fn derived(identity: &IdentityId, index: u64) -> Self {
        Self(format!("{}-{}", identity.as_str(), index))
    }

    #[must_use]
    pub fn primary(identity: &IdentityId) -> Self {
        Self::derived(identity, 0)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AltId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenameOutcome {
    Renamed,
    /// The target name is already carried by a sibling alt; nothing
    /// was written.
    NameConflict,
    /// The alt does not exist or is not owned by the identity.
    NotFound,
}

/// One row of `list_alts`: the human-facing label is the display name
/// when set, otherwise the alt id itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AltEntry {
    pub alt_id: AltId,
    pub display_name: Option<String>,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AltStatusEntry {
    pub alt_id: AltId,
    pub label: String,
    pub display_name: Option<String>,
    pub permission_count: u64,
    pub has_snapshot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityStatus {
    pub contract_version: String,
    pub identity_id: IdentityId,
    pub alt_limit: u32,
    pub alt_count: u64,
    pub active_alt_id: Option<AltId>,
    pub alts: Vec<AltStatusEntry>,
}

/// Parameter/result value for the backend abstraction. The engine
/// never needs REAL columns.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Option<String>> for SqlValue {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(text) => Self::Text(text),
            None => Self::Null,
        }
    }
}

impl From<&[u8]> for SqlValue {
    fn from(value: &[u8]) -> Self {
        Self::Blob(value.to_vec())
    }
}

pub type SqlRow = Vec<SqlValue>;

/// Live connection handle to one storage engine. Implementations map
/// native constraint errors to [`BackendError::UniqueViolation`]; that
/// classification is the only error detail the engine relies on.
pub trait Backend {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, BackendError>;

    fn query_rows(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, BackendError>;

    fn query_row(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<SqlRow>, BackendError> {
        Ok(self.query_rows(sql, params)?.into_iter().next())
    }
}

/// SQL text for one storage engine. Placeholder style and upsert
/// idiom differ per dialect; parameter order is fixed and documented
/// on each method, so the engine binds positionally. No business
/// logic lives here.
pub trait Dialect: Sync {
    fn name(&self) -> &'static str;

    /// Idempotent DDL for the four tables and their indexes.
    fn schema_statements(&self) -> &'static [&'static str];

    fn begin_exclusive(&self) -> &'static str;
    fn commit(&self) -> &'static str;
    fn rollback(&self) -> &'static str;

    /// Params: `(id, created_at, updated_at)`. Inserts with default
    /// limit 1, refreshes `updated_at` when the row exists.
    fn upsert_identity(&self) -> &'static str;
    /// Params: `(id)`.
    fn select_limit(&self) -> &'static str;
    /// Params: `(amount, updated_at, id)`.
    fn increment_limit(&self) -> &'static str;

    /// Params: `(identity_id)`.
    fn count_alts(&self) -> &'static str;
    /// Params: `(alt_id, identity_id, created_at, updated_at)`.
    fn insert_alt(&self) -> &'static str;
    /// Params: `(display_name, updated_at, alt_id, identity_id)`.
    fn update_alt_name(&self) -> &'static str;
    /// Params: `(identity_id, alt_id)`.
    fn select_alt_name(&self) -> &'static str;
    /// Params: `(identity_id, display_name)`.
    fn select_alt_by_name(&self) -> &'static str;
    /// Params: `(identity_id)`. Columns: `alt_id, display_name,
    /// has_storage (0/1)`, ordered by `alt_id` ascending.
    fn select_alts(&self) -> &'static str;
    /// Params: `(identity_id, alt_id)`.
    fn alt_exists(&self) -> &'static str;

    /// Params: `(identity_id, active_alt_id)`. Never overwrites an
    /// existing session row.
    fn insert_session_if_absent(&self) -> &'static str;
    /// Params: `(identity_id, active_alt_id)`.
    fn upsert_session(&self) -> &'static str;
    /// Params: `(identity_id)`.
    fn select_active_alt(&self) -> &'static str;

    /// Params: `(alt_id, name, created_at, updated_at)`. Refreshes
    /// `updated_at` on a duplicate `(alt_id, name)` pair.
    fn upsert_permission(&self) -> &'static str;
    /// Params: `(alt_id, name)`.
    fn permission_exists(&self) -> &'static str;
    /// Params: `(alt_id)`.
    fn count_permissions(&self) -> &'static str;

    /// Params: `(storage, updated_at, alt_id, identity_id)`.
    fn update_alt_storage(&self) -> &'static str;
    /// Params: `(identity_id, alt_id)`.
    fn select_alt_storage(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy)]
pub struct SqliteDialect;

pub static SQLITE: SqliteDialect = SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn schema_statements(&self) -> &'static [&'static str] {
        &[
            "CREATE TABLE IF NOT EXISTS identities (
                id TEXT PRIMARY KEY,
                alt_limit INTEGER NOT NULL DEFAULT 1 CHECK (alt_limit >= 0),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS alts (
                alt_id TEXT PRIMARY KEY,
                identity_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
                display_name TEXT,
                storage BLOB,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_alts_identity_display_name
                ON alts(identity_id, display_name)",
            "CREATE INDEX IF NOT EXISTS idx_alts_identity ON alts(identity_id)",
            "CREATE TABLE IF NOT EXISTS sessions (
                identity_id TEXT PRIMARY KEY REFERENCES identities(id) ON DELETE CASCADE,
                active_alt_id TEXT REFERENCES alts(alt_id)
            )",
            "CREATE TABLE IF NOT EXISTS permissions (
                alt_id TEXT NOT NULL REFERENCES alts(alt_id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (alt_id, name)
            )",
        ]
    }

    fn begin_exclusive(&self) -> &'static str {
        "BEGIN IMMEDIATE"
    }

    fn commit(&self) -> &'static str {
        "COMMIT"
    }

    fn rollback(&self) -> &'static str {
        "ROLLBACK"
    }

    fn upsert_identity(&self) -> &'static str {
        "INSERT INTO identities(id, alt_limit, created_at, updated_at)
         VALUES (?1, 1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at"
    }

    fn select_limit(&self) -> &'static str {
        "SELECT alt_limit FROM identities WHERE id = ?1"
    }

    fn increment_limit(&self) -> &'static str {
        "UPDATE identities SET alt_limit = alt_limit + ?1, updated_at = ?2 WHERE id = ?3"
    }

    fn count_alts(&self) -> &'static str {
        "SELECT COUNT(*) FROM alts WHERE identity_id = ?1"
    }

    fn insert_alt(&self) -> &'static str {
        "INSERT INTO alts(alt_id, identity_id, display_name, storage, created_at, updated_at)
         VALUES (?1, ?2, NULL, NULL, ?3, ?4)"
    }

    fn update_alt_name(&self) -> &'static str {
        "UPDATE alts SET display_name = ?1, updated_at = ?2 WHERE alt_id = ?3 AND identity_id = ?4"
    }

    fn select_alt_name(&self) -> &'static str {
        "SELECT display_name FROM alts WHERE identity_id = ?1 AND alt_id = ?2"
    }

    fn select_alt_by_name(&self) -> &'static str {
        "SELECT alt_id FROM alts WHERE identity_id = ?1 AND display_name = ?2"
    }

    fn select_alts(&self) -> &'static str {
        "SELECT alt_id, display_name, CASE WHEN storage IS NULL THEN 0 ELSE 1 END
         FROM alts WHERE identity_id = ?1 ORDER BY alt_id ASC"
    }

    fn alt_exists(&self) -> &'static str {
        "SELECT 1 FROM alts WHERE identity_id = ?1 AND alt_id = ?2"
    }

    fn insert_session_if_absent(&self) -> &'static str {
        "INSERT INTO sessions(identity_id, active_alt_id) VALUES (?1, ?2)
         ON CONFLICT(identity_id) DO NOTHING"
    }

    fn upsert_session(&self) -> &'static str {
        "INSERT INTO sessions(identity_id, active_alt_id) VALUES (?1, ?2)
         ON CONFLICT(identity_id) DO UPDATE SET active_alt_id = excluded.active_alt_id"
    }

    fn select_active_alt(&self) -> &'static str {
        "SELECT active_alt_id FROM sessions WHERE identity_id = ?1"
    }

    fn upsert_permission(&self) -> &'static str {
        "INSERT INTO permissions(alt_id, name, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(alt_id, name) DO UPDATE SET updated_at = excluded.updated_at"
    }

    fn permission_exists(&self) -> &'static str {
        "SELECT 1 FROM permissions WHERE alt_id = ?1 AND name = ?2"
    }

    fn count_permissions(&self) -> &'static str {
        "SELECT COUNT(*) FROM permissions WHERE alt_id = ?1"
    }

    fn update_alt_storage(&self) -> &'static str {
        "UPDATE alts SET storage = ?1, updated_at = ?2 WHERE alt_id = ?3 AND identity_id = ?4"
    }

    fn select_alt_storage(&self) -> &'static str {
        "SELECT storage FROM alts WHERE identity_id = ?1 AND alt_id = ?2"
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MysqlDialect;

pub static MYSQL: MysqlDialect = MysqlDialect;

impl Dialect for MysqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn schema_statements(&self) -> &'static [&'static str] {
        &[
            "CREATE TABLE IF NOT EXISTS identities (
                id VARCHAR(191) NOT NULL,
                alt_limit INT NOT NULL DEFAULT 1,
                created_at VARCHAR(40) NOT NULL,
                updated_at VARCHAR(40) NOT NULL,
                PRIMARY KEY (id)
            ) ENGINE=InnoDB",
            "CREATE TABLE IF NOT EXISTS alts (
                alt_id VARCHAR(191) NOT NULL,
                identity_id VARCHAR(191) NOT NULL,
                display_name VARCHAR(191) NULL,
                storage LONGBLOB NULL,
                created_at VARCHAR(40) NOT NULL,
                updated_at VARCHAR(40) NOT NULL,
                PRIMARY KEY (alt_id),
                UNIQUE KEY uq_alts_identity_display_name (identity_id, display_name),
                KEY idx_alts_identity (identity_id),
                CONSTRAINT fk_alts_identity FOREIGN KEY (identity_id)
                    REFERENCES identities(id) ON DELETE CASCADE
            ) ENGINE=InnoDB",
            "CREATE TABLE IF NOT EXISTS sessions (
                identity_id VARCHAR(191) NOT NULL,
                active_alt_id VARCHAR(191) NULL,
                PRIMARY KEY (identity_id),
                CONSTRAINT fk_sessions_identity FOREIGN KEY (identity_id)
                    REFERENCES identities(id) ON DELETE CASCADE,
                CONSTRAINT fk_sessions_alt FOREIGN KEY (active_alt_id)
                    REFERENCES alts(alt_id)
            ) ENGINE=InnoDB",
            "CREATE TABLE IF NOT EXISTS permissions (
                alt_id VARCHAR(191) NOT NULL,
                name VARCHAR(191) NOT NULL,
                created_at VARCHAR(40) NOT NULL,
                updated_at VARCHAR(40) NOT NULL,
                UNIQUE KEY uq_permissions_alt_name (alt_id, name),
                CONSTRAINT fk_permissions_alt FOREIGN KEY (alt_id)
                    REFERENCES alts(alt_id) ON DELETE CASCADE
            ) ENGINE=InnoDB",
        ]
    }

    fn begin_exclusive(&self) -> &'static str {
        "START TRANSACTION"
    }

    fn commit(&self) -> &'static str {
        "COMMIT"
    }

    fn rollback(&self) -> &'static str {
        "ROLLBACK"
    }

    fn upsert_identity(&self) -> &'static str {
        "INSERT INTO identities(id, alt_limit, created_at, updated_at)
         VALUES (?, 1, ?, ?)
         ON DUPLICATE KEY UPDATE updated_at = VALUES(updated_at)"
    }

    fn select_limit(&self) -> &'static str {
        "SELECT alt_limit FROM identities WHERE id = ?"
    }

    fn increment_limit(&self) -> &'static str {
        "UPDATE identities SET alt_limit = alt_limit + ?, updated_at = ? WHERE id = ?"
    }

    fn count_alts(&self) -> &'static str {
        "SELECT COUNT(*) FROM alts WHERE identity_id = ?"
    }

    fn insert_alt(&self) -> &'static str {
        "INSERT INTO alts(alt_id, identity_id, display_name, storage, created_at, updated_at)
         VALUES (?, ?, NULL, NULL, ?, ?)"
    }

    fn update_alt_name(&self) -> &'static str {
        "UPDATE alts SET display_name = ?, updated_at = ? WHERE alt_id = ? AND identity_id = ?"
    }

    fn select_alt_name(&self) -> &'static str {
        "SELECT display_name FROM alts WHERE identity_id = ? AND alt_id = ?"
    }

    fn select_alt_by_name(&self) -> &'static str {
        "SELECT alt_id FROM alts WHERE identity_id = ? AND display_name = ?"
    }

    fn select_alts(&self) -> &'static str {
        "SELECT alt_id, display_name, CASE WHEN storage IS NULL THEN 0 ELSE 1 END
         FROM alts WHERE identity_id = ? ORDER BY alt_id ASC"
    }

    fn alt_exists(&self) -> &'static str {
        "SELECT 1 FROM alts WHERE identity_id = ? AND alt_id = ?"
    }

    fn insert_session_if_absent(&self) -> &'static str {
        "INSERT IGNORE INTO sessions(identity_id, active_alt_id) VALUES (?, ?)"
    }

    fn upsert_session(&self) -> &'static str {
        "INSERT INTO sessions(identity_id, active_alt_id) VALUES (?, ?)
         ON DUPLICATE KEY UPDATE active_alt_id = VALUES(active_alt_id)"
    }

    fn select_active_alt(&self) -> &'static str {
        "SELECT active_alt_id FROM sessions WHERE identity_id = ?"
    }

    fn upsert_permission(&self) -> &'static str {
        "INSERT INTO permissions(alt_id, name, created_at, updated_at)
         VALUES (?, ?, ?, ?)
         ON DUPLICATE KEY UPDATE updated_at = VALUES(updated_at)"
    }

    fn permission_exists(&self) -> &'static str {
        "SELECT 1 FROM permissions WHERE alt_id = ? AND name = ?"
    }

    fn count_permissions(&self) -> &'static str {
        "SELECT COUNT(*) FROM permissions WHERE alt_id = ?"
    }

    fn update_alt_storage(&self) -> &'static str {
        "UPDATE alts SET storage = ?, updated_at = ? WHERE alt_id = ? AND identity_id = ?"
    }

    fn select_alt_storage(&self) -> &'static str {
        "SELECT storage FROM alts WHERE identity_id = ? AND alt_id = ?"
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PostgresDialect;

pub static POSTGRES: PostgresDialect = PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn schema_statements(&self) -> &'static [&'static str] {
        &[
            "CREATE TABLE IF NOT EXISTS identities (
                id TEXT PRIMARY KEY,
                alt_limit INTEGER NOT NULL DEFAULT 1 CHECK (alt_limit >= 0),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS alts (
                alt_id TEXT PRIMARY KEY,
                identity_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
                display_name TEXT,
                storage BYTEA,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_alts_identity_display_name
                ON alts(identity_id, display_name)",
            "CREATE INDEX IF NOT EXISTS idx_alts_identity ON alts(identity_id)",
            "CREATE TABLE IF NOT EXISTS sessions (
                identity_id TEXT PRIMARY KEY REFERENCES identities(id) ON DELETE CASCADE,
                active_alt_id TEXT REFERENCES alts(alt_id)
            )",
            "CREATE TABLE IF NOT EXISTS permissions (
                alt_id TEXT NOT NULL REFERENCES alts(alt_id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (alt_id, name)
            )",
        ]
    }

    fn begin_exclusive(&self) -> &'static str {
        "BEGIN ISOLATION LEVEL SERIALIZABLE"
    }

    fn commit(&self) -> &'static str {
        "COMMIT"
    }

    fn rollback(&self) -> &'static str {
        "ROLLBACK"
    }

    fn upsert_identity(&self) -> &'static str {
        "INSERT INTO identities(id, alt_limit, created_at, updated_at)
         VALUES ($1, 1, $2, $3)
         ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at"
    }

    fn select_limit(&self) -> &'static str {
        "SELECT alt_limit FROM identities WHERE id = $1"
    }

    fn increment_limit(&self) -> &'static str {
        "UPDATE identities SET alt_limit = alt_limit + $1, updated_at = $2 WHERE id = $3"
    }

    fn count_alts(&self) -> &'static str {
        "SELECT COUNT(*) FROM alts WHERE identity_id = $1"
    }

    fn insert_alt(&self) -> &'static str {
        "INSERT INTO alts(alt_id, identity_id, display_name, storage, created_at, updated_at)
         VALUES ($1, $2, NULL, NULL, $3, $4)"
    }

    fn update_alt_name(&self) -> &'static str {
        "UPDATE alts SET display_name = $1, updated_at = $2 WHERE alt_id = $3 AND identity_id = $4"
    }

    fn select_alt_name(&self) -> &'static str {
        "SELECT display_name FROM alts WHERE identity_id = $1 AND alt_id = $2"
    }

    fn select_alt_by_name(&self) -> &'static str {
        "SELECT alt_id FROM alts WHERE identity_id = $1 AND display_name = $2"
    }

    fn select_alts(&self) -> &'static str {
        "SELECT alt_id, display_name, CASE WHEN storage IS NULL THEN 0 ELSE 1 END
         FROM alts WHERE identity_id = $1 ORDER BY alt_id ASC"
    }

    fn alt_exists(&self) -> &'static str {
        "SELECT 1 FROM alts WHERE identity_id = $1 AND alt_id = $2"
    }

    fn insert_session_if_absent(&self) -> &'static str {
        "INSERT INTO sessions(identity_id, active_alt_id) VALUES ($1, $2)
         ON CONFLICT(identity_id) DO NOTHING"
    }

    fn upsert_session(&self) -> &'static str {
        "INSERT INTO sessions(identity_id, active_alt_id) VALUES ($1, $2)
         ON CONFLICT(identity_id) DO UPDATE SET active_alt_id = excluded.active_alt_id"
    }

    fn select_active_alt(&self) -> &'static str {
        "SELECT active_alt_id FROM sessions WHERE identity_id = $1"
    }

    fn upsert_permission(&self) -> &'static str {
        "INSERT INTO permissions(alt_id, name, created_at, updated_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT(alt_id, name) DO UPDATE SET updated_at = excluded.updated_at"
    }

    fn permission_exists(&self) -> &'static str {
        "SELECT 1 FROM permissions WHERE alt_id = $1 AND name = $2"
    }

    fn count_permissions(&self) -> &'static str {
        "SELECT COUNT(*) FROM permissions WHERE alt_id = $1"
    }

    fn update_alt_storage(&self) -> &'static str {
        "UPDATE alts SET storage = $1, updated_at = $2 WHERE alt_id = $3 AND identity_id = $4"
    }

    fn select_alt_storage(&self) -> &'static str {
        "SELECT storage FROM alts WHERE identity_id = $1 AND alt_id = $2"
    }
}

/// The persistence engine: six stores over one connection. Expected
/// conditions (limit reached, name conflict, unowned alt, missing
/// row) are sentinel results, never `Err`; `Err` means the backend
/// itself failed.
///
/// Every cross-step invariant (count-then-insert, ownership-then-
/// switch, session-then-storage) runs inside an exclusive transaction
/// so two connections cannot interleave between the check and the
/// write. In-process callers are already serialized by `&mut self`.
pub struct AltEngine<B: Backend> {
    backend: B,
    dialect: &'static dyn Dialect,
}

impl<B: Backend> AltEngine<B> {
    pub fn new(backend: B, dialect: &'static dyn Dialect) -> Self {
        Self { backend, dialect }
    }

    #[must_use]
    pub fn dialect_name(&self) -> &'static str {
        self.dialect.name()
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Creates the four tables and their indexes if absent. Safe to
    /// call repeatedly. A failure here is fatal; callers must abort
    /// startup rather than continue against a partial schema.
    pub fn ensure_schema(&mut self) -> Result<(), EngineError> {
        for statement in self.dialect.schema_statements() {
            self.backend.execute(statement, &[])?;
        }
        Ok(())
    }

    /// Bootstrap for a first-seen identifier: identity row (default
    /// limit 1), primary alt `{id}-0`, session row pointing at the
    /// primary alt. Idempotent; a later call only refreshes the
    /// identity `updated_at` and never touches an existing session
    /// pointer.
    pub fn ensure_exist(&mut self, identity: &IdentityId) -> Result<(), EngineError> {
        let now = rfc3339_now()?;
        let primary = AltId::primary(identity);
        self.in_tx(|backend, dialect| {
            upsert_identity(backend, dialect, identity, &now)?;
            if !alt_owned(backend, dialect, identity, &primary)? {
                backend.execute(
                    dialect.insert_alt(),
                    &[
                        primary.as_str().into(),
                        identity.as_str().into(),
                        now.as_str().into(),
                        now.as_str().into(),
                    ],
                )?;
            }
            backend.execute(
                dialect.insert_session_if_absent(),
                &[identity.as_str().into(), primary.as_str().into()],
            )?;
            Ok(())
        })
    }

    /// Ensures the identity row exists and returns its alt limit.
    pub fn get_limit(&mut self, identity: &IdentityId) -> Result<u32, EngineError> {
        let now = rfc3339_now()?;
        upsert_identity(&mut self.backend, self.dialect, identity, &now)?;
        select_limit(&mut self.backend, self.dialect, identity)
    }

    /// Atomically raises the alt limit. A negative amount is rejected
    /// without mutation. Returns whether a row was updated.
    pub fn add_limit(&mut self, identity: &IdentityId, amount: i64) -> Result<bool, EngineError> {
        if amount < 0 {
            return Ok(false);
        }
        let now = rfc3339_now()?;
        upsert_identity(&mut self.backend, self.dialect, identity, &now)?;
        let updated = self.backend.execute(
            self.dialect.increment_limit(),
            &[amount.into(), now.as_str().into(), identity.as_str().into()],
        )?;
        Ok(updated > 0)
    }

    /// Creates the next alt for the identity, or returns `Ok(None)`
    /// when the identity is at its limit. The next index is the
    /// current alt count; an index collision lost to a concurrent
    /// creator is reported as `Ok(None)` as well.
    pub fn create_alt(&mut self, identity: &IdentityId) -> Result<Option<AltId>, EngineError> {
        let now = rfc3339_now()?;
        self.in_tx(|backend, dialect| {
            upsert_identity(backend, dialect, identity, &now)?;
            let limit = select_limit(backend, dialect, identity)?;
            let count = count_alts(backend, dialect, identity)?;
            if count >= u64::from(limit) {
                return Ok(None);
            }
            let alt = AltId::derived(identity, count);
            let inserted = backend.execute(
                dialect.insert_alt(),
                &[
                    alt.as_str().into(),
                    identity.as_str().into(),
                    now.as_str().into(),
                    now.as_str().into(),
                ],
            );
            match inserted {
                Ok(_) => Ok(Some(alt)),
                Err(BackendError::UniqueViolation(_)) => Ok(None),
                Err(err) => Err(err.into()),
            }
        })
    }

    /// Renames an alt (`None` clears the name). The unique index on
    /// `(identity_id, display_name)` is the final arbiter: a
    /// violation surfaces as [`RenameOutcome::NameConflict`], an
    /// unmatched ownership predicate as [`RenameOutcome::NotFound`].
    pub fn rename_alt(
        &mut self,
        identity: &IdentityId,
        alt: &AltId,
        new_name: Option<&str>,
    ) -> Result<RenameOutcome, EngineError> {
        let now = rfc3339_now()?;
        let updated = self.backend.execute(
            self.dialect.update_alt_name(),
            &[
                new_name.map(str::to_string).into(),
                now.as_str().into(),
                alt.as_str().into(),
                identity.as_str().into(),
            ],
        );
        match updated {
            Ok(0) => Ok(RenameOutcome::NotFound),
            Ok(_) => Ok(RenameOutcome::Renamed),
            Err(BackendError::UniqueViolation(_)) => Ok(RenameOutcome::NameConflict),
            Err(err) => Err(err.into()),
        }
    }

    pub fn alt_name(
        &mut self,
        identity: &IdentityId,
        alt: &AltId,
    ) -> Result<Option<String>, EngineError> {
        let row = self.backend.query_row(
            self.dialect.select_alt_name(),
            &[identity.as_str().into(), alt.as_str().into()],
        )?;
        match row {
            Some(row) => row_opt_text(&row, 0),
            None => Ok(None),
        }
    }

    /// Maps a display name back to the alt carrying it, if any.
    pub fn alt_id_by_name(
        &mut self,
        identity: &IdentityId,
        name: &str,
    ) -> Result<Option<AltId>, EngineError> {
        let row = self.backend.query_row(
            self.dialect.select_alt_by_name(),
            &[identity.as_str().into(), name.into()],
        )?;
        match row {
            Some(row) => {
                let raw = row_text(&row, 0)?;
                Ok(Some(AltId::new(raw)?))
            }
            None => Ok(None),
        }
    }

    /// All alts of the identity ordered by alt id ascending. The
    /// label of each entry is the display name when set, else the alt
    /// id, and always maps back through [`Self::alt_id_by_name`].
    pub fn list_alts(&mut self, identity: &IdentityId) -> Result<Vec<AltEntry>, EngineError> {
        let rows = self
            .backend
            .query_rows(self.dialect.select_alts(), &[identity.as_str().into()])?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let alt_id = AltId::new(row_text(&row, 0)?)?;
            let display_name = row_opt_text(&row, 1)?;
            let label = display_name
                .clone()
                .unwrap_or_else(|| alt_id.as_str().to_string());
            entries.push(AltEntry {
                alt_id,
                display_name,
                label,
            });
        }
        Ok(entries)
    }

    pub fn alt_count(&mut self, identity: &IdentityId) -> Result<u64, EngineError> {
        count_alts(&mut self.backend, self.dialect, identity)
    }

    /// Defensive ownership check used by every operation that accepts
    /// a caller-supplied alt id.
    pub fn is_owned_by(
        &mut self,
        identity: &IdentityId,
        alt: &AltId,
    ) -> Result<bool, EngineError> {
        alt_owned(&mut self.backend, self.dialect, identity, alt)
    }

    /// Atomic session switch: ownership is re-validated inside the
    /// same transaction as the pointer write, so the session can
    /// never point at a foreign identity's alt. Returns `Ok(false)`
    /// and changes nothing when the alt is not owned.
    pub fn switch_active_alt(
        &mut self,
        identity: &IdentityId,
        alt: &AltId,
    ) -> Result<bool, EngineError> {
        self.in_tx(|backend, dialect| {
            if !alt_owned(backend, dialect, identity, alt)? {
                return Ok(false);
            }
            backend.execute(
                dialect.upsert_session(),
                &[identity.as_str().into(), alt.as_str().into()],
            )?;
            Ok(true)
        })
    }

    /// `Ok(None)` when no session row exists or the pointer is null.
    pub fn active_alt(&mut self, identity: &IdentityId) -> Result<Option<AltId>, EngineError> {
        active_alt(&mut self.backend, self.dialect, identity)
    }

    /// Idempotent grant: a duplicate `(alt, name)` pair refreshes
    /// `updated_at` instead of failing. `Ok(false)` only when the
    /// name is empty or the alt is not owned by the identity.
    pub fn grant_permission(
        &mut self,
        identity: &IdentityId,
        alt: &AltId,
        name: &str,
    ) -> Result<bool, EngineError> {
        if name.trim().is_empty() {
            return Ok(false);
        }
        let now = rfc3339_now()?;
        self.in_tx(|backend, dialect| {
            if !alt_owned(backend, dialect, identity, alt)? {
                return Ok(false);
            }
            backend.execute(
                dialect.upsert_permission(),
                &[
                    alt.as_str().into(),
                    name.into(),
                    now.as_str().into(),
                    now.as_str().into(),
                ],
            )?;
            Ok(true)
        })
    }

    /// `Ok(false)` (not an error) when the alt is not owned by the
    /// identity or the grant is absent.
    pub fn has_permission(
        &mut self,
        identity: &IdentityId,
        alt: &AltId,
        name: &str,
    ) -> Result<bool, EngineError> {
        if !alt_owned(&mut self.backend, self.dialect, identity, alt)? {
            return Ok(false);
        }
        let row = self.backend.query_row(
            self.dialect.permission_exists(),
            &[alt.as_str().into(), name.into()],
        )?;
        Ok(row.is_some())
    }

    /// Overwrites the active alt's snapshot. The payload is opaque;
    /// no part of it is inspected. `Ok(false)` when the identity has
    /// no active alt.
    pub fn save_snapshot(
        &mut self,
        identity: &IdentityId,
        payload: &[u8],
    ) -> Result<bool, EngineError> {
        let now = rfc3339_now()?;
        self.in_tx(|backend, dialect| {
            let Some(active) = active_alt(backend, dialect, identity)? else {
                return Ok(false);
            };
            let updated = backend.execute(
                dialect.update_alt_storage(),
                &[
                    payload.into(),
                    now.as_str().into(),
                    active.as_str().into(),
                    identity.as_str().into(),
                ],
            )?;
            Ok(updated > 0)
        })
    }

    /// Returns the active alt's snapshot bytes verbatim, or `Ok(None)`
    /// when there is no active alt or nothing was ever saved. Both
    /// are normal conditions a caller must distinguish from `Err`.
    pub fn load_snapshot(
        &mut self,
        identity: &IdentityId,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        let Some(active) = active_alt(&mut self.backend, self.dialect, identity)? else {
            return Ok(None);
        };
        let row = self.backend.query_row(
            self.dialect.select_alt_storage(),
            &[identity.as_str().into(), active.as_str().into()],
        )?;
        match row {
            Some(row) => row_opt_blob(&row, 0),
            None => Ok(None),
        }
    }

    /// Read-only composite over all four tables; `Ok(None)` when the
    /// identity has never been seen (no row is created).
    pub fn identity_status(
        &mut self,
        identity: &IdentityId,
    ) -> Result<Option<IdentityStatus>, EngineError> {
        let Some(limit_row) = self
            .backend
            .query_row(self.dialect.select_limit(), &[identity.as_str().into()])?
        else {
            return Ok(None);
        };
        let limit = row_i64(&limit_row, 0)?;
        let alt_limit = u32::try_from(limit)
            .map_err(|_| EngineError::Row(format!("invalid alt_limit: {limit}")))?;

        let active_alt_id = active_alt(&mut self.backend, self.dialect, identity)?;
        let rows = self
            .backend
            .query_rows(self.dialect.select_alts(), &[identity.as_str().into()])?;

        let mut alts = Vec::with_capacity(rows.len());
        for row in rows {
            let alt_id = AltId::new(row_text(&row, 0)?)?;
            let display_name = row_opt_text(&row, 1)?;
            let has_snapshot = row_i64(&row, 2)? != 0;
            let perm_row = self.backend.query_row(
                self.dialect.count_permissions(),
                &[alt_id.as_str().into()],
            )?;
            let permission_count = match perm_row {
                Some(row) => u64::try_from(row_i64(&row, 0)?).unwrap_or(0),
                None => 0,
            };
            let label = display_name
                .clone()
                .unwrap_or_else(|| alt_id.as_str().to_string());
            alts.push(AltStatusEntry {
                alt_id,
                label,
                display_name,
                permission_count,
                has_snapshot,
            });
        }

        Ok(Some(IdentityStatus {
            contract_version: "identity_status.v1".to_string(),
            identity_id: identity.clone(),
            alt_limit,
            alt_count: alts.len() as u64,
            active_alt_id,
            alts,
        }))
    }

    fn in_tx<T>(
        &mut self,
        op: impl FnOnce(&mut B, &'static dyn Dialect) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let dialect = self.dialect;
        self.backend.execute(dialect.begin_exclusive(), &[])?;
        match op(&mut self.backend, dialect) {
            Ok(value) => {
                self.backend.execute(dialect.commit(), &[])?;
                Ok(value)
            }
            Err(err) => {
                // Best effort; the original error is the one worth surfacing.
                let _ = self.backend.execute(dialect.rollback(), &[]);
                Err(err)
            }
        }
    }
}

fn upsert_identity<B: Backend>(
    backend: &mut B,
    dialect: &dyn Dialect,
    identity: &IdentityId,
    now: &str,
) -> Result<(), EngineError> {
    backend.execute(
        dialect.upsert_identity(),
        &[identity.as_str().into(), now.into(), now.into()],
    )?;
    Ok(())
}

fn select_limit<B: Backend>(
    backend: &mut B,
    dialect: &dyn Dialect,
    identity: &IdentityId,
) -> Result<u32, EngineError> {
    let row = backend
        .query_row(dialect.select_limit(), &[identity.as_str().into()])?
        .ok_or_else(|| EngineError::Row("identity row missing after upsert".to_string()))?;
    let limit = row_i64(&row, 0)?;
    u32::try_from(limit).map_err(|_| EngineError::Row(format!("invalid alt_limit: {limit}")))
}

fn count_alts<B: Backend>(
    backend: &mut B,
    dialect: &dyn Dialect,
    identity: &IdentityId,
) -> Result<u64, EngineError> {
    let row = backend
        .query_row(dialect.count_alts(), &[identity.as_str().into()])?
        .ok_or_else(|| EngineError::Row("COUNT(*) returned no row".to_string()))?;
    let count = row_i64(&row, 0)?;
    u64::try_from(count).map_err(|_| EngineError::Row(format!("invalid alt count: {count}")))
}

fn alt_owned<B: Backend>(
    backend: &mut B,
    dialect: &dyn Dialect,
    identity: &IdentityId,
    alt: &AltId,
) -> Result<bool, EngineError> {
    let row = backend.query_row(
        dialect.alt_exists(),
        &[identity.as_str().into(), alt.as_str().into()],
    )?;
    Ok(row.is_some())
}

fn active_alt<B: Backend>(
    backend: &mut B,
    dialect: &dyn Dialect,
    identity: &IdentityId,
) -> Result<Option<AltId>, EngineError> {
    let row = backend.query_row(dialect.select_active_alt(), &[identity.as_str().into()])?;
    match row {
        Some(row) => match row_opt_text(&row, 0)? {
            Some(raw) => Ok(Some(AltId::new(raw)?)),
            None => Ok(None),
        },
        None => Ok(None),
    }
}

pub fn row_i64(row: &SqlRow, index: usize) -> Result<i64, EngineError> {
    match row.get(index) {
        Some(SqlValue::Integer(value)) => Ok(*value),
        other => Err(EngineError::Row(format!(
            "expected integer at column {index}, got {other:?}"
        ))),
    }
}

pub fn row_text(row: &SqlRow, index: usize) -> Result<String, EngineError> {
    match row.get(index) {
        Some(SqlValue::Text(value)) => Ok(value.clone()),
        other => Err(EngineError::Row(format!(
            "expected text at column {index}, got {other:?}"
        ))),
    }
}

pub fn row_opt_text(row: &SqlRow, index: usize) -> Result<Option<String>, EngineError> {
    match row.get(index) {
        Some(SqlValue::Text(value)) => Ok(Some(value.clone())),
        Some(SqlValue::Null) => Ok(None),
        other => Err(EngineError::Row(format!(
            "expected nullable text at column {index}, got {other:?}"
        ))),
    }
}

pub fn row_opt_blob(row: &SqlRow, index: usize) -> Result<Option<Vec<u8>>, EngineError> {
    match row.get(index) {
        Some(SqlValue::Blob(value)) => Ok(Some(value.clone())),
        Some(SqlValue::Null) => Ok(None),
        other => Err(EngineError::Row(format!(
            "expected nullable blob at column {index}, got {other:?}"
        ))),
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, EngineError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| EngineError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;
    if parsed.offset() != UtcOffset::UTC {
        return Err(EngineError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }
    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, EngineError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| EngineError::Validation(format!("failed to format timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

fn rfc3339_now() -> Result<String, EngineError> {
    format_rfc3339(now_utc())
}
