//! Embedded SQLite backend for the altvault engine.
//!
//! The adapter translates the engine's portable statement calls into
//! `rusqlite` calls and classifies native constraint failures into
//! [`BackendError::UniqueViolation`], which is the only error detail
//! the engine's conflict handling relies on.

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use altvault_core::{AltEngine, Backend, BackendError, SqlRow, SqlValue, SQLITE};
use anyhow::{anyhow, Context, Result};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection};

// SQLite extended result codes for unique-index and primary-key hits.
const SQLITE_CONSTRAINT_PRIMARYKEY: i32 = 1555;
const SQLITE_CONSTRAINT_UNIQUE: i32 = 2067;

pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Backend for SqliteBackend {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, BackendError> {
        let changed = self
            .conn
            .execute(sql, params_from_iter(params.iter().map(Param)))
            .map_err(map_backend_error)?;
        u64::try_from(changed)
            .map_err(|_| BackendError::Other(format!("invalid change count: {changed}")))
    }

    fn query_rows(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, BackendError> {
        let mut stmt = self.conn.prepare(sql).map_err(map_backend_error)?;
        let column_count = stmt.column_count();
        let mut rows = stmt
            .query(params_from_iter(params.iter().map(Param)))
            .map_err(map_backend_error)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(map_backend_error)? {
            let mut values = Vec::with_capacity(column_count);
            for index in 0..column_count {
                let value = row.get_ref(index).map_err(map_backend_error)?;
                values.push(to_sql_value(value)?);
            }
            out.push(values);
        }
        Ok(out)
    }
}

/// Opens (or creates) the vault database at `path` and runs the
/// schema manager. A schema failure here is fatal; callers are
/// expected to abort startup on `Err`.
pub fn open_vault(path: &Path) -> Result<AltEngine<SqliteBackend>> {
    let backend = SqliteBackend::open(path)?;
    let mut engine = AltEngine::new(backend, &SQLITE);
    engine
        .ensure_schema()
        .map_err(|err| anyhow!(err))
        .context("failed to ensure altvault schema")?;
    Ok(engine)
}

/// Introspects the live database and verifies the tables, columns and
/// unique indexes the engine depends on actually exist.
pub fn validate_schema(conn: &Connection) -> Result<()> {
    for (table, columns) in [
        ("identities", &["id", "alt_limit", "created_at", "updated_at"][..]),
        (
            "alts",
            &[
                "alt_id",
                "identity_id",
                "display_name",
                "storage",
                "created_at",
                "updated_at",
            ][..],
        ),
        ("sessions", &["identity_id", "active_alt_id"][..]),
        ("permissions", &["alt_id", "name", "created_at", "updated_at"][..]),
    ] {
        if !table_exists(conn, table)? {
            return Err(anyhow!("schema check failed: missing table {table}"));
        }
        ensure_table_has_columns(conn, table, columns)?;
    }

    ensure_unique_index_on_columns(conn, "alts", &["identity_id", "display_name"])?;
    ensure_unique_index_on_columns(conn, "permissions", &["alt_id", "name"])?;
    Ok(())
}

struct Param<'a>(&'a SqlValue);

impl rusqlite::ToSql for Param<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self.0 {
            SqlValue::Null => ValueRef::Null,
            SqlValue::Integer(value) => ValueRef::Integer(*value),
            SqlValue::Text(value) => ValueRef::Text(value.as_bytes()),
            SqlValue::Blob(value) => ValueRef::Blob(value),
        };
        Ok(ToSqlOutput::Borrowed(value))
    }
}

fn to_sql_value(value: ValueRef<'_>) -> Result<SqlValue, BackendError> {
    match value {
        ValueRef::Null => Ok(SqlValue::Null),
        ValueRef::Integer(raw) => Ok(SqlValue::Integer(raw)),
        ValueRef::Text(bytes) => String::from_utf8(bytes.to_vec())
            .map(SqlValue::Text)
            .map_err(|err| BackendError::Other(format!("non-utf8 text column: {err}"))),
        ValueRef::Blob(bytes) => Ok(SqlValue::Blob(bytes.to_vec())),
        ValueRef::Real(raw) => Err(BackendError::Other(format!(
            "unexpected REAL column value: {raw}"
        ))),
    }
}

fn map_backend_error(err: rusqlite::Error) -> BackendError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => {
            if failure.extended_code == SQLITE_CONSTRAINT_UNIQUE
                || failure.extended_code == SQLITE_CONSTRAINT_PRIMARYKEY
            {
                BackendError::UniqueViolation(err.to_string())
            } else if failure.code == rusqlite::ErrorCode::CannotOpen
                || failure.code == rusqlite::ErrorCode::NotADatabase
            {
                BackendError::Unavailable(err.to_string())
            } else {
                BackendError::Other(err.to_string())
            }
        }
        _ => BackendError::Other(err.to_string()),
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    use rusqlite::OptionalExtension;

    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            rusqlite::params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "schema check failed: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

fn ensure_unique_index_on_columns(
    conn: &Connection,
    table_name: &str,
    columns: &[&str],
) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_list({table_name})"))
        .with_context(|| format!("failed to inspect index_list for {table_name}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let index_name: String = row.get(1)?;
        let is_unique: i64 = row.get(2)?;
        if is_unique != 1 {
            continue;
        }

        if index_columns(conn, &index_name)? == columns {
            return Ok(());
        }
    }

    Err(anyhow!(
        "schema check failed: expected UNIQUE({}) on {table_name}",
        columns.join(", ")
    ))
}

fn index_columns(conn: &Connection, index_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_info({index_name})"))
        .with_context(|| format!("failed to inspect index_info for {index_name}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(2)?);
    }

    Ok(columns)
}
