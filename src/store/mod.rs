// ABOUTME: Local analytical store backed by DuckDB
// ABOUTME: Table introspection, creation, batched appends and Parquet export

pub mod convert;

use anyhow::{anyhow, Context, Result};
use duckdb::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::utils::{quote_ident, quote_literal};

pub use convert::{cell_to_value, LocalType};

/// Handle to the local DuckDB database.
///
/// A `LocalStore` wraps one DuckDB connection. DuckDB connections cannot be used
/// from several threads at once, so concurrent workers each call
/// [`LocalStore::session`] to obtain their own connection to the same database
/// instance. All methods are blocking; async callers run them on
/// `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Open (or create) a database file.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB database at {:?}", path))?;
        tracing::info!("Opened local store {:?}", path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a transient in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory DuckDB")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Create a new connection to the same database for use by another worker.
    pub fn session(&self) -> Result<Self> {
        let cloned = self.with_conn(|conn| {
            conn.try_clone()
                .context("Failed to open an additional DuckDB connection")
        })?;
        Ok(Self {
            conn: Arc::new(Mutex::new(cloned)),
            path: self.path.clone(),
        })
    }

    /// Run `f` with exclusive access to this handle's connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("DuckDB connection mutex poisoned"))?;
        f(&guard)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        self.with_conn(|conn| table_exists(conn, table))
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        self.with_conn(list_tables)
    }

    /// Create `table` unless it already exists. Returns true when it was created.
    pub fn create_table(&self, table: &str, column_definitions: &[String]) -> Result<bool> {
        self.with_conn(|conn| create_table(conn, table, column_definitions))
    }

    pub fn max_value(&self, table: &str, column: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| max_value(conn, table, column))
    }

    pub fn row_count(&self, table: &str) -> Result<u64> {
        self.with_conn(|conn| row_count(conn, table))
    }

    pub fn append_rows(
        &self,
        table: &str,
        column_types: &[LocalType],
        rows: &[Vec<serde_json::Value>],
    ) -> Result<usize> {
        self.with_conn(|conn| append_rows(conn, table, column_types, rows))
    }

    pub fn export_parquet(&self, table: &str, dest: &Path) -> Result<()> {
        self.with_conn(|conn| export_parquet(conn, table, dest))
    }
}

/// Check whether a base table exists in the `main` schema.
///
/// DuckDB resolves identifiers case-insensitively, quoted or not, so the lookup
/// ignores case as well.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT count(*) FROM information_schema.tables \
             WHERE table_schema = 'main' AND lower(table_name) = lower(?)",
            duckdb::params![table],
            |row| row.get(0),
        )
        .with_context(|| format!("Failed to check whether table '{}' exists", table))?;
    Ok(count > 0)
}

/// List all base tables in the `main` schema, sorted by name.
pub fn list_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'main' AND table_type = 'BASE TABLE' \
             ORDER BY table_name",
        )
        .context("Failed to prepare statement to list tables")?;

    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .context("Failed to query table list")?
        .collect::<Result<Vec<String>, _>>()
        .context("Failed to collect table names")?;

    tracing::debug!("Found {} tables in local store", tables.len());
    Ok(tables)
}

/// Create a table from `"name" TYPE` column definitions if it is absent.
pub fn create_table(conn: &Connection, table: &str, column_definitions: &[String]) -> Result<bool> {
    if table_exists(conn, table)? {
        return Ok(false);
    }

    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table),
        column_definitions.join(", ")
    );
    conn.execute_batch(&ddl)
        .with_context(|| format!("Failed to create table '{}'", table))?;
    Ok(true)
}

/// `MAX(column)` over a table; `None` when the table has no rows.
pub fn max_value(conn: &Connection, table: &str, column: &str) -> Result<Option<i64>> {
    let sql = format!(
        "SELECT MAX({}) FROM {}",
        quote_ident(column),
        quote_ident(table)
    );
    conn.query_row(&sql, [], |row| row.get::<_, Option<i64>>(0))
        .with_context(|| format!("Failed to read MAX({}) from '{}'", column, table))
}

pub fn row_count(conn: &Connection, table: &str) -> Result<u64> {
    let sql = format!("SELECT count(*) FROM {}", quote_ident(table));
    let count: i64 = conn
        .query_row(&sql, [], |row| row.get(0))
        .with_context(|| format!("Failed to count rows in '{}'", table))?;
    Ok(count as u64)
}

/// Append a batch of rows, preserving their order.
///
/// Cells are converted from their JSON wire form to the column's local type
/// before being handed to the DuckDB appender. The appender is flushed before
/// returning so the rows are visible to other connections.
pub fn append_rows(
    conn: &Connection,
    table: &str,
    column_types: &[LocalType],
    rows: &[Vec<serde_json::Value>],
) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }

    // Convert the whole batch first so a bad cell leaves the table untouched
    let mut converted = Vec::with_capacity(rows.len());
    for (row_idx, row) in rows.iter().enumerate() {
        if row.len() != column_types.len() {
            anyhow::bail!(
                "Row {} of batch for '{}' has {} cells, expected {}",
                row_idx,
                table,
                row.len(),
                column_types.len()
            );
        }

        let values = row
            .iter()
            .zip(column_types)
            .enumerate()
            .map(|(col_idx, (cell, ty))| {
                cell_to_value(cell, *ty).with_context(|| {
                    format!("Invalid value in row {} column {} of '{}'", row_idx, col_idx, table)
                })
            })
            .collect::<Result<Vec<_>>>()?;
        converted.push(values);
    }

    let mut appender = conn
        .appender(table)
        .with_context(|| format!("Failed to open appender for '{}'", table))?;

    for (row_idx, values) in converted.into_iter().enumerate() {
        appender
            .append_row(duckdb::appender_params_from_iter(values))
            .with_context(|| format!("Failed to append row {} to '{}'", row_idx, table))?;
    }

    appender
        .flush()
        .with_context(|| format!("Failed to flush appender for '{}'", table))?;

    Ok(rows.len())
}

/// Write the full contents of a table to a Parquet file.
pub fn export_parquet(conn: &Connection, table: &str, dest: &Path) -> Result<()> {
    let sql = format!(
        "COPY {} TO {} (FORMAT 'parquet')",
        quote_ident(table),
        quote_literal(&dest.to_string_lossy())
    );
    conn.execute_batch(&sql)
        .with_context(|| format!("Failed to export '{}' to {:?}", table, dest))
}
