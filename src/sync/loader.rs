// ABOUTME: Loader - bootstraps local tables and appends extracted batches
// ABOUTME: Runs blocking DuckDB work on the tokio blocking pool

use anyhow::{Context, Result};

use crate::store::LocalStore;

use super::extractor::RowBatch;
use super::schema::LocalSchema;

/// Writes into one local table through a dedicated store session.
#[derive(Debug, Clone)]
pub struct Loader {
    store: LocalStore,
    table: String,
}

impl Loader {
    pub fn new(store: LocalStore, table: &str) -> Self {
        Self {
            store,
            table: table.to_string(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the table from `schema` unless it already exists.
    ///
    /// Returns true when the table was created by this call.
    pub async fn ensure_table(&self, schema: &LocalSchema) -> Result<bool> {
        let store = self.store.clone();
        let table = self.table.clone();
        let definitions = schema.column_definitions();

        let created = tokio::task::spawn_blocking(move || store.create_table(&table, &definitions))
            .await
            .context("Table creation task panicked")??;

        if created {
            tracing::info!("Created local table '{}'", self.table);
        } else {
            tracing::debug!("Local table '{}' already exists", self.table);
        }
        Ok(created)
    }

    /// Append a batch in order. Rows are not deduplicated.
    pub async fn append(&self, schema: &LocalSchema, batch: RowBatch) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let store = self.store.clone();
        let table = self.table.clone();
        let types = schema.column_types();

        tokio::task::spawn_blocking(move || store.append_rows(&table, &types, &batch.rows))
            .await
            .context("Append task panicked")?
            .with_context(|| format!("Failed to append batch to '{}'", self.table))
    }
}
