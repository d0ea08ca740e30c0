// ABOUTME: TableSyncWorker - incremental sync of a single remote table
// ABOUTME: Composes schema conversion, watermark lookup, extraction and loading

use anyhow::{Context, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;

use crate::remote::{RemoteSource, RemoteTable};
use crate::store::LocalStore;
use crate::utils::validate_identifier;

use super::extractor::Extractor;
use super::loader::Loader;
use super::schema::SchemaConverter;
use super::watermark::WatermarkTracker;

/// Outcome of one successful table sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSyncReport {
    pub table: String,
    pub created: bool,
    pub rows_synced: u64,
    pub batches: u64,
    pub watermark_before: i64,
    pub watermark_after: i64,
    pub duration_ms: u64,
}

/// Syncs one remote table into its local counterpart.
pub struct TableSyncWorker {
    source: Arc<dyn RemoteSource>,
    store: LocalStore,
    converter: Arc<SchemaConverter>,
    page_size: usize,
    table: RemoteTable,
    index: usize,
    total: usize,
}

impl TableSyncWorker {
    /// # Arguments
    ///
    /// * `store` - A session dedicated to this worker (see [`LocalStore::session`])
    /// * `index`, `total` - Position of the table in the cycle, used in log lines
    pub fn new(
        source: Arc<dyn RemoteSource>,
        store: LocalStore,
        converter: Arc<SchemaConverter>,
        page_size: usize,
        table: RemoteTable,
        index: usize,
        total: usize,
    ) -> Self {
        Self {
            source,
            store,
            converter,
            page_size,
            table,
            index,
            total,
        }
    }

    pub fn table(&self) -> &RemoteTable {
        &self.table
    }

    /// Run the sync.
    ///
    /// 1. Fetch and convert the remote schema, creating the local table if absent
    /// 2. Read the local watermark (0 for a new table)
    /// 3. Append every batch with a watermark above it, logging progress per batch
    ///
    /// Any error aborts this table only; rows appended before the error stay and
    /// raise the watermark for the next cycle.
    pub async fn run(self) -> Result<TableSyncReport> {
        let start = Instant::now();
        let table_id = self.table.table_id.clone();

        validate_identifier(&table_id)
            .with_context(|| format!("Unsupported table name '{}'", table_id))?;

        tracing::info!(
            "[{}/{}] Syncing table {}",
            self.index,
            self.total,
            self.table.qualified_name()
        );

        let remote_columns = self.source.get_schema(&self.table).await?;
        let schema = self.converter.convert(&table_id, &remote_columns)?;

        let loader = Loader::new(self.store.clone(), &table_id);
        let created = loader.ensure_table(&schema).await?;

        let tracker = WatermarkTracker::new(&schema.watermark().name);
        let store = self.store.clone();
        let lookup_table = table_id.clone();
        let watermark_before = tokio::task::spawn_blocking(move || tracker.current(&store, &lookup_table))
            .await
            .context("Watermark task panicked")??
            .unwrap_or(0);

        tracing::debug!("Table '{}' watermark: {}", table_id, watermark_before);

        let extractor = Extractor::new(self.source.clone(), self.page_size);
        let mut batches = extractor.extract(&self.table, &schema, watermark_before);

        let mut rows_synced: u64 = 0;
        let mut batch_count: u64 = 0;
        let mut watermark_after = watermark_before;

        while let Some(batch) = batches.next().await {
            let batch = batch?;
            let batch_max = batch.max_watermark;
            let appended = loader.append(&schema, batch).await?;

            rows_synced += appended as u64;
            batch_count += 1;
            if let Some(w) = batch_max {
                watermark_after = watermark_after.max(w);
            }

            tracing::info!(
                "  Table '{}': batch {} appended {} rows ({} total, watermark {})",
                table_id,
                batch_count,
                appended,
                rows_synced,
                watermark_after
            );
        }

        let duration_ms = start.elapsed().as_millis() as u64;

        if rows_synced == 0 {
            tracing::info!("  Table '{}' is up to date (watermark {})", table_id, watermark_before);
        } else {
            tracing::info!(
                "  Table '{}' synced {} rows in {}ms (watermark {} -> {})",
                table_id,
                rows_synced,
                duration_ms,
                watermark_before,
                watermark_after
            );
        }

        Ok(TableSyncReport {
            table: table_id,
            created,
            rows_synced,
            batches: batch_count,
            watermark_before,
            watermark_after,
            duration_ms,
        })
    }
}
