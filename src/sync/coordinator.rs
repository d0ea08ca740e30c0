// ABOUTME: SyncCoordinator - runs one sync cycle over every table of the remote dataset
// ABOUTME: Single-flight guarded, bounded worker pool, publishes a snapshot afterwards

use anyhow::{anyhow, Context, Result};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::SyncConfig;
use crate::remote::{DatasetRef, RemoteSource, RemoteTable};
use crate::snapshot::{PublishReport, SnapshotPublisher};
use crate::store::LocalStore;
use crate::utils::retry_with_backoff;

use super::schema::SchemaConverter;
use super::worker::{TableSyncReport, TableSyncWorker};

const LIST_RETRY_DELAY: Duration = Duration::from_millis(500);

/// A table whose sync failed during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFailure {
    pub table: String,
    pub error: String,
}

/// Summary of one completed cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub tables_listed: usize,
    pub tables_synced: usize,
    pub rows_synced: u64,
    pub tables: Vec<TableSyncReport>,
    pub failures: Vec<TableFailure>,
    pub snapshot: Option<PublishReport>,
    pub publish_error: Option<String>,
    pub duration_ms: u64,
}

impl CycleReport {
    /// True when every table synced and the snapshot (if any) is complete.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
            && self.publish_error.is_none()
            && self.snapshot.as_ref().map_or(true, PublishReport::is_complete)
    }

    pub fn table(&self, name: &str) -> Option<&TableSyncReport> {
        self.tables.iter().find(|t| t.table == name)
    }
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// Another cycle was already running.
    Skipped,
    Completed(CycleReport),
    /// Listing or dispatch failed; nothing was published.
    Failed(String),
}

impl CycleOutcome {
    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            CycleOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Releases the single-flight flag when dropped, including on panic.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives sync cycles for one dataset into one local store.
pub struct SyncCoordinator {
    source: Arc<dyn RemoteSource>,
    store: LocalStore,
    dataset: DatasetRef,
    converter: Arc<SchemaConverter>,
    page_size: usize,
    concurrency: usize,
    list_retries: u32,
    publisher: Option<Arc<SnapshotPublisher>>,
    running: AtomicBool,
    cycles: AtomicU64,
}

impl SyncCoordinator {
    /// Build a coordinator from configuration.
    ///
    /// Publishing is enabled when `config.output` is set.
    pub fn new(source: Arc<dyn RemoteSource>, store: LocalStore, config: &SyncConfig) -> Result<Self> {
        let publisher = match &config.output {
            Some(root) => Some(Arc::new(SnapshotPublisher::with_symlink(
                root,
                config.snapshot_prefix(),
            )?)),
            None => None,
        };

        Ok(Self {
            source,
            store,
            dataset: config.dataset(),
            converter: Arc::new(config.schema_converter()),
            page_size: config.page_size.max(1),
            concurrency: config.concurrency.max(1),
            list_retries: config.list_retries,
            publisher,
            running: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
        })
    }

    /// Replace the publisher (for a custom alias implementation).
    pub fn with_publisher(mut self, publisher: Option<Arc<SnapshotPublisher>>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of cycles started so far (skipped triggers excluded).
    pub fn cycles_started(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Run one sync cycle unless one is already in progress.
    pub async fn run_cycle(&self) -> CycleOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::info!("Sync cycle already active; skipping this trigger");
            return CycleOutcome::Skipped;
        }
        let _guard = RunningGuard(&self.running);

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(
            "Starting sync cycle {} for {}.{}",
            cycle,
            self.dataset.project_id,
            self.dataset.dataset_id
        );

        match self.execute(cycle).await {
            Ok(report) => {
                log_summary(&report);
                CycleOutcome::Completed(report)
            }
            Err(e) => {
                tracing::error!("Sync cycle {} failed: {:?}", cycle, e);
                CycleOutcome::Failed(format!("{:#}", e))
            }
        }
    }

    async fn execute(&self, cycle: u64) -> Result<CycleReport> {
        let start = Instant::now();

        let tables = retry_with_backoff(
            || self.source.list_tables(&self.dataset),
            self.list_retries,
            LIST_RETRY_DELAY,
        )
        .await
        .with_context(|| {
            format!(
                "Failed to list tables in {}.{}",
                self.dataset.project_id, self.dataset.dataset_id
            )
        })?;

        let tables_listed = tables.len();
        tracing::info!("Found {} remote tables", tables_listed);

        let (mut reports, mut failures) = self.sync_tables(tables).await?;
        reports.sort_by(|a, b| a.table.cmp(&b.table));
        failures.sort_by(|a, b| a.table.cmp(&b.table));

        let (snapshot, publish_error) = match &self.publisher {
            Some(publisher) => match self.publish(publisher.clone()).await {
                Ok(report) => (Some(report), None),
                Err(e) => {
                    tracing::error!("Snapshot publish failed: {:?}", e);
                    (None, Some(format!("{:#}", e)))
                }
            },
            None => (None, None),
        };

        Ok(CycleReport {
            cycle,
            tables_listed,
            tables_synced: reports.len(),
            rows_synced: reports.iter().map(|r| r.rows_synced).sum(),
            tables: reports,
            failures,
            snapshot,
            publish_error,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Dispatch one worker per table and collect every outcome.
    ///
    /// Each worker opens its own store session only after it holds a pool permit,
    /// so at most `concurrency` sessions are live at once. Tables whose names map
    /// to the same local table are failed without being synced.
    async fn sync_tables(
        &self,
        tables: Vec<RemoteTable>,
    ) -> Result<(Vec<TableSyncReport>, Vec<TableFailure>)> {
        let (tables, mut failures) = reject_local_collisions(tables);

        let total = tables.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();

        for (idx, table) in tables.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let source = self.source.clone();
            let store = self.store.clone();
            let converter = self.converter.clone();
            let page_size = self.page_size;
            let table_id = table.table_id.clone();

            set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (table_id, Err(anyhow!("Worker pool closed: {}", e))),
                };

                let session = match store.session() {
                    Ok(session) => session,
                    Err(e) => {
                        let e = e.context(format!("Failed to open store session for '{}'", table_id));
                        return (table_id, Err(e));
                    }
                };

                let worker = TableSyncWorker::new(
                    source, session, converter, page_size, table, idx + 1, total,
                );
                let result = match AssertUnwindSafe(worker.run()).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("Sync worker panicked")),
                };
                (table_id, result)
            });
        }

        let mut reports = Vec::new();

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(report))) => reports.push(report),
                Ok((table, Err(e))) => {
                    tracing::error!("Failed to sync table '{}': {:?}", table, e);
                    failures.push(TableFailure {
                        table,
                        error: format!("{:#}", e),
                    });
                }
                Err(e) => {
                    tracing::error!("Sync task failed: {}", e);
                    failures.push(TableFailure {
                        table: "<unknown>".to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok((reports, failures))
    }

    async fn publish(&self, publisher: Arc<SnapshotPublisher>) -> Result<PublishReport> {
        let exporter = self
            .store
            .session()
            .context("Failed to open store session for export")?;
        tokio::task::spawn_blocking(move || publisher.run(&exporter))
            .await
            .context("Snapshot task panicked")?
    }
}

fn log_summary(report: &CycleReport) {
    tracing::info!(
        "Sync cycle {} finished in {}ms: {}/{} tables synced, {} rows",
        report.cycle,
        report.duration_ms,
        report.tables_synced,
        report.tables_listed,
        report.rows_synced
    );

    if !report.failures.is_empty() {
        tracing::warn!("{} tables failed to sync:", report.failures.len());
        for failure in &report.failures {
            tracing::warn!("  - {}: {}", failure.table, failure.error);
        }
    }

    if let Some(snapshot) = &report.snapshot {
        tracing::info!(
            "Snapshot {:?}: {} exported, {} failed",
            snapshot.snapshot_dir,
            snapshot.exported.len(),
            snapshot.failed.len()
        );
    }
}

/// Split off remote tables whose ids differ only in letter case.
///
/// DuckDB resolves identifiers case-insensitively, so such tables would share one
/// local table and corrupt each other's watermark. Every member of a colliding
/// group is reported as a failure.
fn reject_local_collisions(tables: Vec<RemoteTable>) -> (Vec<RemoteTable>, Vec<TableFailure>) {
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    for table in &tables {
        groups
            .entry(table.table_id.to_lowercase())
            .or_default()
            .push(table.table_id.clone());
    }

    let mut accepted = Vec::with_capacity(tables.len());
    let mut failures = Vec::new();

    for table in tables {
        let group = &groups[&table.table_id.to_lowercase()];
        if group.len() == 1 {
            accepted.push(table);
            continue;
        }

        let others: Vec<&str> = group
            .iter()
            .map(String::as_str)
            .filter(|name| *name != table.table_id)
            .collect();
        let error = format!(
            "Remote table '{}' maps to the same local table as {}; local table names are case-insensitive",
            table.table_id,
            others.join(", ")
        );
        tracing::error!("{}", error);
        failures.push(TableFailure {
            table: table.table_id,
            error,
        });
    }

    (accepted, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::DatasetRef;

    #[test]
    fn test_reject_local_collisions() {
        let dataset = DatasetRef::new("p", "d");
        let tables = vec![
            dataset.table("Trades"),
            dataset.table("orders"),
            dataset.table("trades"),
        ];

        let (accepted, failures) = reject_local_collisions(tables);
        assert_eq!(accepted, vec![dataset.table("orders")]);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].table, "Trades");
        assert!(failures[0].error.contains("trades"));
        assert_eq!(failures[1].table, "trades");
        assert!(failures[1].error.contains("Trades"));
    }

    #[test]
    fn test_distinct_names_are_all_accepted() {
        let dataset = DatasetRef::new("p", "d");
        let tables = vec![dataset.table("a"), dataset.table("b")];
        let (accepted, failures) = reject_local_collisions(tables.clone());
        assert_eq!(accepted, tables);
        assert!(failures.is_empty());
    }
}
