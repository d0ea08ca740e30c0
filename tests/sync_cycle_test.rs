// ABOUTME: Integration tests for full sync cycles against an in-memory remote source
// ABOUTME: Covers watermark progression, failure isolation, single-flight, resume and publishing

use anyhow::Result;
use async_trait::async_trait;
use bq_syncer::remote::{
    DatasetRef, ExtractQuery, MemorySource, RemoteColumn, RemoteSource, RemoteTable, Row,
};
use bq_syncer::snapshot::SnapshotLayout;
use bq_syncer::store::LocalStore;
use bq_syncer::{CycleOutcome, CycleReport, SyncConfig, SyncCoordinator};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn test_config(output: Option<&Path>, concurrency: usize) -> SyncConfig {
    SyncConfig {
        input: PathBuf::from(":memory:"),
        output: output.map(Path::to_path_buf),
        concurrency,
        page_size: 2,
        list_retries: 0,
        ..Default::default()
    }
}

fn remote_columns() -> Vec<RemoteColumn> {
    vec![
        RemoteColumn::new("id", "INTEGER"),
        RemoteColumn::new("symbol", "STRING"),
        RemoteColumn::new("price", "FLOAT"),
        RemoteColumn::record(
            "datastream_metadata",
            vec![
                RemoteColumn::new("uuid", "STRING"),
                RemoteColumn::new("source_timestamp", "INTEGER"),
            ],
        ),
    ]
}

/// A row as the BigQuery REST API would return it: scalars encoded as strings.
fn trade(id: i64, ts: i64) -> serde_json::Value {
    json!({
        "id": id.to_string(),
        "symbol": "ETH",
        "price": "1850.25",
        "datastream_metadata": {"uuid": format!("u-{}", id), "source_timestamp": ts.to_string()},
    })
}

fn source_with_tables(tables: &[&str]) -> Arc<MemorySource> {
    let source = Arc::new(MemorySource::new(test_config(None, 1).dataset()));
    for table in tables {
        source.add_table(table, remote_columns()).unwrap();
    }
    source
}

async fn completed(coordinator: &SyncCoordinator) -> CycleReport {
    match coordinator.run_cycle().await {
        CycleOutcome::Completed(report) => report,
        other => panic!("expected a completed cycle, got {:?}", other),
    }
}

#[tokio::test]
async fn test_trades_watermark_progression() {
    let source = source_with_tables(&["trades"]);
    source
        .insert_records("trades", vec![trade(1, 5), trade(2, 10), trade(3, 15)])
        .unwrap();

    let store = LocalStore::open_in_memory().unwrap();
    let coordinator =
        SyncCoordinator::new(source.clone(), store.clone(), &test_config(None, 1)).unwrap();

    // First cycle creates the table and syncs everything
    let report = completed(&coordinator).await;
    let trades = report.table("trades").unwrap();
    assert!(trades.created);
    assert_eq!(trades.rows_synced, 3);
    assert_eq!(trades.watermark_after, 15);
    assert_eq!(store.max_value("trades", "source_timestamp").unwrap(), Some(15));

    // Nothing new: the strict bound returns no rows
    let report = completed(&coordinator).await;
    let trades = report.table("trades").unwrap();
    assert_eq!(trades.rows_synced, 0);
    assert_eq!(trades.watermark_before, 15);
    assert_eq!(trades.watermark_after, 15);
    assert_eq!(store.row_count("trades").unwrap(), 3);

    // A late row sharing the current watermark is not picked up; only 20 is
    source
        .insert_records("trades", vec![trade(4, 15), trade(5, 20)])
        .unwrap();
    let report = completed(&coordinator).await;
    let trades = report.table("trades").unwrap();
    assert_eq!(trades.rows_synced, 1);
    assert_eq!(trades.watermark_after, 20);
    assert_eq!(store.row_count("trades").unwrap(), 4);
    assert_eq!(report.rows_synced, 1);
    assert!(report.is_success());
    assert_eq!(coordinator.cycles_started(), 3);
}

#[tokio::test]
async fn test_table_failure_is_isolated() {
    let source = source_with_tables(&["orders", "trades"]);
    source.insert_records("trades", vec![trade(1, 5)]).unwrap();
    source.insert_records("orders", vec![trade(7, 9)]).unwrap();
    source.fail_table("orders", "quota exceeded").unwrap();

    let store = LocalStore::open_in_memory().unwrap();
    let coordinator =
        SyncCoordinator::new(source.clone(), store.clone(), &test_config(None, 2)).unwrap();

    let report = completed(&coordinator).await;
    assert!(!report.is_success());
    assert_eq!(report.tables_listed, 2);
    assert_eq!(report.tables_synced, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].table, "orders");
    assert!(report.failures[0].error.contains("quota exceeded"));
    assert_eq!(store.row_count("trades").unwrap(), 1);
    assert!(!store.table_exists("orders").unwrap());

    // The failed table catches up on the next cycle
    source.heal_table("orders").unwrap();
    let report = completed(&coordinator).await;
    assert!(report.is_success());
    assert_eq!(report.table("orders").unwrap().rows_synced, 1);
    assert_eq!(report.table("trades").unwrap().rows_synced, 0);
}

#[tokio::test]
async fn test_table_is_created_once() {
    let source = source_with_tables(&["trades"]);
    let store = LocalStore::open_in_memory().unwrap();
    let coordinator =
        SyncCoordinator::new(source.clone(), store.clone(), &test_config(None, 1)).unwrap();

    let first = completed(&coordinator).await;
    assert!(first.table("trades").unwrap().created);
    assert_eq!(first.table("trades").unwrap().watermark_after, 0);

    let second = completed(&coordinator).await;
    assert!(!second.table("trades").unwrap().created);
    assert_eq!(store.list_tables().unwrap(), vec!["trades".to_string()]);
    assert_eq!(store.row_count("trades").unwrap(), 0);
}

/// Wraps a source and blocks table listing until released.
struct GatedSource {
    inner: Arc<MemorySource>,
    entered: Notify,
    release: Notify,
    list_calls: AtomicUsize,
}

#[async_trait]
impl RemoteSource for GatedSource {
    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<RemoteTable>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.list_tables(dataset).await
    }

    async fn get_schema(&self, table: &RemoteTable) -> Result<Vec<RemoteColumn>> {
        self.inner.get_schema(table).await
    }

    fn extract<'a>(&'a self, query: &ExtractQuery) -> BoxStream<'a, Result<Vec<Row>>> {
        self.inner.extract(query)
    }
}

#[tokio::test]
async fn test_overlapping_cycle_is_skipped() {
    let inner = source_with_tables(&["trades"]);
    inner.insert_records("trades", vec![trade(1, 5)]).unwrap();
    let gated = Arc::new(GatedSource {
        inner,
        entered: Notify::new(),
        release: Notify::new(),
        list_calls: AtomicUsize::new(0),
    });

    let store = LocalStore::open_in_memory().unwrap();
    let coordinator = Arc::new(
        SyncCoordinator::new(gated.clone(), store.clone(), &test_config(None, 1)).unwrap(),
    );

    let first = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run_cycle().await })
    };
    gated.entered.notified().await;
    assert!(coordinator.is_running());

    let second = coordinator.run_cycle().await;
    assert!(matches!(second, CycleOutcome::Skipped));
    assert_eq!(gated.list_calls.load(Ordering::SeqCst), 1);

    gated.release.notify_one();
    let first = first.await.unwrap();
    assert_eq!(first.report().unwrap().rows_synced, 1);
    assert!(!coordinator.is_running());
    assert_eq!(coordinator.cycles_started(), 1);
    assert_eq!(store.row_count("trades").unwrap(), 1);
}

/// Records how many schema fetches run at the same time.
struct ConcurrencyTracker {
    inner: Arc<MemorySource>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl RemoteSource for ConcurrencyTracker {
    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<RemoteTable>> {
        self.inner.list_tables(dataset).await
    }

    async fn get_schema(&self, table: &RemoteTable) -> Result<Vec<RemoteColumn>> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.inner.get_schema(table).await
    }

    fn extract<'a>(&'a self, query: &ExtractQuery) -> BoxStream<'a, Result<Vec<Row>>> {
        self.inner.extract(query)
    }
}

#[tokio::test]
async fn test_worker_pool_is_bounded() {
    let tables = ["t1", "t2", "t3", "t4", "t5"];
    let inner = source_with_tables(&tables);
    for (i, table) in tables.iter().enumerate() {
        inner
            .insert_records(table, vec![trade(i as i64, 10 + i as i64)])
            .unwrap();
    }
    let tracker = Arc::new(ConcurrencyTracker {
        inner,
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });

    let store = LocalStore::open_in_memory().unwrap();
    let coordinator =
        SyncCoordinator::new(tracker.clone(), store.clone(), &test_config(None, 2)).unwrap();

    let report = completed(&coordinator).await;
    assert!(report.is_success());
    assert_eq!(report.tables_synced, 5);
    assert_eq!(report.rows_synced, 5);
    assert!(tracker.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(store.list_tables().unwrap().len(), 5);
}

/// Fails table listing a fixed number of times before delegating.
struct FlakyListing {
    inner: Arc<MemorySource>,
    failures_left: AtomicUsize,
}

#[async_trait]
impl RemoteSource for FlakyListing {
    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<RemoteTable>> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("backend error");
        }
        self.inner.list_tables(dataset).await
    }

    async fn get_schema(&self, table: &RemoteTable) -> Result<Vec<RemoteColumn>> {
        self.inner.get_schema(table).await
    }

    fn extract<'a>(&'a self, query: &ExtractQuery) -> BoxStream<'a, Result<Vec<Row>>> {
        self.inner.extract(query)
    }
}

#[tokio::test]
async fn test_listing_is_retried() {
    let source = Arc::new(FlakyListing {
        inner: source_with_tables(&["trades"]),
        failures_left: AtomicUsize::new(1),
    });
    let store = LocalStore::open_in_memory().unwrap();

    let mut config = test_config(None, 1);
    config.list_retries = 1;
    let coordinator = SyncCoordinator::new(source.clone(), store.clone(), &config).unwrap();
    assert_eq!(completed(&coordinator).await.tables_synced, 1);

    // Without retries the same failure aborts the cycle
    source.failures_left.store(1, Ordering::SeqCst);
    let coordinator = SyncCoordinator::new(source, store, &test_config(None, 1)).unwrap();
    match coordinator.run_cycle().await {
        CycleOutcome::Failed(reason) => assert!(reason.contains("backend error")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(!coordinator.is_running());
}

#[tokio::test]
async fn test_cycle_publishes_snapshot() {
    let out = tempfile::tempdir().unwrap();
    let source = source_with_tables(&["orders", "trades"]);
    source.insert_records("trades", vec![trade(1, 5)]).unwrap();

    let store = LocalStore::open_in_memory().unwrap();
    let config = test_config(Some(out.path()), 2);
    let coordinator = SyncCoordinator::new(source.clone(), store, &config).unwrap();

    let first = completed(&coordinator).await;
    let snapshot = first.snapshot.clone().unwrap();
    assert_eq!(snapshot.exported, vec!["orders", "trades"]);

    let alias = out.path().join("v2_polygon");
    assert!(alias.join("trades.parquet").is_file());
    assert!(alias.join("orders.parquet").is_file());

    source.insert_records("trades", vec![trade(2, 6)]).unwrap();
    let second = completed(&coordinator).await;
    let snapshot = second.snapshot.unwrap();
    assert_eq!(snapshot.removed, vec![first.snapshot.unwrap().snapshot_dir]);

    let layout = SnapshotLayout::new(out.path(), "v2_polygon").unwrap();
    assert_eq!(layout.snapshot_dirs().unwrap(), vec![snapshot.snapshot_dir]);
}

#[tokio::test]
async fn test_case_colliding_tables_are_rejected() {
    let source = source_with_tables(&["Trades", "trades", "orders"]);
    source.insert_records("Trades", vec![trade(1, 100)]).unwrap();
    source.insert_records("trades", vec![trade(2, 5)]).unwrap();
    source.insert_records("orders", vec![trade(3, 7)]).unwrap();

    let store = LocalStore::open_in_memory().unwrap();
    let coordinator =
        SyncCoordinator::new(source.clone(), store.clone(), &test_config(None, 2)).unwrap();

    for _ in 0..2 {
        let report = completed(&coordinator).await;
        assert_eq!(report.tables_listed, 3);
        assert_eq!(report.tables_synced, 1);
        let failed: Vec<&str> = report.failures.iter().map(|f| f.table.as_str()).collect();
        assert_eq!(failed, vec!["Trades", "trades"]);
        assert!(report.failures[0].error.contains("case-insensitive"));
    }

    assert_eq!(store.list_tables().unwrap(), vec!["orders".to_string()]);
    assert_eq!(store.row_count("orders").unwrap(), 1);
}

/// Yields the first result page and then a connection error while `broken` is set.
struct InterruptedExtraction {
    inner: Arc<MemorySource>,
    broken: AtomicBool,
}

#[async_trait]
impl RemoteSource for InterruptedExtraction {
    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<RemoteTable>> {
        self.inner.list_tables(dataset).await
    }

    async fn get_schema(&self, table: &RemoteTable) -> Result<Vec<RemoteColumn>> {
        self.inner.get_schema(table).await
    }

    fn extract<'a>(&'a self, query: &ExtractQuery) -> BoxStream<'a, Result<Vec<Row>>> {
        if !self.broken.load(Ordering::SeqCst) {
            return self.inner.extract(query);
        }
        self.inner
            .extract(query)
            .take(1)
            .chain(stream::once(async {
                Err(anyhow::anyhow!("connection reset by peer"))
            }))
            .boxed()
    }
}

#[tokio::test]
async fn test_interrupted_extraction_keeps_appended_pages() {
    let source = Arc::new(InterruptedExtraction {
        inner: source_with_tables(&["trades"]),
        broken: AtomicBool::new(true),
    });
    source
        .inner
        .insert_records("trades", vec![trade(1, 5), trade(2, 10), trade(3, 15)])
        .unwrap();

    let store = LocalStore::open_in_memory().unwrap();
    let coordinator =
        SyncCoordinator::new(source.clone(), store.clone(), &test_config(None, 1)).unwrap();

    // Page size is 2: the first page lands, then the stream fails
    let report = completed(&coordinator).await;
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].table, "trades");
    assert!(report.failures[0].error.contains("connection reset"));
    assert_eq!(store.row_count("trades").unwrap(), 2);
    assert_eq!(store.max_value("trades", "source_timestamp").unwrap(), Some(10));

    // The next cycle resumes above the appended page without duplicates
    source.broken.store(false, Ordering::SeqCst);
    let report = completed(&coordinator).await;
    assert!(report.is_success());
    let trades = report.table("trades").unwrap();
    assert_eq!(trades.watermark_before, 10);
    assert_eq!(trades.rows_synced, 1);
    assert_eq!(trades.watermark_after, 15);
    assert_eq!(store.row_count("trades").unwrap(), 3);
}

/// Panics while fetching the schema of one table.
struct PanickingSchema {
    inner: Arc<MemorySource>,
    table: String,
}

#[async_trait]
impl RemoteSource for PanickingSchema {
    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<RemoteTable>> {
        self.inner.list_tables(dataset).await
    }

    async fn get_schema(&self, table: &RemoteTable) -> Result<Vec<RemoteColumn>> {
        if table.table_id == self.table {
            panic!("schema decoder crashed on {}", table.table_id);
        }
        self.inner.get_schema(table).await
    }

    fn extract<'a>(&'a self, query: &ExtractQuery) -> BoxStream<'a, Result<Vec<Row>>> {
        self.inner.extract(query)
    }
}

#[tokio::test]
async fn test_worker_panic_becomes_table_failure() {
    let inner = source_with_tables(&["orders", "trades"]);
    inner.insert_records("trades", vec![trade(1, 5)]).unwrap();
    let source = Arc::new(PanickingSchema {
        inner,
        table: "orders".to_string(),
    });

    let store = LocalStore::open_in_memory().unwrap();
    let coordinator =
        SyncCoordinator::new(source, store.clone(), &test_config(None, 2)).unwrap();

    let report = completed(&coordinator).await;
    assert_eq!(report.tables_synced, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].table, "orders");
    assert!(report.failures[0].error.contains("panicked"));
    assert_eq!(store.row_count("trades").unwrap(), 1);
    assert!(!coordinator.is_running());

    // The gate was released, so the next trigger runs a full cycle
    let report = completed(&coordinator).await;
    assert_eq!(report.cycle, 2);
}
