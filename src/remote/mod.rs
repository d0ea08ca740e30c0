// ABOUTME: Remote read capability consumed by the sync engine
// ABOUTME: Defines the RemoteSource trait with BigQuery and in-memory implementations

pub mod bigquery;
pub mod memory;
pub mod models;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

pub use bigquery::BigQuerySource;
pub use memory::MemorySource;
pub use models::{DatasetRef, ExtractQuery, RemoteColumn, RemoteTable, Row};

/// Read-only access to a remote warehouse dataset.
///
/// Implementations are expected to be already authenticated; the sync engine never
/// deals with credentials directly.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// List every table in a dataset.
    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<RemoteTable>>;

    /// Fetch the ordered column schema of a table.
    async fn get_schema(&self, table: &RemoteTable) -> Result<Vec<RemoteColumn>>;

    /// Run a watermark-bounded extraction and stream its result pages.
    ///
    /// Each item is one page of rows, in the order the query produced them. A page
    /// error ends the extraction; callers must not poll the stream afterwards.
    fn extract<'a>(&'a self, query: &ExtractQuery) -> BoxStream<'a, Result<Vec<Row>>>;
}
