// ABOUTME: In-memory implementation of RemoteSource for dry runs and tests
// ABOUTME: Evaluates extraction queries over stored JSON records without a warehouse

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::models::{DatasetRef, ExtractQuery, RemoteColumn, RemoteTable, Row};
use super::RemoteSource;

#[derive(Debug, Default)]
struct MemoryTable {
    columns: Vec<RemoteColumn>,
    records: Vec<JsonValue>,
}

/// A RemoteSource backed by JSON records held in memory.
///
/// Records are JSON objects keyed by column name; nested records are nested
/// objects. Extraction applies the same strict watermark filter and ascending
/// ordering the warehouse would, then splits the result into pages.
#[derive(Debug)]
pub struct MemorySource {
    dataset: DatasetRef,
    tables: RwLock<BTreeMap<String, MemoryTable>>,
    failures: RwLock<HashMap<String, String>>,
}

impl MemorySource {
    pub fn new(dataset: DatasetRef) -> Self {
        Self {
            dataset,
            tables: RwLock::new(BTreeMap::new()),
            failures: RwLock::new(HashMap::new()),
        }
    }

    pub fn dataset(&self) -> &DatasetRef {
        &self.dataset
    }

    /// Register a table with its schema. Replaces any existing table of that name.
    pub fn add_table(&self, table_id: &str, columns: Vec<RemoteColumn>) -> Result<()> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| anyhow!("memory source lock poisoned"))?;
        tables.insert(
            table_id.to_string(),
            MemoryTable {
                columns,
                records: Vec::new(),
            },
        );
        Ok(())
    }

    /// Append records to a registered table.
    pub fn insert_records(&self, table_id: &str, records: Vec<JsonValue>) -> Result<()> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| anyhow!("memory source lock poisoned"))?;
        let table = tables
            .get_mut(table_id)
            .ok_or_else(|| anyhow!("Table {} is not registered", table_id))?;
        table.records.extend(records);
        Ok(())
    }

    /// Make every schema fetch and extraction of a table fail with `message`.
    pub fn fail_table(&self, table_id: &str, message: &str) -> Result<()> {
        self.failures
            .write()
            .map_err(|_| anyhow!("memory source lock poisoned"))?
            .insert(table_id.to_string(), message.to_string());
        Ok(())
    }

    /// Clear an injected failure.
    pub fn heal_table(&self, table_id: &str) -> Result<()> {
        self.failures
            .write()
            .map_err(|_| anyhow!("memory source lock poisoned"))?
            .remove(table_id);
        Ok(())
    }

    fn check_failure(&self, table_id: &str) -> Result<()> {
        let failures = self
            .failures
            .read()
            .map_err(|_| anyhow!("memory source lock poisoned"))?;
        if let Some(message) = failures.get(table_id) {
            bail!("{}", message);
        }
        Ok(())
    }

    fn run_query(&self, query: &ExtractQuery) -> Result<Vec<Vec<Row>>> {
        self.check_failure(&query.table.table_id)?;

        let tables = self
            .tables
            .read()
            .map_err(|_| anyhow!("memory source lock poisoned"))?;
        let table = tables
            .get(&query.table.table_id)
            .ok_or_else(|| anyhow!("Table {} not found", query.table.qualified_name()))?;

        let mut matching: Vec<(i64, &JsonValue)> = table
            .records
            .iter()
            .filter_map(|record| {
                let watermark = lookup_path(record, &query.watermark_path).and_then(json_to_i64)?;
                (watermark > query.lower_bound).then_some((watermark, record))
            })
            .collect();
        // Stable sort keeps insertion order for equal watermarks
        matching.sort_by_key(|(watermark, _)| *watermark);

        let rows: Vec<Row> = matching
            .into_iter()
            .map(|(_, record)| {
                query
                    .projections
                    .iter()
                    .map(|path| lookup_path(record, path).cloned().unwrap_or(JsonValue::Null))
                    .collect()
            })
            .collect();

        Ok(rows
            .chunks(query.page_size.max(1))
            .map(|page| page.to_vec())
            .collect())
    }
}

#[async_trait]
impl RemoteSource for MemorySource {
    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<RemoteTable>> {
        if *dataset != self.dataset {
            bail!(
                "Dataset {}.{} not found",
                dataset.project_id,
                dataset.dataset_id
            );
        }
        let tables = self
            .tables
            .read()
            .map_err(|_| anyhow!("memory source lock poisoned"))?;
        Ok(tables.keys().map(|name| dataset.table(name)).collect())
    }

    async fn get_schema(&self, table: &RemoteTable) -> Result<Vec<RemoteColumn>> {
        self.check_failure(&table.table_id)?;
        let tables = self
            .tables
            .read()
            .map_err(|_| anyhow!("memory source lock poisoned"))?;
        tables
            .get(&table.table_id)
            .map(|t| t.columns.clone())
            .ok_or_else(|| anyhow!("Table {} not found", table.qualified_name()))
    }

    fn extract<'a>(&'a self, query: &ExtractQuery) -> BoxStream<'a, Result<Vec<Row>>> {
        match self.run_query(query) {
            Ok(pages) => stream::iter(pages.into_iter().map(Ok)).boxed(),
            Err(e) => stream::iter(vec![Err(e)]).boxed(),
        }
    }
}

/// Resolve a dotted path (`record.field`) inside a JSON object.
fn lookup_path<'v>(record: &'v JsonValue, path: &str) -> Option<&'v JsonValue> {
    path.split('.')
        .try_fold(record, |value, segment| value.get(segment))
}

fn json_to_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.parse().ok(),
        _ => None,
    }
}
