// ABOUTME: Extractor - watermark-bounded, ascending, paginated reads from a remote table
// ABOUTME: Turns result pages into row batches annotated with their highest watermark

use anyhow::{anyhow, Result};
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;

use crate::remote::{ExtractQuery, RemoteSource, RemoteTable, Row};

use super::schema::LocalSchema;

/// One page of extracted rows in local column order.
#[derive(Debug, Clone, PartialEq)]
pub struct RowBatch {
    pub rows: Vec<Row>,
    /// Highest watermark in the batch (the last row's, since rows are ascending).
    pub max_watermark: Option<i64>,
}

impl RowBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Builds extraction queries and streams their result pages.
#[derive(Clone)]
pub struct Extractor {
    source: Arc<dyn RemoteSource>,
    page_size: usize,
}

impl Extractor {
    pub fn new(source: Arc<dyn RemoteSource>, page_size: usize) -> Self {
        Self { source, page_size }
    }

    /// The query that reads every row of `table` with a watermark above `lower_bound`.
    pub fn query(&self, table: &RemoteTable, schema: &LocalSchema, lower_bound: i64) -> ExtractQuery {
        ExtractQuery {
            table: table.clone(),
            projections: schema.source_expressions(),
            watermark_path: schema.watermark().source_expr.clone(),
            lower_bound,
            page_size: self.page_size,
        }
    }

    /// Stream batches of rows with a watermark strictly greater than `lower_bound`.
    ///
    /// The stream is lazy and finite. Empty pages are skipped. The first error is
    /// yielded once and ends the stream.
    pub fn extract<'a>(
        &'a self,
        table: &RemoteTable,
        schema: &LocalSchema,
        lower_bound: i64,
    ) -> BoxStream<'a, Result<RowBatch>> {
        let query = self.query(table, schema, lower_bound);
        let watermark_index = schema.watermark_index();

        tracing::debug!("Extracting from {}: {}", table.qualified_name(), query.to_sql());

        let mut failed = false;
        self.source
            .extract(&query)
            .take_while(move |page| {
                let keep = !failed;
                failed = failed || page.is_err();
                futures::future::ready(keep)
            })
            .filter_map(move |page| {
                let batch = page.and_then(|rows| to_batch(rows, watermark_index));
                futures::future::ready(match batch {
                    Ok(batch) if batch.is_empty() => None,
                    other => Some(other),
                })
            })
            .boxed()
    }
}

fn to_batch(rows: Vec<Row>, watermark_index: usize) -> Result<RowBatch> {
    let max_watermark = match rows.last() {
        Some(row) => {
            let cell = row
                .get(watermark_index)
                .ok_or_else(|| anyhow!("Extracted row is missing the watermark column"))?;
            watermark_of(cell)?
        }
        None => None,
    };
    Ok(RowBatch {
        rows,
        max_watermark,
    })
}

fn watermark_of(cell: &serde_json::Value) -> Result<Option<i64>> {
    match cell {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| anyhow!("Watermark {} is not an integer", n)),
        serde_json::Value::String(s) => s
            .parse::<i64>()
            .map(Some)
            .map_err(|e| anyhow!("Watermark '{}' is not an integer: {}", s, e)),
        other => Err(anyhow!("Watermark {} is not an integer", other)),
    }
}
