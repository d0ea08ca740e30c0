// ABOUTME: WatermarkTracker - derives the extraction lower bound from local data
// ABOUTME: The watermark is never stored; it is MAX(watermark column) of the local table

use anyhow::{Context, Result};

use crate::store::LocalStore;

/// Reads the highest already-synced watermark of a local table.
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    column: String,
}

impl WatermarkTracker {
    pub fn new(column: &str) -> Self {
        Self {
            column: column.to_string(),
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    /// Current watermark of `table`.
    ///
    /// # Returns
    ///
    /// * `Ok(None)` - the table does not exist yet
    /// * `Ok(Some(0))` - the table exists but holds no rows
    /// * `Ok(Some(w))` - `w` is `MAX(column)` over existing rows
    pub fn current(&self, store: &LocalStore, table: &str) -> Result<Option<i64>> {
        if !store.table_exists(table)? {
            return Ok(None);
        }

        let max = store
            .max_value(table, &self.column)
            .with_context(|| format!("Failed to read watermark of '{}'", table))?;
        Ok(Some(max.unwrap_or(0)))
    }
}
