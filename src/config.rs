// ABOUTME: SyncConfig - runtime settings for the syncer, loadable from TOML
// ABOUTME: Holds remote dataset, local paths, pool size, schedule and projection rules

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::remote::DatasetRef;
use crate::store::LocalType;
use crate::sync::schema::{ProjectionRule, SchemaConverter, DEFAULT_WATERMARK_COLUMN};
use crate::utils::validate_identifier;

/// Settings for one syncer instance.
///
/// Every field has a default so a TOML file only needs to name what differs:
///
/// ```toml
/// project_id = "lens-public-data"
/// dataset_id = "v2_polygon"
/// input = "data/polygon.duckdb"
/// output = "data/export"
/// concurrency = 4
///
/// [[projections]]
/// field_path = "datastream_metadata.source_timestamp"
/// column = "source_timestamp"
/// local_type = "BIGINT"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub project_id: String,
    pub dataset_id: String,
    pub credentials_path: PathBuf,
    /// DuckDB database file.
    pub input: PathBuf,
    /// Output root for snapshots; publishing is disabled when unset.
    pub output: Option<PathBuf>,
    /// Snapshot directory and alias prefix; defaults to the dataset id.
    pub snapshot_prefix: Option<String>,
    pub concurrency: usize,
    pub page_size: usize,
    pub sync_interval_secs: u64,
    pub list_retries: u32,
    pub strict_schema: bool,
    pub watermark_column: String,
    pub projections: Vec<ProjectionRule>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            project_id: "lens-public-data".to_string(),
            dataset_id: "v2_polygon".to_string(),
            credentials_path: PathBuf::from("service_account.json"),
            input: PathBuf::new(),
            output: None,
            snapshot_prefix: None,
            concurrency: 1,
            page_size: 10_000,
            sync_interval_secs: 43_200,
            list_retries: 2,
            strict_schema: false,
            watermark_column: DEFAULT_WATERMARK_COLUMN.to_string(),
            projections: vec![ProjectionRule::datastream_source_timestamp()],
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse sync configuration")
    }

    /// Load a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration from {:?}", path))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid configuration in {:?}", path))
    }

    pub fn dataset(&self) -> DatasetRef {
        DatasetRef::new(&self.project_id, &self.dataset_id)
    }

    pub fn snapshot_prefix(&self) -> &str {
        self.snapshot_prefix.as_deref().unwrap_or(&self.dataset_id)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn schema_converter(&self) -> SchemaConverter {
        SchemaConverter::new(
            self.projections.clone(),
            &self.watermark_column,
            self.strict_schema,
        )
    }

    /// Check the configuration before any work starts.
    pub fn validate(&self) -> Result<()> {
        if self.project_id.trim().is_empty() {
            bail!("project_id cannot be empty");
        }
        validate_identifier(&self.dataset_id).context("Invalid dataset_id")?;
        if self.input.as_os_str().is_empty() {
            bail!("An input database path is required");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.page_size == 0 {
            bail!("page_size must be at least 1");
        }
        if self.sync_interval_secs == 0 {
            bail!("sync_interval_secs must be at least 1");
        }
        validate_identifier(self.snapshot_prefix()).context("Invalid snapshot prefix")?;
        validate_identifier(&self.watermark_column).context("Invalid watermark column")?;

        for rule in &self.projections {
            rule.validate()
                .with_context(|| format!("Invalid projection rule '{}'", rule.field_path))?;
        }

        match self
            .projections
            .iter()
            .find(|r| r.column == self.watermark_column)
        {
            Some(rule) if rule.local_type != LocalType::Bigint => bail!(
                "Watermark column '{}' must be projected as BIGINT, not {}",
                self.watermark_column,
                rule.local_type
            ),
            Some(_) => {}
            None => bail!(
                "No projection rule produces the watermark column '{}'",
                self.watermark_column
            ),
        }

        Ok(())
    }
}
