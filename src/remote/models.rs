// ABOUTME: Data structures describing remote datasets, tables, columns and extraction queries
// ABOUTME: Shared by every RemoteSource implementation and by the sync workers

use serde::{Deserialize, Serialize};

/// A single extracted row, one JSON cell per projected column.
pub type Row = Vec<serde_json::Value>;

/// Reference to a remote dataset (BigQuery `project.dataset`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRef {
    pub project_id: String,
    pub dataset_id: String,
}

impl DatasetRef {
    pub fn new(project_id: &str, dataset_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            dataset_id: dataset_id.to_string(),
        }
    }

    /// Build a reference to a table inside this dataset.
    pub fn table(&self, table_id: &str) -> RemoteTable {
        RemoteTable {
            project_id: self.project_id.clone(),
            dataset_id: self.dataset_id.clone(),
            table_id: table_id.to_string(),
        }
    }
}

/// Identifier of a remote, append-only table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteTable {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl RemoteTable {
    /// Fully qualified name (`project.dataset.table`).
    pub fn qualified_name(&self) -> String {
        format!("{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

/// A column of a remote table schema.
///
/// `field_type` carries the remote type name as reported by the warehouse
/// (`STRING`, `INT64`, `RECORD`, ...). Nested records list their subfields in
/// `fields`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteColumn {
    pub name: String,
    pub field_type: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub fields: Vec<RemoteColumn>,
}

impl RemoteColumn {
    pub fn new(name: &str, field_type: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: field_type.to_string(),
            mode: None,
            fields: Vec::new(),
        }
    }

    pub fn record(name: &str, fields: Vec<RemoteColumn>) -> Self {
        Self {
            name: name.to_string(),
            field_type: "RECORD".to_string(),
            mode: None,
            fields,
        }
    }

    pub fn is_record(&self) -> bool {
        matches!(self.field_type.as_str(), "RECORD" | "STRUCT")
    }

    pub fn is_repeated(&self) -> bool {
        self.mode.as_deref() == Some("REPEATED")
    }

    /// Find a direct subfield of a nested record by name.
    pub fn subfield(&self, name: &str) -> Option<&RemoteColumn> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A watermark-bounded extraction against one remote table.
///
/// `projections` are remote column expressions in local column order; nested
/// fields are addressed with a dotted path (`datastream_metadata.source_timestamp`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractQuery {
    pub table: RemoteTable,
    pub projections: Vec<String>,
    pub watermark_path: String,
    pub lower_bound: i64,
    pub page_size: usize,
}

impl ExtractQuery {
    /// Render the query as standard SQL.
    ///
    /// Generates a query like:
    /// ```sql
    /// SELECT id, price, datastream_metadata.source_timestamp
    /// FROM `project.dataset.trades`
    /// WHERE datastream_metadata.source_timestamp > 15
    /// ORDER BY datastream_metadata.source_timestamp ASC
    /// ```
    ///
    /// The comparison is strict so that re-running with an unchanged bound yields
    /// no rows.
    pub fn to_sql(&self) -> String {
        format!(
            "SELECT {} FROM `{}` WHERE {} > {} ORDER BY {} ASC",
            self.projections.join(", "),
            self.table.qualified_name(),
            self.watermark_path,
            self.lower_bound,
            self.watermark_path
        )
    }

    /// Position of the watermark expression within the projected row.
    pub fn watermark_index(&self) -> Option<usize> {
        self.projections
            .iter()
            .position(|p| *p == self.watermark_path)
    }
}
