// ABOUTME: SchemaConverter - maps remote column schemas to local column definitions
// ABOUTME: Applies declarative projection rules that flatten nested record fields

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::remote::RemoteColumn;
use crate::store::LocalType;
use crate::utils::{quote_ident, validate_identifier};

/// Default watermark column produced by the datastream projection.
pub const DEFAULT_WATERMARK_COLUMN: &str = "source_timestamp";

/// Flattens one field of a nested record into a top-level local column.
///
/// `field_path` is `record.subfield`; the record column is replaced in the local
/// schema by `column` of type `local_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionRule {
    pub field_path: String,
    pub column: String,
    pub local_type: LocalType,
}

impl ProjectionRule {
    pub fn new(field_path: &str, column: &str, local_type: LocalType) -> Self {
        Self {
            field_path: field_path.to_string(),
            column: column.to_string(),
            local_type,
        }
    }

    /// The Datastream change-metadata rule:
    /// `datastream_metadata.source_timestamp` → `source_timestamp BIGINT`.
    pub fn datastream_source_timestamp() -> Self {
        Self::new(
            "datastream_metadata.source_timestamp",
            DEFAULT_WATERMARK_COLUMN,
            LocalType::Bigint,
        )
    }

    /// Split `field_path` into (record, subfield).
    pub fn parts(&self) -> Result<(&str, &str)> {
        let (record, subfield) = self
            .field_path
            .split_once('.')
            .with_context(|| format!("Projection path '{}' must be record.field", self.field_path))?;
        if subfield.contains('.') {
            bail!(
                "Projection path '{}' nests deeper than one level",
                self.field_path
            );
        }
        Ok((record, subfield))
    }

    pub fn validate(&self) -> Result<()> {
        let (record, subfield) = self.parts()?;
        validate_identifier(record)?;
        validate_identifier(subfield)?;
        validate_identifier(&self.column)?;
        Ok(())
    }
}

/// A column of the local table together with the remote expression that feeds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalColumn {
    pub name: String,
    pub local_type: LocalType,
    pub source_expr: String,
}

impl LocalColumn {
    /// `"name" TYPE` as used in `CREATE TABLE`.
    pub fn definition(&self) -> String {
        format!("{} {}", quote_ident(&self.name), self.local_type.as_sql())
    }
}

/// The converted schema of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSchema {
    pub columns: Vec<LocalColumn>,
    watermark_index: usize,
}

impl LocalSchema {
    pub fn column_definitions(&self) -> Vec<String> {
        self.columns.iter().map(LocalColumn::definition).collect()
    }

    pub fn column_types(&self) -> Vec<LocalType> {
        self.columns.iter().map(|c| c.local_type).collect()
    }

    pub fn source_expressions(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.source_expr.clone()).collect()
    }

    pub fn watermark_index(&self) -> usize {
        self.watermark_index
    }

    pub fn watermark(&self) -> &LocalColumn {
        &self.columns[self.watermark_index]
    }
}

/// Converts remote schemas into local ones.
///
/// Scalar columns keep their name and get a direct type mapping. Nested records
/// are replaced by the columns of the projection rules that target them; records
/// with no matching rule (or lacking the rule's subfield) are dropped with a
/// warning, or rejected when `strict` is set.
#[derive(Debug, Clone)]
pub struct SchemaConverter {
    rules: Vec<ProjectionRule>,
    watermark_column: String,
    strict: bool,
}

impl Default for SchemaConverter {
    fn default() -> Self {
        Self::new(
            vec![ProjectionRule::datastream_source_timestamp()],
            DEFAULT_WATERMARK_COLUMN,
            false,
        )
    }
}

impl SchemaConverter {
    pub fn new(rules: Vec<ProjectionRule>, watermark_column: &str, strict: bool) -> Self {
        Self {
            rules,
            watermark_column: watermark_column.to_string(),
            strict,
        }
    }

    pub fn watermark_column(&self) -> &str {
        &self.watermark_column
    }

    /// Convert the ordered remote columns of `table` into a local schema.
    ///
    /// # Errors
    ///
    /// Fails when a column name is not a valid identifier, when two columns map to
    /// the same local name, when the watermark column is missing or not BIGINT,
    /// or (in strict mode) when a nested record cannot be projected.
    pub fn convert(&self, table: &str, remote: &[RemoteColumn]) -> Result<LocalSchema> {
        let mut columns: Vec<LocalColumn> = Vec::with_capacity(remote.len());

        for field in remote {
            validate_identifier(&field.name)
                .with_context(|| format!("Unsupported column in table '{}'", table))?;

            if field.is_record() && !field.is_repeated() {
                self.project_record(table, field, &mut columns)?;
                continue;
            }

            let local_type = if field.is_repeated() || field.is_record() {
                LocalType::Varchar
            } else {
                LocalType::from_remote(&field.field_type)
            };

            columns.push(LocalColumn {
                name: field.name.clone(),
                local_type,
                source_expr: field.name.clone(),
            });
        }

        for (idx, column) in columns.iter().enumerate() {
            if columns[..idx].iter().any(|c| c.name == column.name) {
                bail!(
                    "Table '{}' maps more than one field to local column '{}'",
                    table,
                    column.name
                );
            }
        }

        let watermark_index = columns
            .iter()
            .position(|c| c.name == self.watermark_column)
            .with_context(|| {
                format!(
                    "Table '{}' has no watermark column '{}'",
                    table, self.watermark_column
                )
            })?;

        if columns[watermark_index].local_type != LocalType::Bigint {
            bail!(
                "Watermark column '{}' of table '{}' must be BIGINT, found {}",
                self.watermark_column,
                table,
                columns[watermark_index].local_type
            );
        }

        Ok(LocalSchema {
            columns,
            watermark_index,
        })
    }

    fn project_record(
        &self,
        table: &str,
        record: &RemoteColumn,
        columns: &mut Vec<LocalColumn>,
    ) -> Result<()> {
        let mut matched = false;

        for rule in &self.rules {
            let (rule_record, subfield) = rule.parts()?;
            if rule_record != record.name {
                continue;
            }

            if record.subfield(subfield).is_some() {
                columns.push(LocalColumn {
                    name: rule.column.clone(),
                    local_type: rule.local_type,
                    source_expr: rule.field_path.clone(),
                });
                matched = true;
            } else if self.strict {
                bail!(
                    "Record '{}' in table '{}' has no field '{}'",
                    record.name,
                    table,
                    subfield
                );
            } else {
                tracing::warn!(
                    "Record '{}' in table '{}' has no field '{}'; skipping projection",
                    record.name,
                    table,
                    subfield
                );
            }
        }

        if !matched {
            if self.strict {
                bail!(
                    "Nested record '{}' in table '{}' has no projection rule",
                    record.name,
                    table
                );
            }
            tracing::warn!(
                "Dropping nested record '{}' from table '{}': no projection rule",
                record.name,
                table
            );
        }

        Ok(())
    }
}
