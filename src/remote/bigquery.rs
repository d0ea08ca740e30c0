// ABOUTME: BigQuery implementation of RemoteSource using gcp-bigquery-client
// ABOUTME: Lists dataset tables, fetches schemas, and pages through extraction queries

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use gcp_bigquery_client::model::job_configuration_query::JobConfigurationQuery;
use gcp_bigquery_client::model::table_field_schema::TableFieldSchema;
use gcp_bigquery_client::model::table_row::TableRow;
use gcp_bigquery_client::table::ListOptions;
use gcp_bigquery_client::Client;
use std::path::Path;

use super::models::{DatasetRef, ExtractQuery, RemoteColumn, RemoteTable, Row};
use super::RemoteSource;

/// Reads tables from Google BigQuery.
///
/// Query jobs are billed to `job_project_id` (the service account's project), which
/// may differ from the project that owns the replicated dataset.
pub struct BigQuerySource {
    client: Client,
    job_project_id: String,
}

impl BigQuerySource {
    /// Create a source from an already-authenticated client.
    pub fn new(client: Client, job_project_id: &str) -> Self {
        Self {
            client,
            job_project_id: job_project_id.to_string(),
        }
    }

    /// Authenticate with a service account key file.
    ///
    /// The key's own `project_id` is used as the job project.
    pub async fn from_service_account_file(path: &Path) -> Result<Self> {
        let path_str = path.to_string_lossy();
        let sa_key = gcp_bigquery_client::yup_oauth2::read_service_account_key(path_str.as_ref())
            .await
            .with_context(|| format!("Failed to read service account key from {:?}", path))?;

        let job_project_id = sa_key
            .project_id
            .clone()
            .with_context(|| format!("Service account key {:?} has no project_id", path))?;

        let client = Client::from_service_account_key(sa_key, false)
            .await
            .context("Failed to create BigQuery client from service account key")?;

        tracing::info!("Authenticated BigQuery client for project {}", job_project_id);
        Ok(Self::new(client, &job_project_id))
    }
}

#[async_trait]
impl RemoteSource for BigQuerySource {
    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<RemoteTable>> {
        let mut tables = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut options = ListOptions::default();
            if let Some(token) = page_token.take() {
                options = options.page_token(token);
            }

            let page = self
                .client
                .table()
                .list(&dataset.project_id, &dataset.dataset_id, options)
                .await
                .with_context(|| {
                    format!(
                        "Failed to list tables in {}.{}",
                        dataset.project_id, dataset.dataset_id
                    )
                })?;

            for entry in page.tables.unwrap_or_default() {
                tables.push(dataset.table(&entry.table_reference.table_id));
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(tables)
    }

    async fn get_schema(&self, table: &RemoteTable) -> Result<Vec<RemoteColumn>> {
        let remote = self
            .client
            .table()
            .get(&table.project_id, &table.dataset_id, &table.table_id, None)
            .await
            .with_context(|| format!("Failed to fetch schema of {}", table.qualified_name()))?;

        remote
            .schema
            .fields
            .unwrap_or_default()
            .iter()
            .map(convert_field)
            .collect()
    }

    fn extract<'a>(&'a self, query: &ExtractQuery) -> BoxStream<'a, Result<Vec<Row>>> {
        let table = query.table.qualified_name();
        let job = JobConfigurationQuery {
            query: query.to_sql(),
            use_legacy_sql: Some(false),
            ..Default::default()
        };
        let page_size = i32::try_from(query.page_size).unwrap_or(i32::MAX);

        self.client
            .job()
            .query_all(&self.job_project_id, job, Some(page_size))
            .map(move |page| {
                page.map(|rows| rows.into_iter().map(table_row_to_row).collect())
                    .with_context(|| format!("Failed to read result page from {}", table))
            })
            .boxed()
    }
}

/// Convert a BigQuery schema field (recursively) into a RemoteColumn.
fn convert_field(field: &TableFieldSchema) -> Result<RemoteColumn> {
    // FieldType serializes to the wire name (STRING, INT64, RECORD, ...)
    let field_type = serde_json::to_value(&field.r#type)
        .with_context(|| format!("Failed to read type of column '{}'", field.name))?
        .as_str()
        .unwrap_or("STRING")
        .to_string();

    let fields = field
        .fields
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(convert_field)
        .collect::<Result<Vec<_>>>()?;

    Ok(RemoteColumn {
        name: field.name.clone(),
        field_type,
        mode: field.mode.clone(),
        fields,
    })
}

fn table_row_to_row(row: TableRow) -> Row {
    row.columns
        .unwrap_or_default()
        .into_iter()
        .map(|cell| cell.value.unwrap_or(serde_json::Value::Null))
        .collect()
}
