// ABOUTME: SnapshotPublisher - exports local tables to Parquet and rotates the stable alias
// ABOUTME: Creates a timestamped snapshot, repoints the alias, then deletes stale snapshots

pub mod alias;
pub mod layout;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::store::LocalStore;
use crate::utils::validate_identifier;

pub use alias::{SnapshotAlias, SymlinkAlias};
pub use layout::SnapshotLayout;

/// Source of tables to export into a snapshot.
pub trait TableExporter: Send + Sync {
    fn list_tables(&self) -> Result<Vec<String>>;
    fn export_table(&self, table: &str, dest: &Path) -> Result<()>;
}

impl TableExporter for LocalStore {
    fn list_tables(&self) -> Result<Vec<String>> {
        LocalStore::list_tables(self)
    }

    fn export_table(&self, table: &str, dest: &Path) -> Result<()> {
        self.export_parquet(table, dest)
    }
}

/// Result of one publish run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub snapshot_dir: PathBuf,
    pub exported: Vec<String>,
    /// (table, error) for every export that failed.
    pub failed: Vec<(String, String)>,
    pub removed: Vec<PathBuf>,
}

impl PublishReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Publishes snapshots of the local store under an output root.
pub struct SnapshotPublisher {
    layout: SnapshotLayout,
    alias: Box<dyn SnapshotAlias>,
}

impl SnapshotPublisher {
    pub fn new(layout: SnapshotLayout, alias: Box<dyn SnapshotAlias>) -> Self {
        Self { layout, alias }
    }

    /// Publisher whose alias is a symlink at `<root>/<prefix>`.
    pub fn with_symlink(root: &Path, prefix: &str) -> Result<Self> {
        let layout = SnapshotLayout::new(root, prefix)?;
        let alias = SymlinkAlias::new(&layout.alias_path());
        Ok(Self::new(layout, Box::new(alias)))
    }

    pub fn layout(&self) -> &SnapshotLayout {
        &self.layout
    }

    pub fn alias(&self) -> &dyn SnapshotAlias {
        self.alias.as_ref()
    }

    pub fn create_snapshot_dir(&self) -> Result<PathBuf> {
        self.layout.create_snapshot_dir()
    }

    /// Export every table currently in the store as `<dir>/<table>.parquet`.
    ///
    /// # Returns
    ///
    /// The exported table names and the (table, error) pairs that failed. A failed
    /// export does not stop the others; only failing to list tables is an error.
    pub fn export_all(
        &self,
        exporter: &dyn TableExporter,
        dir: &Path,
    ) -> Result<(Vec<String>, Vec<(String, String)>)> {
        let tables = exporter
            .list_tables()
            .context("Failed to list local tables for export")?;

        tracing::info!("Exporting {} tables to {:?}", tables.len(), dir);

        let mut exported = Vec::new();
        let mut failed = Vec::new();

        for table in tables {
            let result = validate_identifier(&table).and_then(|_| {
                let dest = dir.join(format!("{}.parquet", table));
                exporter.export_table(&table, &dest)
            });

            match result {
                Ok(()) => {
                    tracing::debug!("  Exported '{}'", table);
                    exported.push(table);
                }
                Err(e) => {
                    tracing::error!("Failed to export table '{}': {:?}", table, e);
                    failed.push((table, format!("{:#}", e)));
                }
            }
        }

        Ok((exported, failed))
    }

    /// Make `dir` the current snapshot.
    pub fn publish(&self, dir: &Path) -> Result<()> {
        self.alias.point_to(dir)
    }

    /// Delete every snapshot directory the alias does not point at.
    ///
    /// Nothing is deleted when the alias does not resolve. A directory that cannot
    /// be removed is logged and left for the next run.
    pub fn garbage_collect(&self) -> Result<Vec<PathBuf>> {
        let Some(current) = self.alias.resolve()? else {
            tracing::warn!(
                "Alias {:?} does not resolve; skipping snapshot cleanup",
                self.alias.path()
            );
            return Ok(Vec::new());
        };

        let mut removed = Vec::new();
        for dir in self.layout.snapshot_dirs()? {
            let canonical = fs::canonicalize(&dir)
                .with_context(|| format!("Failed to resolve snapshot {:?}", dir))?;
            if canonical == current {
                continue;
            }

            match fs::remove_dir_all(&dir) {
                Ok(()) => {
                    tracing::info!("Removed stale snapshot {:?}", dir);
                    removed.push(dir);
                }
                Err(e) => tracing::warn!("Failed to remove stale snapshot {:?}: {}", dir, e),
            }
        }

        Ok(removed)
    }

    /// Create, export, publish and collect in one go.
    pub fn run(&self, exporter: &dyn TableExporter) -> Result<PublishReport> {
        let snapshot_dir = self.create_snapshot_dir()?;
        let (exported, failed) = self.export_all(exporter, &snapshot_dir)?;

        if !failed.is_empty() {
            tracing::warn!(
                "{} of {} tables failed to export; publishing partial snapshot",
                failed.len(),
                failed.len() + exported.len()
            );
        }

        self.publish(&snapshot_dir)?;
        let removed = self.garbage_collect()?;

        tracing::info!(
            "Published snapshot {:?} ({} tables, {} stale removed)",
            snapshot_dir,
            exported.len(),
            removed.len()
        );

        Ok(PublishReport {
            snapshot_dir,
            exported,
            failed,
            removed,
        })
    }
}
