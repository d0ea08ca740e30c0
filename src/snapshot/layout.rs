// ABOUTME: Filesystem layout of published snapshots under the output root
// ABOUTME: Names, creates and lists <prefix>_YYYYMMDD_HHMMSS snapshot directories

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::utils::validate_identifier;

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const MAX_COLLISION_SUFFIX: u32 = 1000;

/// Output root plus the prefix shared by the alias and every snapshot directory.
///
/// ```text
/// <root>/
///   <prefix> -> <prefix>_20240501_120000
///   <prefix>_20240501_120000/
///     trades.parquet
///     orders.parquet
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotLayout {
    root: PathBuf,
    prefix: String,
}

impl SnapshotLayout {
    pub fn new(root: &Path, prefix: &str) -> Result<Self> {
        validate_identifier(prefix).context("Invalid snapshot prefix")?;
        Ok(Self {
            root: root.to_path_buf(),
            prefix: prefix.to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Location of the stable alias (`<root>/<prefix>`).
    pub fn alias_path(&self) -> PathBuf {
        self.root.join(&self.prefix)
    }

    /// Whether `name` follows `<prefix>_YYYYMMDD_HHMMSS` with an optional `_N`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use bq_syncer::snapshot::SnapshotLayout;
    /// # use std::path::Path;
    /// let layout = SnapshotLayout::new(Path::new("/data/out"), "v2_polygon").unwrap();
    /// assert!(layout.is_snapshot_name("v2_polygon_20240501_120000"));
    /// assert!(layout.is_snapshot_name("v2_polygon_20240501_120000_2"));
    /// assert!(!layout.is_snapshot_name("v2_polygon"));
    /// assert!(!layout.is_snapshot_name("v2_polygon_latest"));
    /// ```
    pub fn is_snapshot_name(&self, name: &str) -> bool {
        let Some(rest) = name
            .strip_prefix(self.prefix.as_str())
            .and_then(|r| r.strip_prefix('_'))
        else {
            return false;
        };

        let mut parts = rest.split('_');
        let date_ok = parts
            .next()
            .is_some_and(|p| p.len() == 8 && p.bytes().all(|b| b.is_ascii_digit()));
        let time_ok = parts
            .next()
            .is_some_and(|p| p.len() == 6 && p.bytes().all(|b| b.is_ascii_digit()));
        let suffix_ok = match parts.next() {
            None => true,
            Some(n) => !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()),
        };

        date_ok && time_ok && suffix_ok && parts.next().is_none()
    }

    /// Create a fresh snapshot directory named after the current local time.
    ///
    /// When a directory with that name already exists (two publishes within the
    /// same second), `_1`, `_2`, ... is appended.
    pub fn create_snapshot_dir(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create output root {:?}", self.root))?;

        let base = format!(
            "{}_{}",
            self.prefix,
            chrono::Local::now().format(TIMESTAMP_FORMAT)
        );

        for attempt in 0..=MAX_COLLISION_SUFFIX {
            let name = if attempt == 0 {
                base.clone()
            } else {
                format!("{}_{}", base, attempt)
            };
            let dir = self.root.join(&name);

            match fs::create_dir(&dir) {
                Ok(()) => {
                    tracing::debug!("Created snapshot directory {:?}", dir);
                    return Ok(dir);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create snapshot directory {:?}", dir))
                }
            }
        }

        bail!(
            "Could not find a free snapshot directory name for {} under {:?}",
            base,
            self.root
        )
    }

    /// Every snapshot directory currently under the root, sorted by name.
    ///
    /// Symlinks (including the alias) are never returned.
    pub fn snapshot_dirs(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read output root {:?}", self.root))
            }
        };

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("Failed to read entry in {:?}", self.root))?;
            let file_type = entry
                .file_type()
                .with_context(|| format!("Failed to stat {:?}", entry.path()))?;
            if !file_type.is_dir() {
                continue;
            }
            if entry
                .file_name()
                .to_str()
                .is_some_and(|name| self.is_snapshot_name(name))
            {
                dirs.push(entry.path());
            }
        }

        dirs.sort();
        Ok(dirs)
    }
}
