// ABOUTME: Stable alias pointing at the current snapshot directory
// ABOUTME: SnapshotAlias trait and a symlink implementation with atomic repointing

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// A named pointer that always resolves to at most one snapshot.
pub trait SnapshotAlias: Send + Sync {
    /// Where the alias lives.
    fn path(&self) -> &Path;

    /// Canonical path of the current target, or `None` when the alias is missing
    /// or dangling.
    fn resolve(&self) -> Result<Option<PathBuf>>;

    /// Repoint the alias to `target`. Readers observe either the old or the new
    /// target, never a missing alias.
    fn point_to(&self, target: &Path) -> Result<()>;
}

/// Alias implemented as a symbolic link.
///
/// Repointing creates a temporary link next to the alias and renames it over the
/// alias, which replaces the link atomically on POSIX filesystems.
#[derive(Debug, Clone)]
pub struct SymlinkAlias {
    path: PathBuf,
}

impl SymlinkAlias {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "alias".to_string());
        self.path
            .with_file_name(format!(".{}.tmp-{}", name, std::process::id()))
    }

    /// Link relative to the alias's directory when the target is a sibling.
    fn link_target(&self, target: &Path) -> PathBuf {
        match (target.parent(), self.path.parent(), target.file_name()) {
            (Some(a), Some(b), Some(name)) if a == b => PathBuf::from(name),
            _ => target.to_path_buf(),
        }
    }
}

impl SnapshotAlias for SymlinkAlias {
    fn path(&self) -> &Path {
        &self.path
    }

    fn resolve(&self) -> Result<Option<PathBuf>> {
        match fs::canonicalize(&self.path) {
            Ok(target) => Ok(Some(target)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to resolve alias {:?}", self.path)),
        }
    }

    fn point_to(&self, target: &Path) -> Result<()> {
        let temp = self.temp_path();
        match fs::remove_file(&temp) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to remove stale temporary link {:?}", temp))
            }
        }

        create_dir_link(&self.link_target(target), &temp)
            .with_context(|| format!("Failed to create temporary link {:?}", temp))?;

        replace_link(&temp, &self.path).with_context(|| {
            format!("Failed to repoint alias {:?} to {:?}", self.path, target)
        })?;

        tracing::info!("Alias {:?} now points to {:?}", self.path, target);
        Ok(())
    }
}

#[cfg(unix)]
fn create_dir_link(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_dir_link(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[cfg(unix)]
fn replace_link(temp: &Path, alias: &Path) -> std::io::Result<()> {
    fs::rename(temp, alias)
}

// Windows cannot rename over an existing directory link, so the swap is not atomic
#[cfg(windows)]
fn replace_link(temp: &Path, alias: &Path) -> std::io::Result<()> {
    match fs::remove_dir(alias) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::rename(temp, alias)
}
