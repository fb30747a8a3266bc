//! Workspace layout — where deployment artifacts live on disk.
//!
//! Collaborators (source-control integration) populate
//! `{root}/{project_id}/{deployment_id}` with the checked-out revision
//! before the orchestrator runs a deployment.

use std::path::{Path, PathBuf};

use crate::error::{StrategyError, StrategyResult};

/// Root directory under which deployment workdirs are laid out.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Artifact directory for one deployment.
    pub fn deployment_dir(&self, project_id: &str, deployment_id: &str) -> PathBuf {
        self.root.join(project_id).join(deployment_id)
    }
}

/// Recursively copy a directory tree. Used by rollback to restore a
/// prior deployment's artifacts.
pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> StrategyResult<()> {
    if !src.is_dir() {
        return Err(StrategyError::NotFound(format!(
            "source directory {} does not exist",
            src.display()
        )));
    }
    std::fs::create_dir_all(dst).map_err(io_err)?;
    for entry in std::fs::read_dir(src).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(io_err)?;
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target).map_err(io_err)?;
        }
        // Symlinks are skipped: checked-out artifacts are plain trees.
    }
    Ok(())
}

/// Remove a workdir if it exists. Missing directories are fine,
/// since cleanup must be idempotent.
pub(crate) fn remove_workdir(dir: &Path) -> StrategyResult<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(e)),
    }
}

fn io_err(e: std::io::Error) -> StrategyError {
    StrategyError::Runtime(e.to_string())
}
