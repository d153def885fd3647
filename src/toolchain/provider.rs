//! Toolchain provider trait and the per-run environment it produces.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::{Error, Result};

/// An isolated working directory plus the variables needed to build in it.
///
/// The backing temporary directory is removed by [`cleanup`](Self::cleanup)
/// or, failing that, when the value is dropped.
#[derive(Debug)]
pub struct LanguageEnvironment {
    /// Directory the revision is downloaded into and stages run from.
    working_dir: PathBuf,
    /// Root of everything created for this run.
    temp_dir: PathBuf,
    /// Toolchain variables, in the order they should be applied.
    env: Vec<(String, String)>,
    /// Owned temporary directory; `None` once cleaned up.
    root: Option<TempDir>,
}

impl LanguageEnvironment {
    /// Wraps `root`, creating `working_dir` (which must live inside it).
    pub(crate) fn new(root: TempDir, working_dir: PathBuf, env: Vec<(String, String)>) -> Result<Self> {
        std::fs::create_dir_all(&working_dir).map_err(|e| {
            Error::Environment(format!(
                "failed to create working directory {}: {}",
                working_dir.display(),
                e
            ))
        })?;
        Ok(Self {
            working_dir,
            temp_dir: root.path().to_path_buf(),
            env,
            root: Some(root),
        })
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Removes the working and temporary directories. Safe to call twice.
    pub fn cleanup(&mut self) -> Result<()> {
        let Some(root) = self.root.take() else {
            return Ok(());
        };

        root.close()?;
        tracing::debug!(path = ?self.temp_dir, "removed language environment");
        Ok(())
    }
}

impl Drop for LanguageEnvironment {
    fn drop(&mut self) {
        if self.root.is_some() {
            if let Err(e) = self.cleanup() {
                tracing::error!(error = %e, path = ?self.temp_dir, "failed to cleanup language environment on drop");
            }
        }
    }
}

/// Produces language environments for one installed toolchain.
pub trait ToolchainProvider: Send + Sync {
    /// Short name for logs, e.g. `host` or `go1.8.3`.
    fn name(&self) -> &str;

    /// Creates a fresh environment for `project_slug` (`domain/owner/repo`).
    ///
    /// Every call returns distinct directories so concurrent runs never
    /// collide.
    fn generate_environment(&self, project_slug: &str) -> Result<LanguageEnvironment>;
}
