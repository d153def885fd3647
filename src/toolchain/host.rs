//! Toolchain that relies on whatever the host already has installed.

use std::path::PathBuf;

use crate::error::{Error, Result};

use super::provider::{LanguageEnvironment, ToolchainProvider};

/// Provider for repositories that declare no language.
#[derive(Debug, Clone, Default)]
pub struct HostToolchain {
    /// Base directory for run directories. If None, uses the system temp directory.
    base_dir: Option<PathBuf>,
}

impl HostToolchain {
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        Self { base_dir }
    }
}

impl ToolchainProvider for HostToolchain {
    fn name(&self) -> &str {
        "host"
    }

    fn generate_environment(&self, project_slug: &str) -> Result<LanguageEnvironment> {
        let root = super::run_dir(self.base_dir.as_deref())
            .map_err(|e| Error::Environment(format!("failed to create run directory: {}", e)))?;
        let working_dir = root.path().join("src");

        tracing::debug!(project = %project_slug, path = ?working_dir, "created host environment");

        LanguageEnvironment::new(root, working_dir, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn environments_are_unique_and_empty() {
        let base = TempDir::new().unwrap();
        let provider = HostToolchain::new(Some(base.path().to_path_buf()));

        let first = provider.generate_environment("github.com/acme/widgets").unwrap();
        let second = provider.generate_environment("github.com/acme/widgets").unwrap();

        assert_ne!(first.working_dir(), second.working_dir());
        assert!(first.working_dir().starts_with(base.path()));
        assert!(first.env().is_empty());
    }
}
