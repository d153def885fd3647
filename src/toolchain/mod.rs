//! Language toolchains for test runs.
//!
//! [`ToolchainCache`] owns the process-wide cache directory and the single
//! download lock. It resolves a repository's [`Language`] to a
//! [`ToolchainProvider`], which then hands out a fresh
//! [`LanguageEnvironment`] for every run.

mod go;
mod host;
mod provider;

pub use go::GoToolchain;
pub use host::HostToolchain;
pub use provider::{LanguageEnvironment, ToolchainProvider};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Default cache directory for downloaded toolchains.
pub const DEFAULT_TOOLCHAIN_DIR: &str = "/var/lib/localCI/languages";

/// Language a repository is built with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Language {
    /// Whatever the host provides.
    #[default]
    Host,
    /// A Go distribution, e.g. `go1.8.3`.
    Go { version: String },
}

impl Language {
    /// Parses a `language`/`version` pair.
    ///
    /// An empty language or `none` means the host toolchain.
    pub fn parse(language: &str, version: &str) -> Result<Self> {
        let language = language.trim();
        let version = version.trim();

        if language.is_empty() || language.eq_ignore_ascii_case("none") {
            return Ok(Language::Host);
        }

        if language.eq_ignore_ascii_case("go") {
            if version.is_empty() {
                return Err(Error::Config("go language requires a version".to_string()));
            }
            if version.contains('/') || version.starts_with('.') {
                return Err(Error::Config(format!("invalid go version '{}'", version)));
            }
            return Ok(Language::Go {
                version: version.to_string(),
            });
        }

        Err(Error::Config(format!("language '{}' is not supported", language)))
    }
}

/// Creates a uniquely named run directory under `base` or the system temp dir.
pub(crate) fn run_dir(base: Option<&Path>) -> std::io::Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("localci-");
    match base {
        Some(base) => {
            std::fs::create_dir_all(base)?;
            builder.tempdir_in(base)
        }
        None => builder.tempdir(),
    }
}

/// Process-wide toolchain cache.
///
/// Installs are serialized by one lock so repositories sharing a version never
/// download it twice.
#[derive(Debug)]
pub struct ToolchainCache {
    root: PathBuf,
    run_base: Option<PathBuf>,
    http: reqwest::Client,
    download_lock: Mutex<()>,
}

impl ToolchainCache {
    pub fn new(root: PathBuf) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(60))
            .user_agent("localci")
            .build()
            .map_err(|e| Error::Environment(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            root,
            run_base: None,
            http,
            download_lock: Mutex::new(()),
        })
    }

    /// Sets the directory run environments are created in.
    pub fn with_run_base(mut self, run_base: PathBuf) -> Self {
        self.run_base = Some(run_base);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Installs `language` if needed and returns its provider.
    ///
    /// Idempotent and safe to call concurrently.
    pub async fn setup(&self, language: &Language) -> Result<Arc<dyn ToolchainProvider>> {
        match language {
            Language::Host => Ok(Arc::new(HostToolchain::new(self.run_base.clone()))),
            Language::Go { version } => {
                let _guard = self.download_lock.lock().await;
                let go_root = go::install(&self.root, version, &self.http).await?;
                Ok(Arc::new(GoToolchain::new(
                    version,
                    go_root,
                    self.run_base.clone(),
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_languages() {
        assert_eq!(Language::parse("", "").unwrap(), Language::Host);
        assert_eq!(Language::parse("none", "").unwrap(), Language::Host);
        assert_eq!(
            Language::parse("Go", "go1.8.3").unwrap(),
            Language::Go {
                version: "go1.8.3".to_string()
            }
        );
    }

    #[test]
    fn rejects_unknown_or_incomplete_languages() {
        assert!(Language::parse("cobol", "1").is_err());
        assert!(Language::parse("go", "").is_err());
        assert!(Language::parse("go", "../etc").is_err());
    }

    #[tokio::test]
    async fn host_setup_needs_no_download() {
        let cache_dir = TempDir::new().unwrap();
        let runs = TempDir::new().unwrap();
        let cache = ToolchainCache::new(cache_dir.path().to_path_buf())
            .unwrap()
            .with_run_base(runs.path().to_path_buf());

        let provider = cache.setup(&Language::Host).await.unwrap();
        let env = provider.generate_environment("example.test/acme/widgets").unwrap();

        assert_eq!(provider.name(), "host");
        assert!(env.working_dir().starts_with(runs.path()));
    }

    #[tokio::test]
    async fn concurrent_go_setup_reuses_installed_version() {
        let cache_dir = TempDir::new().unwrap();
        let bin = cache_dir.path().join("go1.9").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("go"), "").unwrap();

        let cache = Arc::new(ToolchainCache::new(cache_dir.path().to_path_buf()).unwrap());
        let language = Language::Go {
            version: "go1.9".to_string(),
        };

        let (a, b) = tokio::join!(cache.setup(&language), cache.setup(&language));

        assert_eq!(a.unwrap().name(), "go1.9");
        assert_eq!(b.unwrap().name(), "go1.9");
    }
}
