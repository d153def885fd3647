//! Go toolchain: one cached distribution per version, one GOPATH per run.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};

use super::provider::{LanguageEnvironment, ToolchainProvider};

const DOWNLOAD_BASE: &str = "https://storage.googleapis.com/golang";

/// Provider for an installed Go distribution.
#[derive(Debug, Clone)]
pub struct GoToolchain {
    name: String,
    go_root: PathBuf,
    /// Base directory for GOPATH directories. If None, uses the system temp directory.
    base_dir: Option<PathBuf>,
}

impl GoToolchain {
    /// Wraps an already installed distribution under `go_root`.
    pub fn new(version: &str, go_root: PathBuf, base_dir: Option<PathBuf>) -> Self {
        Self {
            name: version.to_string(),
            go_root,
            base_dir,
        }
    }

    pub fn go_root(&self) -> &Path {
        &self.go_root
    }

    fn variables(&self, go_path: &Path) -> Vec<(String, String)> {
        let host_path = std::env::var("PATH").unwrap_or_default();
        let path = format!(
            "{}:{}:{}",
            go_path.join("bin").display(),
            self.go_root.join("bin").display(),
            host_path
        );

        vec![
            ("GOROOT".to_string(), self.go_root.display().to_string()),
            ("GOPATH".to_string(), go_path.display().to_string()),
            ("PATH".to_string(), path),
        ]
    }
}

impl ToolchainProvider for GoToolchain {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate_environment(&self, project_slug: &str) -> Result<LanguageEnvironment> {
        let root = super::run_dir(self.base_dir.as_deref())
            .map_err(|e| Error::Environment(format!("failed to create GOPATH: {}", e)))?;

        let go_path = root.path().to_path_buf();
        let working_dir = go_path.join("src").join(project_slug);
        let env = self.variables(&go_path);

        tracing::debug!(
            project = %project_slug,
            go_path = ?go_path,
            "created go environment"
        );

        LanguageEnvironment::new(root, working_dir, env)
    }
}

/// Directory a version is extracted into.
pub(crate) fn go_root(cache_root: &Path, version: &str) -> PathBuf {
    cache_root.join(version)
}

fn is_installed(go_root: &Path) -> bool {
    go_root.join("bin").join("go").is_file()
}

/// Downloads and extracts `version` under `cache_root` unless already there.
///
/// Callers must hold the cache's download lock.
pub(crate) async fn install(
    cache_root: &Path,
    version: &str,
    http: &reqwest::Client,
) -> Result<PathBuf> {
    let go_root = go_root(cache_root, version);
    if is_installed(&go_root) {
        return Ok(go_root);
    }

    tokio::fs::create_dir_all(cache_root).await?;

    let tarball = cache_root.join(format!("{}.tar.gz", version));
    if !tarball.is_file() {
        let url = format!("{}/{}.linux-amd64.tar.gz", DOWNLOAD_BASE, version);
        download(http, &url, &tarball).await?;
    }

    tokio::fs::create_dir_all(&go_root).await?;
    let output = Command::new("tar")
        .arg("-C")
        .arg(&go_root)
        .args(["--strip-components", "1", "-xf"])
        .arg(&tarball)
        .output()
        .await?;

    if !output.status.success() {
        let _ = tokio::fs::remove_dir_all(&go_root).await;
        return Err(Error::Environment(format!(
            "failed to extract {}: {}",
            tarball.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    if !is_installed(&go_root) {
        return Err(Error::Environment(format!(
            "{} does not contain bin/go",
            tarball.display()
        )));
    }

    tracing::info!(version = %version, go_root = ?go_root, "installed go toolchain");
    Ok(go_root)
}

async fn download(http: &reqwest::Client, url: &str, destination: &Path) -> Result<()> {
    tracing::info!(url = %url, "downloading go toolchain");

    let mut response = http
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| Error::Environment(format!("failed to download {}: {}", url, e)))?;

    let partial = destination.with_extension("part");
    let mut file = tokio::fs::File::create(&partial).await?;

    loop {
        let chunk = response
            .chunk()
            .await
            .map_err(|e| Error::Environment(format!("failed to download {}: {}", url, e)))?;
        let Some(chunk) = chunk else { break };
        file.write_all(&chunk).await?;
    }

    file.flush().await?;
    drop(file);

    tokio::fs::rename(&partial, destination).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_install(cache_root: &Path, version: &str) -> PathBuf {
        let root = go_root(cache_root, version);
        std::fs::create_dir_all(root.join("bin")).unwrap();
        std::fs::write(root.join("bin").join("go"), "#!/bin/sh\n").unwrap();
        root
    }

    #[tokio::test]
    async fn install_skips_existing_distribution() {
        let cache = TempDir::new().unwrap();
        let expected = fake_install(cache.path(), "go1.8.3");

        let installed = install(cache.path(), "go1.8.3", &reqwest::Client::new())
            .await
            .unwrap();

        assert_eq!(installed, expected);
        assert!(!cache.path().join("go1.8.3.tar.gz").exists());
    }

    #[test]
    fn environment_places_project_under_gopath() {
        let cache = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        let go_root = fake_install(cache.path(), "go1.8.3");
        let provider = GoToolchain::new("go1.8.3", go_root.clone(), Some(base.path().to_path_buf()));

        let env = provider
            .generate_environment("github.com/acme/widgets")
            .unwrap();

        assert!(env.working_dir().is_dir());
        assert!(env
            .working_dir()
            .ends_with("src/github.com/acme/widgets"));

        let vars = env.env();
        assert_eq!(vars[0], ("GOROOT".to_string(), go_root.display().to_string()));
        assert_eq!(vars[1].0, "GOPATH");
        assert_eq!(vars[1].1, env.temp_dir().display().to_string());
        assert!(vars[2]
            .1
            .starts_with(&format!("{}/bin:{}/bin:", env.temp_dir().display(), go_root.display())));
    }
}
