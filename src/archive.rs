//! Ships a revision's log directory to a remote host over `scp`.

use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::error::{Error, Result};

pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_DIR: &str = "/var/log/localCI";

/// Remote log archive endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogArchive {
    pub ip: String,
    pub user: String,
    /// Destination directory on the remote host.
    pub dir: String,
    /// Private key material; the ssh defaults are used when absent.
    pub key: Option<String>,
}

impl LogArchive {
    /// Creates an endpoint with the default user and directory.
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user: DEFAULT_USER.to_string(),
            dir: DEFAULT_DIR.to_string(),
            key: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// `user@ip:dir`.
    pub fn destination(&self) -> String {
        format!("{}@{}:{}", self.user, self.ip, self.dir)
    }

    /// Arguments passed to `scp`.
    fn scp_args(&self, key_file: Option<&Path>, log_dir: &Path) -> Vec<String> {
        let mut args: Vec<String> = [
            "-r",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "StrictHostKeyChecking=no",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if let Some(key_file) = key_file {
            args.push("-i".to_string());
            args.push(key_file.display().to_string());
        }

        args.push(log_dir.display().to_string());
        args.push(self.destination());
        args
    }

    /// Recursively copies `log_dir` to the archive.
    pub async fn copy(&self, log_dir: &Path) -> Result<()> {
        let key = match &self.key {
            Some(material) => Some(KeyFile::write(material)?),
            None => None,
        };

        let args = self.scp_args(key.as_ref().map(KeyFile::path), log_dir);
        tracing::debug!(args = ?args, "copying logs with scp");

        let output = Command::new("scp")
            .args(&args)
            .output()
            .await
            .map_err(|e| Error::Archive(format!("failed to run scp: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Archive(format!(
                "scp to {} failed: {}",
                self.destination(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        tracing::info!(log_dir = ?log_dir, destination = %self.destination(), "copied logs");
        Ok(())
    }
}

/// Private key written to a 0600 file inside a 0700 directory, removed on drop.
struct KeyFile {
    _dir: tempfile::TempDir,
    path: PathBuf,
}

impl KeyFile {
    fn write(material: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(".ssh")
            .tempdir()
            .map_err(|e| Error::Archive(format!("failed to create key directory: {}", e)))?;
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))?;

        let path = dir.path().join("key");
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;
        file.write_all(material.as_bytes())?;

        Ok(Self { _dir: dir, path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_system_layout() {
        let archive = LogArchive::new("10.0.0.5");

        assert_eq!(archive.destination(), "root@10.0.0.5:/var/log/localCI");
    }

    #[test]
    fn scp_args_include_key_when_present() {
        let archive = LogArchive::new("logs.example.test")
            .with_user("ci")
            .with_dir("/srv/logs");

        let args = archive.scp_args(Some(Path::new("/tmp/k")), Path::new("/var/log/localCI/7"));

        assert_eq!(
            args,
            vec![
                "-r",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "StrictHostKeyChecking=no",
                "-i",
                "/tmp/k",
                "/var/log/localCI/7",
                "ci@logs.example.test:/srv/logs",
            ]
        );
    }

    #[test]
    fn key_file_is_private_and_removed() {
        let key = KeyFile::write("-----BEGIN KEY-----").unwrap();
        let path = key.path().to_path_buf();

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o600);
        assert_eq!(dir_mode, 0o700);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "-----BEGIN KEY-----");

        drop(key);
        assert!(!path.exists());
    }
}
