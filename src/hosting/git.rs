//! Git plumbing used to materialise revisions on disk.

use std::path::Path;

use tokio::process::Command;

use crate::error::{Error, Result};

/// Runs `git <args>` inside `dir`, failing with the captured stderr.
pub(crate) async fn git(dir: &Path, args: &[&str]) -> Result<()> {
    tracing::debug!(dir = ?dir, args = ?args, "running git");

    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Git(format!("failed to run git {}: {}", args.join(" "), e)))?;

    if !output.status.success() {
        return Err(Error::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(())
}

/// Clones `url` into `dir`, which must already exist and be empty.
pub(crate) async fn clone_into(url: &str, dir: &Path) -> Result<()> {
    git(dir, &["clone", url, "."]).await
}

/// Clones and checks out `branch`.
pub(crate) async fn download_branch(url: &str, branch: &str, dir: &Path) -> Result<()> {
    clone_into(url, dir).await?;
    git(dir, &["checkout", branch]).await
}

/// Clones and checks out the head ref of change request `number`.
///
/// The proposal is fetched from the base repository's `pull/<n>/head` ref, so
/// the contributor's fork never has to be reachable.
pub(crate) async fn download_change_request(url: &str, number: u64, dir: &Path) -> Result<()> {
    clone_into(url, dir).await?;
    let local = format!("localci/pr-{}", number);
    let refspec = format!("pull/{}/head:{}", number, local);
    git(dir, &["fetch", "origin", &refspec]).await?;
    git(dir, &["checkout", &local]).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    /// Helper to create a temp git repo with one commit on a `feature` branch.
    fn create_temp_git_repo() -> TempDir {
        let temp_dir = TempDir::new().expect("failed to create temp dir");

        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test User"],
        ] {
            StdCommand::new("git")
                .args(&args)
                .current_dir(temp_dir.path())
                .output()
                .expect("failed to configure git repo");
        }

        std::fs::write(temp_dir.path().join("README.md"), "# Test Repo\n")
            .expect("failed to write README");

        for args in [
            vec!["add", "."],
            vec!["commit", "-m", "Initial commit"],
            vec!["branch", "feature"],
        ] {
            StdCommand::new("git")
                .args(&args)
                .current_dir(temp_dir.path())
                .output()
                .expect("failed to commit");
        }

        temp_dir
    }

    #[tokio::test]
    async fn downloads_branch_from_local_remote() {
        let origin = create_temp_git_repo();
        let dest = TempDir::new().unwrap();
        let url = origin.path().to_string_lossy().to_string();

        download_branch(&url, "feature", dest.path())
            .await
            .expect("download failed");

        assert!(dest.path().join("README.md").exists());
    }

    #[tokio::test]
    async fn unknown_branch_is_git_error() {
        let origin = create_temp_git_repo();
        let dest = TempDir::new().unwrap();
        let url = origin.path().to_string_lossy().to_string();

        let err = download_branch(&url, "does-not-exist", dest.path())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Git(_)));
    }
}
