//! Hosting platform abstraction.
//!
//! [`HostingClient`] is the narrow capability interface the monitor needs from
//! a code-hosting backend. [`GitHubClient`] talks to a GitHub-style REST API;
//! [`InMemoryHost`] keeps everything in process for tests.

mod git;
pub mod github;
pub mod memory;

pub use github::GitHubClient;
pub use memory::InMemoryHost;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::revision::{BranchRevision, ChangeRequest, Revision, TriggerComment};

/// Capability interface over a code-hosting backend.
#[async_trait]
pub trait HostingClient: Send + Sync {
    /// `owner/repo`.
    fn repo_slug(&self) -> String;

    /// `domain/owner/repo`.
    fn project_slug(&self) -> String;

    /// Numbers of every currently open change request.
    async fn list_open_change_requests(&self) -> Result<Vec<u64>>;

    /// Fetches one change request with its commits.
    ///
    /// Never returns a partially populated value: any missing field is a
    /// [`Error::Platform`].
    async fn get_change_request(&self, number: u64) -> Result<ChangeRequest>;

    /// Fetches the tip of a named branch.
    async fn get_branch_revision(&self, name: &str) -> Result<BranchRevision>;

    /// Scans comments newest first and returns the first one whose body is
    /// exactly `body`, optionally restricted to `author`.
    ///
    /// An empty `body` is rejected with [`Error::InvalidArgument`].
    async fn latest_qualifying_comment(
        &self,
        number: u64,
        author: &str,
        body: &str,
    ) -> Result<Option<TriggerComment>>;

    /// Materialises the revision's content inside `destination`.
    async fn download(&self, revision: &Revision, destination: &Path) -> Result<()>;

    /// Posts a comment on a change request.
    async fn post_comment(&self, number: u64, text: &str) -> Result<()>;

    /// Whether `login` belongs to the repository owner's organization.
    async fn is_org_member(&self, login: &str) -> Result<bool>;
}

/// Location of a hosted repository, parsed from its web URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLocation {
    /// Web URL as configured.
    pub url: String,
    /// Host name, e.g. `github.com`.
    pub domain: String,
    pub owner: String,
    pub repo: String,
}

impl RepoLocation {
    /// Parses `http(s)://<domain>/<owner>/<repo>[.git][/...]`.
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| Error::Config(format!("failed to parse url {}: {}", url, e)))?;

        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(Error::Config(format!("unsupported url scheme in {}", url)));
        }

        let domain = parsed
            .host_str()
            .ok_or_else(|| Error::Config(format!("missing host in url {}", url)))?
            .to_string();

        let mut segments = parsed
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter();

        let owner = segments
            .next()
            .ok_or_else(|| Error::Config(format!("missing owner in url {}", url)))?
            .to_string();
        let repo = segments
            .next()
            .ok_or_else(|| Error::Config(format!("missing repository in url {}", url)))?
            .trim_end_matches(".git")
            .to_string();

        if repo.is_empty() {
            return Err(Error::Config(format!("missing repository in url {}", url)));
        }

        Ok(Self {
            url: url.to_string(),
            domain,
            owner,
            repo,
        })
    }

    pub fn repo_slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    pub fn project_slug(&self) -> String {
        format!("{}/{}/{}", self.domain, self.owner, self.repo)
    }
}

/// Builds the client for a configured repository URL.
///
/// Only GitHub-style hosting is supported.
pub fn client_for(url: &str, token: Option<String>) -> Result<Arc<dyn HostingClient>> {
    let location = RepoLocation::parse(url)?;
    if !github::supports(&location) {
        return Err(Error::Config(format!(
            "hosting platform not supported: {}",
            url
        )));
    }
    Ok(Arc::new(GitHubClient::new(location, token)?))
}
