//! GitHub REST implementation of [`HostingClient`].

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::revision::{BranchRevision, ChangeRequest, ChangeState, Commit, Revision, TriggerComment};

use super::git;
use super::{HostingClient, RepoLocation};

const GITHUB_DOMAIN: &str = "github.com";
const DEFAULT_API_BASE: &str = "https://api.github.com";
const TIMEOUT_SHORT_REQUEST: Duration = Duration::from_secs(60);
const TIMEOUT_LONG_REQUEST: Duration = Duration::from_secs(120);
const PER_PAGE: usize = 100;
const MAX_PAGES: usize = 50;

/// Returns true if the location is hosted on GitHub.
pub fn supports(location: &RepoLocation) -> bool {
    location.domain == GITHUB_DOMAIN
}

#[derive(Debug, Deserialize)]
struct User {
    login: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    #[serde(rename = "ref")]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullSummary {
    number: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PullDetail {
    user: Option<User>,
    mergeable: Option<bool>,
    state: Option<String>,
    base: Option<GitRef>,
}

#[derive(Debug, Deserialize)]
struct Signature {
    date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CommitBody {
    committer: Option<Signature>,
}

#[derive(Debug, Deserialize)]
struct RepoCommit {
    sha: Option<String>,
    commit: Option<CommitBody>,
}

#[derive(Debug, Deserialize)]
struct BranchResponse {
    commit: Option<RepoCommit>,
}

#[derive(Debug, Deserialize)]
struct IssueComment {
    user: Option<User>,
    body: Option<String>,
    created_at: Option<DateTime<Utc>>,
}

impl RepoCommit {
    fn into_commit(self, context: &str) -> Result<Commit> {
        let hash = self
            .sha
            .ok_or_else(|| Error::Platform(format!("missing commit sha in {}", context)))?;
        let timestamp = self
            .commit
            .and_then(|c| c.committer)
            .and_then(|c| c.date)
            .ok_or_else(|| Error::Platform(format!("missing commit time in {}", context)))?;
        Ok(Commit::new(hash, timestamp))
    }
}

/// Client for a single repository on GitHub.
pub struct GitHubClient {
    location: RepoLocation,
    api_base: String,
    http: reqwest::Client,
}

impl GitHubClient {
    /// Creates a client authenticated with `token` when one is given.
    pub fn new(location: RepoLocation, token: Option<String>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("localci"));

        if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
            let mut value = HeaderValue::from_str(&format!("token {}", token.trim()))
                .map_err(|e| Error::Config(format!("invalid access token: {}", e)))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            location,
            api_base: DEFAULT_API_BASE.to_string(),
            http,
        })
    }

    /// Points the client at a different API root (GitHub Enterprise, tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn location(&self) -> &RepoLocation {
        &self.location
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_base, self.location.owner, self.location.repo, path
        )
    }

    /// `branches/<name>`, escaping each path segment of the name.
    fn branch_url(&self, name: &str) -> Result<String> {
        let base = self.repo_url("branches");
        let mut url = reqwest::Url::parse(&base)
            .map_err(|e| Error::Config(format!("invalid API url {}: {}", base, e)))?;
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("invalid API url {}", base)))?
            .extend(name.split('/'));
        Ok(url.to_string())
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, timeout: Duration) -> Result<T> {
        let response = self.http.get(url).timeout(timeout).send().await?;
        let response = check_status(response, url).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| Error::Platform(format!("failed to parse response from {}: {}", url, e)))
    }

    async fn get_all_pages<T: DeserializeOwned>(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();

        for page in 1..=MAX_PAGES {
            let separator = if url.contains('?') { '&' } else { '?' };
            let paged = format!("{}{}per_page={}&page={}", url, separator, PER_PAGE, page);
            let batch: Vec<T> = self.get_json(&paged, timeout).await?;
            let done = batch.len() < PER_PAGE;
            items.extend(batch);
            if done {
                return Ok(items);
            }
        }

        // Never hand back a truncated list.
        Err(Error::Platform(format!(
            "{} returned more than {} pages of results",
            url, MAX_PAGES
        )))
    }
}

async fn check_status(response: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::Platform(format!(
        "request to {} failed with {}: {}",
        url,
        status,
        body.trim()
    )))
}

#[async_trait]
impl HostingClient for GitHubClient {
    fn repo_slug(&self) -> String {
        self.location.repo_slug()
    }

    fn project_slug(&self) -> String {
        self.location.project_slug()
    }

    async fn list_open_change_requests(&self) -> Result<Vec<u64>> {
        let pulls: Vec<PullSummary> = self
            .get_all_pages(&self.repo_url("pulls?state=open"), TIMEOUT_SHORT_REQUEST)
            .await?;

        Ok(pulls.into_iter().filter_map(|p| p.number).collect())
    }

    async fn get_change_request(&self, number: u64) -> Result<ChangeRequest> {
        let detail: PullDetail = self
            .get_json(&self.repo_url(&format!("pulls/{}", number)), TIMEOUT_SHORT_REQUEST)
            .await?;

        let author = detail
            .user
            .and_then(|u| u.login)
            .ok_or_else(|| {
                Error::Platform(format!("failed to get the author of pull request {}", number))
            })?;

        // GitHub computes mergeability lazily; unknown is treated as mergeable.
        let mergeable = detail.mergeable.unwrap_or(true);

        let state = match detail.state.as_deref() {
            Some("open") => ChangeState::Open,
            Some("closed") => ChangeState::Closed,
            other => {
                return Err(Error::Platform(format!(
                    "unexpected state {:?} for pull request {}",
                    other, number
                )))
            }
        };

        let target_branch = detail.base.and_then(|b| b.name).ok_or_else(|| {
            Error::Platform(format!("failed to get the target branch of pull request {}", number))
        })?;

        let context = format!("pull request {}", number);
        let commits: Vec<RepoCommit> = self
            .get_all_pages(
                &self.repo_url(&format!("pulls/{}/commits", number)),
                TIMEOUT_SHORT_REQUEST,
            )
            .await?;
        let commits = commits
            .into_iter()
            .map(|c| c.into_commit(&context))
            .collect::<Result<Vec<_>>>()?;

        Ok(ChangeRequest::new(
            number,
            commits,
            author,
            mergeable,
            state,
            target_branch,
        ))
    }

    async fn get_branch_revision(&self, name: &str) -> Result<BranchRevision> {
        let branch: BranchResponse = self
            .get_json(&self.branch_url(name)?, TIMEOUT_SHORT_REQUEST)
            .await?;

        let tip = branch
            .commit
            .ok_or_else(|| Error::Platform(format!("failed to get commit of branch {}", name)))?
            .into_commit(&format!("branch {}", name))?;

        Ok(BranchRevision::new(name, tip))
    }

    async fn latest_qualifying_comment(
        &self,
        number: u64,
        author: &str,
        body: &str,
    ) -> Result<Option<TriggerComment>> {
        if body.is_empty() {
            return Err(Error::InvalidArgument(
                "comment body cannot be an empty string".to_string(),
            ));
        }

        let comments: Vec<IssueComment> = self
            .get_all_pages(
                &self.repo_url(&format!("issues/{}/comments", number)),
                TIMEOUT_LONG_REQUEST,
            )
            .await?;

        Ok(pick_latest_comment(comments, author, body))
    }

    async fn download(&self, revision: &Revision, destination: &Path) -> Result<()> {
        match revision {
            Revision::Branch(branch) => {
                git::download_branch(&self.location.url, branch.name(), destination).await
            }
            Revision::ChangeRequest(cr) => {
                git::download_change_request(&self.location.url, cr.number(), destination).await
            }
        }
    }

    async fn post_comment(&self, number: u64, text: &str) -> Result<()> {
        let url = self.repo_url(&format!("issues/{}/comments", number));
        let response = self
            .http
            .post(&url)
            .timeout(TIMEOUT_LONG_REQUEST)
            .json(&serde_json::json!({ "body": text }))
            .send()
            .await?;
        check_status(response, &url).await?;
        Ok(())
    }

    async fn is_org_member(&self, login: &str) -> Result<bool> {
        let url = format!(
            "{}/orgs/{}/members/{}",
            self.api_base, self.location.owner, login
        );
        let response = self
            .http
            .get(&url)
            .timeout(TIMEOUT_SHORT_REQUEST)
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => check_status(response, &url).await.map(|_| false),
        }
    }
}

/// Walks comments newest first, returning the first exact body match.
fn pick_latest_comment(
    comments: Vec<IssueComment>,
    author: &str,
    body: &str,
) -> Option<TriggerComment> {
    comments.into_iter().rev().find_map(|comment| {
        let login = comment.user.and_then(|u| u.login);
        if !author.is_empty() && login.as_deref() != Some(author) {
            return None;
        }
        let created_at = comment.created_at?;
        if comment.body.as_deref() != Some(body) {
            return None;
        }
        Some(TriggerComment {
            author: login.unwrap_or_default(),
            body: body.to_string(),
            created_at,
        })
    })
}
