//! In-memory hosting backend.
//!
//! Holds branches, change requests, comments and organization members in a
//! `Mutex`-guarded map so monitors can be driven without a network. Posted
//! comments and downloads are recorded for inspection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::revision::{BranchRevision, ChangeRequest, Revision, TriggerComment};

use super::{HostingClient, RepoLocation};

#[derive(Debug, Default)]
struct HostState {
    branches: HashMap<String, BranchRevision>,
    change_requests: BTreeMap<u64, ChangeRequest>,
    comments: HashMap<u64, Vec<TriggerComment>>,
    org_members: HashSet<String>,
    posted: Vec<(u64, String)>,
    downloads: Vec<String>,
    fail_listing: bool,
    fail_membership: bool,
    fail_branches: bool,
    fail_downloads: bool,
    fail_comments: bool,
}

/// In-memory [`HostingClient`].
#[derive(Debug)]
pub struct InMemoryHost {
    location: RepoLocation,
    state: Mutex<HostState>,
}

impl InMemoryHost {
    pub fn new(owner: &str, repo: &str) -> Self {
        Self {
            location: RepoLocation {
                url: format!("https://example.test/{}/{}", owner, repo),
                domain: "example.test".to_string(),
                owner: owner.to_string(),
                repo: repo.to_string(),
            },
            state: Mutex::new(HostState::default()),
        }
    }

    /// Locks the state, ignoring poisoning.
    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets or replaces a branch tip.
    pub fn set_branch(&self, branch: BranchRevision) {
        let mut state = self.state();
        state.branches.insert(branch.name().to_string(), branch);
    }

    /// Opens or replaces a change request.
    pub fn set_change_request(&self, cr: ChangeRequest) {
        let mut state = self.state();
        state.change_requests.insert(cr.number(), cr);
    }

    /// Removes a change request from the platform entirely.
    pub fn remove_change_request(&self, number: u64) {
        let mut state = self.state();
        state.change_requests.remove(&number);
    }

    /// Appends a comment; comments are kept oldest first.
    pub fn add_comment(&self, number: u64, comment: TriggerComment) {
        let mut state = self.state();
        state.comments.entry(number).or_default().push(comment);
    }

    pub fn add_org_member(&self, login: &str) {
        let mut state = self.state();
        state.org_members.insert(login.to_string());
    }

    /// Makes `list_open_change_requests` fail until reset.
    pub fn fail_listing(&self, fail: bool) {
        self.state().fail_listing = fail;
    }

    /// Makes `is_org_member` fail until reset.
    pub fn fail_membership_checks(&self, fail: bool) {
        self.state().fail_membership = fail;
    }

    /// Makes `get_branch_revision` fail until reset.
    pub fn fail_branch(&self, fail: bool) {
        self.state().fail_branches = fail;
    }

    /// Makes `download` fail until reset.
    pub fn fail_download(&self, fail: bool) {
        self.state().fail_downloads = fail;
    }

    /// Makes `post_comment` fail until reset.
    pub fn fail_comments(&self, fail: bool) {
        self.state().fail_comments = fail;
    }

    /// Comments posted so far, as `(number, text)`.
    pub fn posted_comments(&self) -> Vec<(u64, String)> {
        self.state().posted.clone()
    }

    /// Identities downloaded so far, in order.
    pub fn downloads(&self) -> Vec<String> {
        self.state().downloads.clone()
    }
}

#[async_trait]
impl HostingClient for InMemoryHost {
    fn repo_slug(&self) -> String {
        self.location.repo_slug()
    }

    fn project_slug(&self) -> String {
        self.location.project_slug()
    }

    async fn list_open_change_requests(&self) -> Result<Vec<u64>> {
        let state = self.state();
        if state.fail_listing {
            return Err(Error::Platform("listing unavailable".to_string()));
        }
        Ok(state.change_requests.keys().copied().collect())
    }

    async fn get_change_request(&self, number: u64) -> Result<ChangeRequest> {
        let state = self.state();
        state
            .change_requests
            .get(&number)
            .cloned()
            .ok_or_else(|| Error::Platform(format!("pull request {} not found", number)))
    }

    async fn get_branch_revision(&self, name: &str) -> Result<BranchRevision> {
        let state = self.state();
        if state.fail_branches {
            return Err(Error::Platform("branch lookup unavailable".to_string()));
        }
        state
            .branches
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Platform(format!("branch {} not found", name)))
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

        let state = self.state();
        let found = state.comments.get(&number).and_then(|comments| {
            comments
                .iter()
                .rev()
                .find(|c| (author.is_empty() || c.author == author) && c.body == body)
                .cloned()
        });
        Ok(found)
    }

    async fn download(&self, revision: &Revision, destination: &Path) -> Result<()> {
        if self.state().fail_downloads {
            return Err(Error::Git(format!("failed to fetch {}", revision.id())));
        }

        std::fs::create_dir_all(destination)?;
        let hashes: Vec<&str> = revision.commits().iter().map(|c| c.hash.as_str()).collect();
        std::fs::write(destination.join("REVISION"), format!("{}\n", hashes.join("\n")))?;

        self.state().downloads.push(revision.id());
        Ok(())
    }

    async fn post_comment(&self, number: u64, text: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_comments {
            return Err(Error::Platform("comment posting unavailable".to_string()));
        }
        state.posted.push((number, text.to_string()));
        Ok(())
    }

    async fn is_org_member(&self, login: &str) -> Result<bool> {
        let state = self.state();
        if state.fail_membership {
            return Err(Error::Platform("membership lookup unavailable".to_string()));
        }
        Ok(state.org_members.contains(login))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::{ChangeState, Commit};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn comment(author: &str, body: &str, secs: i64) -> TriggerComment {
        TriggerComment {
            author: author.to_string(),
            body: body.to_string(),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn lists_open_change_requests_in_order() {
        let host = InMemoryHost::new("acme", "widgets");
        for number in [9, 3] {
            host.set_change_request(ChangeRequest::new(
                number,
                vec![],
                "alice",
                true,
                ChangeState::Open,
                "master",
            ));
        }

        assert_eq!(host.list_open_change_requests().await.unwrap(), vec![3, 9]);
    }

    #[tokio::test]
    async fn newest_matching_comment_wins() {
        let host = InMemoryHost::new("acme", "widgets");
        host.add_comment(1, comment("alice", "retest", 10));
        host.add_comment(1, comment("bob", "retest", 20));
        host.add_comment(1, comment("bob", "nice", 30));

        let any = host.latest_qualifying_comment(1, "", "retest").await.unwrap();
        let alice = host.latest_qualifying_comment(1, "alice", "retest").await.unwrap();

        assert_eq!(any.unwrap().created_at.timestamp(), 20);
        assert_eq!(alice.unwrap().created_at.timestamp(), 10);
    }

    #[test]
    fn failure_switches_toggle_platform_errors() {
        let host = InMemoryHost::new("acme", "widgets");
        host.add_org_member("alice");

        host.fail_listing(true);
        host.fail_membership_checks(true);
        tokio_test::assert_err!(tokio_test::block_on(host.list_open_change_requests()));
        tokio_test::assert_err!(tokio_test::block_on(host.is_org_member("alice")));

        host.fail_listing(false);
        host.fail_membership_checks(false);
        tokio_test::assert_ok!(tokio_test::block_on(host.list_open_change_requests()));
        assert!(tokio_test::block_on(host.is_org_member("alice")).unwrap());
    }

    #[tokio::test]
    async fn failing_branch_download_and_comment_switches() {
        let host = InMemoryHost::new("acme", "widgets");
        let dir = TempDir::new().unwrap();
        let revision = Revision::Branch(BranchRevision::new(
            "main",
            Commit::new("c1", Utc.timestamp_opt(1, 0).unwrap()),
        ));
        host.set_branch(BranchRevision::new(
            "main",
            Commit::new("c1", Utc.timestamp_opt(1, 0).unwrap()),
        ));

        host.fail_branch(true);
        host.fail_download(true);
        host.fail_comments(true);
        assert!(matches!(
            host.get_branch_revision("main").await,
            Err(Error::Platform(_))
        ));
        assert!(matches!(
            host.download(&revision, dir.path()).await,
            Err(Error::Git(_))
        ));
        assert!(host.post_comment(7, "passed").await.is_err());
        assert!(host.downloads().is_empty());
        assert!(host.posted_comments().is_empty());

        host.fail_branch(false);
        host.fail_download(false);
        host.fail_comments(false);
        assert!(host.get_branch_revision("main").await.is_ok());
        assert!(host.download(&revision, dir.path()).await.is_ok());
        assert!(host.post_comment(7, "passed").await.is_ok());
        assert_eq!(host.posted_comments(), vec![(7, "passed".to_string())]);
    }

    #[test]
    fn poisoned_state_stays_readable() {
        let host = std::sync::Arc::new(InMemoryHost::new("acme", "widgets"));
        host.add_org_member("alice");

        let poisoner = std::sync::Arc::clone(&host);
        let joined = std::thread::spawn(move || {
            let _state = poisoner.state.lock().unwrap();
            panic!("poison the host state");
        })
        .join();
        assert!(joined.is_err());
        assert!(host.state.is_poisoned());

        host.add_org_member("bob");
        assert!(tokio_test::block_on(host.is_org_member("bob")).unwrap());
    }

    #[tokio::test]
    async fn empty_body_is_rejected() {
        let host = InMemoryHost::new("acme", "widgets");

        let err = host.latest_qualifying_comment(1, "", "").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn download_writes_revision_marker() {
        let host = InMemoryHost::new("acme", "widgets");
        let dir = TempDir::new().unwrap();
        let revision = Revision::Branch(BranchRevision::new(
            "main",
            Commit::new("c1", Utc.timestamp_opt(1, 0).unwrap()),
        ));

        host.download(&revision, dir.path()).await.unwrap();

        let marker = std::fs::read_to_string(dir.path().join("REVISION")).unwrap();
        assert_eq!(marker, "c1\n");
        assert_eq!(host.downloads(), vec!["main".to_string()]);
    }
}
