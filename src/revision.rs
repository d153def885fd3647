//! Revisions under test: a trunk branch tip or an open change request.
//!
//! A [`Revision`] is rebuilt from live platform queries every poll cycle. Its
//! commit set never changes after construction; new commits on the platform
//! always produce a new value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A commit that is part of the content under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Commit hash.
    pub hash: String,
    /// Committer timestamp.
    pub timestamp: DateTime<Utc>,
}

impl Commit {
    pub fn new(hash: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            hash: hash.into(),
            timestamp,
        }
    }
}

/// The most recent comment matching the configured trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerComment {
    /// Login of the comment author.
    pub author: String,
    /// Comment body.
    pub body: String,
    /// When the comment was created.
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of a change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeState {
    Open,
    Closed,
}

/// Tip of a named branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRevision {
    name: String,
    commits: Vec<Commit>,
}

impl BranchRevision {
    /// Creates a branch revision whose content is the given tip commit.
    pub fn new(name: impl Into<String>, tip: Commit) -> Self {
        Self {
            name: name.into(),
            commits: vec![tip],
        }
    }

    /// Branch name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tip commit.
    pub fn tip(&self) -> &Commit {
        // Constructed with exactly one commit.
        &self.commits[0]
    }
}

/// A numbered proposal to merge commits into a target branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRequest {
    number: u64,
    commits: Vec<Commit>,
    author: String,
    mergeable: bool,
    state: ChangeState,
    target_branch: String,
    trigger: Option<TriggerComment>,
}

impl ChangeRequest {
    /// Creates a change request. Commits are ordered oldest first.
    pub fn new(
        number: u64,
        commits: Vec<Commit>,
        author: impl Into<String>,
        mergeable: bool,
        state: ChangeState,
        target_branch: impl Into<String>,
    ) -> Self {
        Self {
            number,
            commits,
            author: author.into(),
            mergeable,
            state,
            target_branch: target_branch.into(),
            trigger: None,
        }
    }

    /// Returns a copy carrying the given trigger comment.
    pub fn with_trigger(mut self, trigger: Option<TriggerComment>) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn mergeable(&self) -> bool {
        self.mergeable
    }

    pub fn state(&self) -> ChangeState {
        self.state
    }

    /// Branch the change request wants to merge into.
    pub fn target_branch(&self) -> &str {
        &self.target_branch
    }

    pub fn trigger(&self) -> Option<&TriggerComment> {
        self.trigger.as_ref()
    }

    /// Most recent commit, if any.
    pub fn latest_commit(&self) -> Option<&Commit> {
        self.commits.last()
    }
}

/// A unit of source content to be tested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revision {
    Branch(BranchRevision),
    ChangeRequest(ChangeRequest),
}

impl Revision {
    /// Identity within the repository: branch name or change-request number.
    pub fn id(&self) -> String {
        match self {
            Revision::Branch(branch) => branch.name.clone(),
            Revision::ChangeRequest(cr) => cr.number.to_string(),
        }
    }

    /// Commits under test, most recent last.
    pub fn commits(&self) -> &[Commit] {
        match self {
            Revision::Branch(branch) => &branch.commits,
            Revision::ChangeRequest(cr) => &cr.commits,
        }
    }

    /// Returns true when both revisions carry the same commit hash sequence.
    pub fn same_content(&self, other: &Revision) -> bool {
        let ours = self.commits();
        let theirs = other.commits();
        ours.len() == theirs.len() && ours.iter().zip(theirs).all(|(a, b)| a.hash == b.hash)
    }

    /// Change-request number, if this is a change request.
    pub fn change_request_number(&self) -> Option<u64> {
        match self {
            Revision::Branch(_) => None,
            Revision::ChangeRequest(cr) => Some(cr.number),
        }
    }

    /// Name of the per-revision log directory.
    pub fn log_dir_name(&self) -> String {
        match self {
            Revision::Branch(branch) => branch.tip().hash.clone(),
            Revision::ChangeRequest(cr) => cr.number.to_string(),
        }
    }

    /// Environment variables identifying this revision to stage commands.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        match self {
            Revision::Branch(branch) => {
                vec![("LOCALCI_BRANCH_NAME".to_string(), branch.name.clone())]
            }
            Revision::ChangeRequest(cr) => {
                vec![("LOCALCI_PR_NUMBER".to_string(), cr.number.to_string())]
            }
        }
    }

    /// Short human label for logs.
    pub fn label(&self) -> String {
        match self {
            Revision::Branch(branch) => format!("branch {}", branch.name),
            Revision::ChangeRequest(cr) => format!("change request #{}", cr.number),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn change_request(number: u64, hashes: &[&str]) -> Revision {
        let commits = hashes.iter().map(|h| Commit::new(*h, at(100))).collect();
        Revision::ChangeRequest(ChangeRequest::new(
            number,
            commits,
            "alice",
            true,
            ChangeState::Open,
            "master",
        ))
    }

    #[test]
    fn identity_is_number_or_branch_name() {
        let cr = change_request(7, &["c1"]);
        let branch = Revision::Branch(BranchRevision::new("main", Commit::new("c1", at(1))));

        assert_eq!(cr.id(), "7");
        assert_eq!(branch.id(), "main");
    }

    #[test]
    fn same_hashes_are_same_content() {
        let a = change_request(7, &["c1", "c2"]);
        let b = change_request(7, &["c1", "c2"]);

        assert!(a.same_content(&b));
    }

    #[test]
    fn new_commit_changes_content() {
        let a = change_request(7, &["c1"]);
        let b = change_request(7, &["c1", "c2"]);
        let c = change_request(7, &["c3"]);

        assert!(!a.same_content(&b));
        assert!(!a.same_content(&c));
    }

    #[test]
    fn content_ignores_timestamps() {
        let a = Revision::Branch(BranchRevision::new("main", Commit::new("c1", at(1))));
        let b = Revision::Branch(BranchRevision::new("main", Commit::new("c1", at(99))));

        assert!(a.same_content(&b));
    }

    #[test]
    fn empty_commit_sets_are_equal() {
        let a = change_request(3, &[]);
        let b = change_request(3, &[]);

        assert!(a.same_content(&b));
    }

    #[test]
    fn log_dir_uses_tip_hash_for_branches() {
        let branch = Revision::Branch(BranchRevision::new("main", Commit::new("abc123", at(1))));

        assert_eq!(branch.log_dir_name(), "abc123");
        assert_eq!(change_request(12, &["x"]).log_dir_name(), "12");
    }

    #[test]
    fn env_vars_identify_revision() {
        let branch = Revision::Branch(BranchRevision::new("main", Commit::new("c1", at(1))));

        assert_eq!(
            branch.env_vars(),
            vec![("LOCALCI_BRANCH_NAME".to_string(), "main".to_string())]
        );
        assert_eq!(
            change_request(9, &["a"]).env_vars(),
            vec![("LOCALCI_PR_NUMBER".to_string(), "9".to_string())]
        );
    }

    #[test]
    fn change_state_serializes_to_lowercase() {
        assert_eq!(serde_json::to_string(&ChangeState::Open).unwrap(), "\"open\"");
        assert_eq!(
            serde_json::to_string(&ChangeState::Closed).unwrap(),
            "\"closed\""
        );
    }
}
