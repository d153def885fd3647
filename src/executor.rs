//! One test run of one revision, from language environment to log archive.

use std::collections::HashMap;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::archive::LogArchive;
use crate::error::{Error, Result};
use crate::hosting::HostingClient;
use crate::pipeline::{PipelineOutcome, StageSet};
use crate::revision::Revision;
use crate::stage::StageConfig;
use crate::toolchain::{LanguageEnvironment, ToolchainProvider};

const LOG_DIR_MODE: u32 = 0o755;

/// Variables every run gets on top of the daemon's own environment.
pub fn repository_env(
    process_env: impl IntoIterator<Item = (String, String)>,
    repo_slug: &str,
) -> Vec<(String, String)> {
    let defaults = [
        ("CI".to_string(), "true".to_string()),
        ("LOCALCI".to_string(), "true".to_string()),
        ("LOCALCI_REPO_SLUG".to_string(), repo_slug.to_string()),
    ];
    let process_env: Vec<_> = process_env.into_iter().collect();
    merge_env([process_env.as_slice(), defaults.as_slice()])
}

/// Flattens environment layers; a later layer overrides an earlier one while
/// keeping the first position of each key.
pub fn merge_env<'a>(
    layers: impl IntoIterator<Item = &'a [(String, String)]>,
) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (key, value) in layers.into_iter().flatten() {
        match index.get(key) {
            Some(&i) => merged[i].1 = value.clone(),
            None => {
                index.insert(key.clone(), merged.len());
                merged.push((key.clone(), value.clone()));
            }
        }
    }

    merged
}

/// Runs the fixed test sequence for one repository.
///
/// Shared behind an `Arc` by every run of the repository, serial or parallel.
pub struct TestExecutor {
    client: Arc<dyn HostingClient>,
    toolchain: Arc<dyn ToolchainProvider>,
    stages: StageSet,
    env: Vec<(String, String)>,
    log_root: PathBuf,
    tty: bool,
    command_timeout: Option<Duration>,
    post_on_success: Option<String>,
    post_on_failure: Option<String>,
    archive: Option<LogArchive>,
}

impl TestExecutor {
    /// Creates an executor with tty disabled, no comments and no archive.
    pub fn new(
        client: Arc<dyn HostingClient>,
        toolchain: Arc<dyn ToolchainProvider>,
        stages: StageSet,
        env: Vec<(String, String)>,
        log_root: PathBuf,
    ) -> Self {
        Self {
            client,
            toolchain,
            stages,
            env,
            log_root,
            tty: false,
            command_timeout: None,
            post_on_success: None,
            post_on_failure: None,
            archive: None,
        }
    }

    pub fn with_tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Comments posted on change requests; empty text disables posting.
    pub fn with_comments(mut self, on_success: Option<String>, on_failure: Option<String>) -> Self {
        self.post_on_success = on_success.filter(|text| !text.is_empty());
        self.post_on_failure = on_failure.filter(|text| !text.is_empty());
        self
    }

    pub fn with_archive(mut self, archive: Option<LogArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn client(&self) -> &Arc<dyn HostingClient> {
        &self.client
    }

    /// Tests `revision`.
    ///
    /// `Ok` carries the pipeline outcome, pass or fail. `Err` means the run
    /// never got to its stages (environment, download or log directory).
    /// The working directories are removed in every case.
    pub async fn run(&self, revision: &Revision) -> Result<PipelineOutcome> {
        let run_id = Uuid::new_v4();
        tracing::info!(
            run_id = %run_id,
            repo = %self.client.repo_slug(),
            revision = %revision.label(),
            toolchain = %self.toolchain.name(),
            "starting test run"
        );

        let mut environment = self
            .toolchain
            .generate_environment(&self.client.project_slug())?;

        let result = self.run_in(&environment, revision, run_id).await;

        if let Err(e) = environment.cleanup() {
            tracing::error!(run_id = %run_id, error = %e, "failed to remove run directories");
        }

        match &result {
            Ok(PipelineOutcome::Passed) => {
                tracing::info!(run_id = %run_id, revision = %revision.label(), "test run passed");
            }
            Ok(PipelineOutcome::Failed { stage, .. }) => {
                tracing::error!(run_id = %run_id, revision = %revision.label(), stage = %stage, "test run failed");
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, revision = %revision.label(), error = %e, "test run aborted");
            }
        }

        result
    }

    async fn run_in(
        &self,
        environment: &LanguageEnvironment,
        revision: &Revision,
        run_id: Uuid,
    ) -> Result<PipelineOutcome> {
        tracing::debug!(run_id = %run_id, dir = ?environment.working_dir(), "downloading revision");
        self.client
            .download(revision, environment.working_dir())
            .await?;

        let log_dir = self.log_root.join(revision.log_dir_name());
        reset_log_dir(&log_dir)?;

        let config = StageConfig {
            working_dir: environment.working_dir().to_path_buf(),
            env: merge_env([
                self.env.as_slice(),
                environment.env(),
                revision.env_vars().as_slice(),
            ]),
            log_dir: log_dir.clone(),
            tty: self.tty,
            command_timeout: self.command_timeout,
        };

        let outcome = self.stages.execute(&config).await;
        self.report(revision, &outcome, run_id).await;

        if let Some(archive) = &self.archive {
            if let Err(e) = archive.copy(&log_dir).await {
                tracing::error!(run_id = %run_id, error = %e, "failed to copy logs to archive");
            }
        }

        Ok(outcome)
    }

    /// Posts the configured comment; failures are only logged.
    async fn report(&self, revision: &Revision, outcome: &PipelineOutcome, run_id: Uuid) {
        let Some(number) = revision.change_request_number() else {
            return;
        };

        let text = if outcome.passed() {
            self.post_on_success.as_deref()
        } else {
            self.post_on_failure.as_deref()
        };

        let Some(text) = text else {
            return;
        };

        if let Err(e) = self.client.post_comment(number, text).await {
            tracing::warn!(run_id = %run_id, number, error = %e, "failed to post comment");
        }
    }
}

/// Removes any previous logs for the revision and recreates the directory.
fn reset_log_dir(log_dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(log_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(Error::Environment(format!(
                "failed to clear log directory {}: {}",
                log_dir.display(),
                e
            )))
        }
    }

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(LOG_DIR_MODE)
        .create(log_dir)
        .map_err(|e| {
            Error::Environment(format!(
                "failed to create log directory {}: {}",
                log_dir.display(),
                e
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosting::InMemoryHost;
    use crate::revision::{BranchRevision, ChangeRequest, ChangeState, Commit};
    use crate::toolchain::HostToolchain;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    struct Fixture {
        host: Arc<InMemoryHost>,
        runs: TempDir,
        logs: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                host: Arc::new(InMemoryHost::new("acme", "widgets")),
                runs: TempDir::new().unwrap(),
                logs: TempDir::new().unwrap(),
            }
        }

        fn executor(&self, stages: StageSet) -> TestExecutor {
            let env = repository_env(
                [("PATH".to_string(), "/usr/bin:/bin".to_string())],
                "acme/widgets",
            );
            TestExecutor::new(
                self.host.clone(),
                Arc::new(HostToolchain::new(Some(self.runs.path().to_path_buf()))),
                stages,
                env,
                self.logs.path().to_path_buf(),
            )
            .with_comments(Some("passed".to_string()), Some("failed".to_string()))
        }
    }

    fn cr(number: u64) -> Revision {
        Revision::ChangeRequest(ChangeRequest::new(
            number,
            vec![Commit::new("c1", Utc.timestamp_opt(1, 0).unwrap())],
            "alice",
            true,
            ChangeState::Open,
            "master",
        ))
    }

    fn run(commands: &[&str]) -> StageSet {
        StageSet {
            run: commands.iter().map(|c| c.to_string()).collect(),
            ..StageSet::default()
        }
    }

    #[test]
    fn merge_env_overrides_in_place() {
        let base = vec![
            ("PATH".to_string(), "/bin".to_string()),
            ("CI".to_string(), "false".to_string()),
        ];
        let extra = vec![("PATH".to_string(), "/go/bin".to_string())];

        let merged = merge_env([base.as_slice(), extra.as_slice()]);

        assert_eq!(
            merged,
            vec![
                ("PATH".to_string(), "/go/bin".to_string()),
                ("CI".to_string(), "false".to_string()),
            ]
        );
    }

    #[test]
    fn repository_env_adds_ci_markers() {
        let env = repository_env([("CI".to_string(), "0".to_string())], "acme/widgets");

        assert!(env.contains(&("CI".to_string(), "true".to_string())));
        assert!(env.contains(&("LOCALCI".to_string(), "true".to_string())));
        assert!(env.contains(&("LOCALCI_REPO_SLUG".to_string(), "acme/widgets".to_string())));
    }

    #[tokio::test]
    async fn passing_run_posts_success_comment() {
        let fixture = Fixture::new();
        let executor = fixture.executor(run(&["cat REVISION", "echo $LOCALCI_PR_NUMBER $LOCALCI_REPO_SLUG"]));

        let outcome = executor.run(&cr(7)).await.unwrap();

        assert!(outcome.passed());
        assert_eq!(fixture.host.posted_comments(), vec![(7, "passed".to_string())]);
        let log = std::fs::read_to_string(fixture.logs.path().join("7").join("run")).unwrap();
        assert_eq!(log, "c1\n7 acme/widgets\n");
    }

    #[tokio::test]
    async fn failing_run_posts_failure_comment() {
        let fixture = Fixture::new();
        let executor = fixture.executor(run(&["exit 2"]));

        let outcome = executor.run(&cr(7)).await.unwrap();

        assert!(!outcome.passed());
        assert_eq!(fixture.host.posted_comments(), vec![(7, "failed".to_string())]);
    }

    #[tokio::test]
    async fn branches_never_get_comments() {
        let fixture = Fixture::new();
        let executor = fixture.executor(run(&["echo $LOCALCI_BRANCH_NAME"]));
        let branch = Revision::Branch(BranchRevision::new(
            "main",
            Commit::new("abc", Utc.timestamp_opt(1, 0).unwrap()),
        ));

        assert!(executor.run(&branch).await.unwrap().passed());

        assert!(fixture.host.posted_comments().is_empty());
        let log = std::fs::read_to_string(fixture.logs.path().join("abc").join("run")).unwrap();
        assert_eq!(log, "main\n");
    }

    #[tokio::test]
    async fn previous_logs_are_cleared() {
        let fixture = Fixture::new();
        let stale = fixture.logs.path().join("7");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("old"), "stale").unwrap();

        fixture.executor(run(&["true"])).run(&cr(7)).await.unwrap();

        assert!(!stale.join("old").exists());
        assert!(stale.join("run").exists());
    }

    #[tokio::test]
    async fn run_directories_are_removed() {
        let fixture = Fixture::new();

        fixture.executor(run(&["exit 1"])).run(&cr(7)).await.unwrap();

        assert_eq!(std::fs::read_dir(fixture.runs.path()).unwrap().count(), 0);
    }
}
