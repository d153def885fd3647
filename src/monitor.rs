//! Repository monitor: the poll loop that discovers, filters and schedules
//! revisions for one repository.
//!
//! Each cycle fetches the trunk branch and the watched change requests,
//! drops everything whose content was already submitted or whose previous
//! run is still going, checks eligibility and hands the rest to the
//! [`TestExecutor`]. Serial repositories share one lock across all their
//! runs; parallel repositories spawn one task per run and do not wait.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::RepoConfig;
use crate::eligibility::{self, Eligibility, EligibilityPolicy, IneligibleReason, Whitelist};
use crate::error::{Error, Result};
use crate::executor::{repository_env, TestExecutor};
use crate::hosting::{self, HostingClient};
use crate::pipeline::PipelineOutcome;
use crate::revision::Revision;
use crate::tested::{ScheduleDecision, TestedSet};
use crate::toolchain::ToolchainCache;

/// Comment required on a change request before it is tested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentTrigger {
    /// Required author; any author when empty.
    pub author: String,
    pub body: String,
}

/// Scheduling settings for one repository.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub trunk_branch: String,
    /// Watch only this change request instead of the open set.
    pub change_request: Option<u64>,
    pub poll_interval: Duration,
    pub whitelist: Whitelist,
    pub trigger: Option<CommentTrigger>,
    /// Run each test on its own task instead of under the serial lock.
    pub parallel: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            trunk_branch: "master".to_string(),
            change_request: None,
            poll_interval: Duration::from_secs(30),
            whitelist: Whitelist::Anyone,
            trigger: None,
            parallel: false,
        }
    }
}

impl MonitorSettings {
    fn policy(&self) -> EligibilityPolicy {
        EligibilityPolicy {
            trigger_required: self.trigger.is_some(),
            whitelist: self.whitelist.clone(),
        }
    }
}

/// What one poll cycle did, per revision identity.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Serial runs that reached their stages, with whether they passed.
    pub completed: Vec<(String, bool)>,
    /// Parallel runs spawned this cycle.
    pub launched: Vec<(String, JoinHandle<()>)>,
    pub already_tested: Vec<String>,
    pub in_flight: Vec<String>,
    pub ineligible: Vec<(String, IneligibleReason)>,
    /// Revisions skipped because of a platform or environment error.
    pub errors: Vec<(String, String)>,
    /// Whether the open change-request set could be listed.
    pub listing_failed: bool,
}

impl CycleReport {
    /// Identities that were handed to the executor this cycle.
    pub fn scheduled(&self) -> Vec<String> {
        self.completed
            .iter()
            .map(|(id, _)| id.clone())
            .chain(self.launched.iter().map(|(id, _)| id.clone()))
            .collect()
    }

    /// Waits for every parallel run spawned this cycle.
    pub async fn join_launched(&mut self) {
        for (id, handle) in self.launched.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(revision = %id, error = %e, "test task panicked");
            }
        }
    }
}

/// Poll loop for one repository.
pub struct RepositoryMonitor {
    client: Arc<dyn HostingClient>,
    executor: Arc<TestExecutor>,
    settings: MonitorSettings,
    serial_lock: Arc<Mutex<()>>,
    tested: TestedSet,
}

impl RepositoryMonitor {
    pub fn new(executor: TestExecutor, settings: MonitorSettings) -> Self {
        Self {
            client: Arc::clone(executor.client()),
            executor: Arc::new(executor),
            settings,
            serial_lock: Arc::new(Mutex::new(())),
            tested: TestedSet::new(),
        }
    }

    /// Builds the monitor for a configured repository, installing its
    /// toolchain and creating its log directory.
    pub async fn from_config(
        repo: &RepoConfig,
        parallel_default: bool,
        toolchains: &ToolchainCache,
    ) -> Result<Self> {
        let client = hosting::client_for(&repo.url, repo.token.clone())?;
        Self::with_client(client, repo, parallel_default, toolchains).await
    }

    /// Like [`from_config`](Self::from_config) with an explicit hosting client.
    pub async fn with_client(
        client: Arc<dyn HostingClient>,
        repo: &RepoConfig,
        parallel_default: bool,
        toolchains: &ToolchainCache,
    ) -> Result<Self> {
        let toolchain = toolchains.setup(&repo.language()?).await?;

        std::fs::create_dir_all(&repo.log_dir).map_err(|e| {
            Error::Environment(format!(
                "failed to create log directory {}: {}",
                repo.log_dir.display(),
                e
            ))
        })?;

        let env = repository_env(std::env::vars(), &client.repo_slug());
        let executor = TestExecutor::new(client, toolchain, repo.stages(), env, repo.log_dir.clone())
            .with_tty(repo.tty)
            .with_command_timeout(repo.command_timeout)
            .with_comments(repo.post_on_success.clone(), repo.post_on_failure.clone())
            .with_archive(repo.log_archive());

        let settings = MonitorSettings {
            trunk_branch: repo.trunk_branch.clone(),
            change_request: repo.change_request(),
            poll_interval: repo.poll_interval,
            whitelist: repo.whitelist()?,
            trigger: repo.comment_trigger.as_ref().map(|t| CommentTrigger {
                author: t.user.clone(),
                body: t.comment.clone(),
            }),
            parallel: repo.parallel(parallel_default),
        };

        Ok(Self::new(executor, settings))
    }

    /// Shares `lock` as the serial-mode lock.
    pub fn with_serial_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.serial_lock = lock;
        self
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn tested(&self) -> &TestedSet {
        &self.tested
    }

    /// Polls forever.
    pub async fn run(mut self) {
        tracing::info!(
            repo = %self.client.repo_slug(),
            interval = ?self.settings.poll_interval,
            parallel = self.settings.parallel,
            "monitoring repository"
        );

        loop {
            let report = self.poll_once().await;
            tracing::debug!(
                repo = %self.client.repo_slug(),
                scheduled = ?report.scheduled(),
                skipped = report.already_tested.len() + report.in_flight.len() + report.ineligible.len(),
                errors = report.errors.len(),
                "poll cycle finished"
            );
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Runs one discovery and scheduling cycle.
    pub async fn poll_once(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        let revisions = self.discover(&mut report).await;

        for revision in revisions {
            self.schedule(revision, &mut report).await;
        }

        report
    }

    /// Fetches, checks and tests one change request, always serially.
    ///
    /// Fails if the change request is ineligible, cannot be prepared, or
    /// any main stage fails.
    pub async fn test_single(&self, number: u64) -> Result<()> {
        let revision = self.fetch_change_request(number).await?;

        if let Eligibility::Ineligible(reason) =
            eligibility::check(&revision, &self.settings.policy(), self.client.as_ref()).await?
        {
            return Err(Error::Ineligible {
                id: revision.id(),
                reason,
            });
        }

        let _lock = self.serial_lock.lock().await;
        match self.executor.run(&revision).await? {
            PipelineOutcome::Passed => Ok(()),
            PipelineOutcome::Failed { error, .. } => Err(error),
        }
    }

    async fn discover(&mut self, report: &mut CycleReport) -> Vec<Revision> {
        let mut revisions = Vec::new();
        let trunk = &self.settings.trunk_branch;

        match self.client.get_branch_revision(trunk).await {
            Ok(branch) => revisions.push(Revision::Branch(branch)),
            Err(e) => {
                tracing::warn!(repo = %self.client.repo_slug(), branch = %trunk, error = %e, "failed to fetch trunk branch");
                report.errors.push((trunk.clone(), e.to_string()));
            }
        }

        let numbers = match self.settings.change_request {
            Some(number) => vec![number],
            None => match self.client.list_open_change_requests().await {
                Ok(numbers) => {
                    let mut live: HashSet<String> =
                        numbers.iter().map(|n| n.to_string()).collect();
                    live.insert(trunk.clone());
                    self.tested.retain_live(&live);
                    numbers
                }
                Err(e) => {
                    tracing::error!(repo = %self.client.repo_slug(), error = %e, "failed to list open change requests");
                    report.listing_failed = true;
                    Vec::new()
                }
            },
        };

        for number in numbers {
            match self.fetch_change_request(number).await {
                Ok(revision) => revisions.push(revision),
                Err(e) => {
                    tracing::warn!(repo = %self.client.repo_slug(), number, error = %e, "failed to fetch change request");
                    report.errors.push((number.to_string(), e.to_string()));
                }
            }
        }

        revisions
    }

    /// Fetches a change request together with its trigger comment.
    async fn fetch_change_request(&self, number: u64) -> Result<Revision> {
        let cr = self.client.get_change_request(number).await?;

        let trigger = match &self.settings.trigger {
            Some(trigger) => {
                self.client
                    .latest_qualifying_comment(number, &trigger.author, &trigger.body)
                    .await?
            }
            None => None,
        };

        Ok(Revision::ChangeRequest(cr.with_trigger(trigger)))
    }

    async fn schedule(&mut self, revision: Revision, report: &mut CycleReport) {
        let id = revision.id();

        match self.tested.decide(&revision) {
            ScheduleDecision::AlreadyTested => {
                tracing::debug!(revision = %revision.label(), "already tested");
                report.already_tested.push(id);
                return;
            }
            ScheduleDecision::InFlight => {
                tracing::debug!(revision = %revision.label(), "previous run still in progress");
                report.in_flight.push(id);
                return;
            }
            ScheduleDecision::Run => {}
        }

        match eligibility::check(&revision, &self.settings.policy(), self.client.as_ref()).await {
            Ok(Eligibility::Eligible) => {}
            Ok(Eligibility::Ineligible(reason)) => {
                tracing::debug!(revision = %revision.label(), reason = %reason, "cannot be tested");
                report.ineligible.push((id, reason));
                return;
            }
            Err(e) => {
                tracing::warn!(revision = %revision.label(), error = %e, "eligibility check failed");
                report.errors.push((id, e.to_string()));
                return;
            }
        }

        if self.settings.parallel {
            self.launch(revision, report);
        } else {
            self.run_serial(revision, report).await;
        }
    }

    async fn run_serial(&mut self, revision: Revision, report: &mut CycleReport) {
        let id = revision.id();
        let guard = self.tested.record(revision.clone());

        let result = {
            let _lock = self.serial_lock.lock().await;
            self.executor.run(&revision).await
        };
        drop(guard);

        match result {
            Ok(outcome) => report.completed.push((id, outcome.passed())),
            Err(e) => {
                // Never reached the stages; retry next cycle.
                self.tested.forget(&id);
                report.errors.push((id, e.to_string()));
            }
        }
    }

    fn launch(&mut self, revision: Revision, report: &mut CycleReport) {
        let id = revision.id();
        let guard = self.tested.record(revision.clone());
        let executor = Arc::clone(&self.executor);

        let handle = tokio::spawn(async move {
            let _guard = guard;
            // Outcomes and errors are logged by the executor.
            let _ = executor.run(&revision).await;
        });

        report.launched.push((id, handle));
    }
}
