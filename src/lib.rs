//! localci - continuous integration for repositories on a code-hosting platform
//!
//! This library polls a repository's trunk branch and open change requests,
//! decides which revisions need testing, and runs a staged shell pipeline
//! against each one, reporting results back as comments and archived logs.

pub mod archive;
pub mod config;
pub mod eligibility;
pub mod error;
pub mod executor;
pub mod hosting;
pub mod monitor;
pub mod pipeline;
pub mod revision;
pub mod stage;
pub mod tested;
pub mod toolchain;

pub use archive::LogArchive;
pub use config::{load_config, Config, RepoConfig, Validate, ValidationResult};
pub use eligibility::{Eligibility, EligibilityPolicy, IneligibleReason, Whitelist};
pub use error::{Error, Result};
pub use executor::TestExecutor;
pub use hosting::{GitHubClient, HostingClient, InMemoryHost, RepoLocation};
pub use monitor::{CommentTrigger, CycleReport, MonitorSettings, RepositoryMonitor};
pub use pipeline::{PipelineOutcome, StageSet};
pub use revision::{BranchRevision, ChangeRequest, ChangeState, Commit, Revision, TriggerComment};
pub use stage::{Stage, StageConfig, StageResult};
pub use tested::{ScheduleDecision, TestedSet};
pub use toolchain::{
    GoToolchain, HostToolchain, Language, LanguageEnvironment, ToolchainCache, ToolchainProvider,
};
