//! Configuration file loading and validation.
//!
//! The file is TOML with one `[[repo]]` table per monitored repository.
//! Everything is validated up front; any error is fatal at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::archive::{self, LogArchive};
use crate::eligibility::Whitelist;
use crate::error::{Error, Result};
use crate::hosting::{github, RepoLocation};
use crate::pipeline::StageSet;
use crate::toolchain::{Language, DEFAULT_TOOLCHAIN_DIR};

/// Default per-revision log root.
pub const DEFAULT_LOG_DIR: &str = "/var/log/localCI";

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another result, prefixing its messages with `context`.
    pub fn merge_with_context(&mut self, context: &str, other: ValidationResult) {
        self.errors
            .extend(other.errors.into_iter().map(|e| format!("{}: {}", context, e)));
        self.warnings
            .extend(other.warnings.into_iter().map(|w| format!("{}: {}", context, w)));
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Whole configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Default execution mode for repositories that do not set one.
    #[serde(default)]
    pub run_tests_in_parallel: bool,

    /// Cache directory for downloaded toolchains.
    #[serde(default = "default_toolchain_dir")]
    pub toolchain_dir: PathBuf,

    #[serde(default, rename = "repo", alias = "Repo")]
    pub repos: Vec<RepoConfig>,
}

fn default_toolchain_dir() -> PathBuf {
    PathBuf::from(DEFAULT_TOOLCHAIN_DIR)
}

/// One monitored repository.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
    /// Web URL, e.g. `https://github.com/owner/repo`.
    pub url: String,

    /// API token; anonymous access when absent.
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_trunk_branch")]
    pub trunk_branch: String,

    /// Single change request to watch or test; 0 watches every open one.
    #[serde(default)]
    pub pr: u64,

    #[serde(
        default = "default_poll_interval",
        with = "humantime_serde",
        alias = "refresh_time"
    )]
    pub poll_interval: Duration,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// `*`, `@` or a comma-separated list of logins.
    #[serde(default = "default_whitelist")]
    pub whitelist: String,

    #[serde(default)]
    pub comment_trigger: Option<CommentTriggerConfig>,

    #[serde(default)]
    pub setup: Vec<String>,
    #[serde(default)]
    pub run: Vec<String>,
    #[serde(default)]
    pub teardown: Vec<String>,
    #[serde(default)]
    pub on_success: Vec<String>,
    #[serde(default)]
    pub on_failure: Vec<String>,

    #[serde(default)]
    pub post_on_success: Option<String>,
    #[serde(default)]
    pub post_on_failure: Option<String>,

    #[serde(default)]
    pub language: Option<LanguageConfig>,

    #[serde(default = "default_tty")]
    pub tty: bool,

    #[serde(default)]
    pub log_server: Option<LogServerConfig>,

    /// Overrides the top-level `run_tests_in_parallel`.
    #[serde(default)]
    pub run_tests_in_parallel: Option<bool>,

    /// Per-command limit; unbounded when absent.
    #[serde(default, with = "humantime_serde")]
    pub command_timeout: Option<Duration>,
}

fn default_trunk_branch() -> String {
    "master".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_DIR)
}

fn default_whitelist() -> String {
    "*".to_string()
}

fn default_tty() -> bool {
    true
}

/// Comment that must follow the latest commit before a change request is tested.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CommentTriggerConfig {
    /// Required author; any author when empty.
    #[serde(default)]
    pub user: String,
    pub comment: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LanguageConfig {
    pub language: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LogServerConfig {
    #[serde(default)]
    pub ip: String,
    #[serde(default = "default_log_server_user")]
    pub user: String,
    #[serde(default = "default_log_server_dir")]
    pub dir: String,
    /// Private key material, not a path.
    #[serde(default)]
    pub key: Option<String>,
}

fn default_log_server_user() -> String {
    archive::DEFAULT_USER.to_string()
}

fn default_log_server_dir() -> String {
    archive::DEFAULT_DIR.to_string()
}

impl RepoConfig {
    pub fn stages(&self) -> StageSet {
        StageSet {
            setup: self.setup.clone(),
            run: self.run.clone(),
            teardown: self.teardown.clone(),
            on_success: self.on_success.clone(),
            on_failure: self.on_failure.clone(),
        }
    }

    pub fn language(&self) -> Result<Language> {
        match &self.language {
            Some(l) => Language::parse(&l.language, &l.version),
            None => Ok(Language::Host),
        }
    }

    pub fn whitelist(&self) -> Result<Whitelist> {
        Whitelist::parse(&self.whitelist)
    }

    pub fn log_archive(&self) -> Option<LogArchive> {
        self.log_server.as_ref().map(|server| {
            let archive = LogArchive::new(server.ip.trim())
                .with_user(server.user.clone())
                .with_dir(server.dir.clone());
            match &server.key {
                Some(key) if !key.is_empty() => archive.with_key(key.clone()),
                _ => archive,
            }
        })
    }

    /// Single change request, if one is configured.
    pub fn change_request(&self) -> Option<u64> {
        (self.pr != 0).then_some(self.pr)
    }

    pub fn parallel(&self, default: bool) -> bool {
        self.run_tests_in_parallel.unwrap_or(default)
    }
}

impl Validate for RepoConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.url.trim().is_empty() {
            result.add_error("missing repository url");
        } else {
            match RepoLocation::parse(&self.url) {
                Ok(location) if !github::supports(&location) => {
                    result.add_error(format!("hosting platform not supported: {}", self.url));
                }
                Ok(_) => {}
                Err(e) => result.add_error(e.to_string()),
            }
        }

        if self.run.is_empty() {
            result.add_error("missing run commands");
        }

        if self.poll_interval.is_zero() {
            result.add_error("poll_interval must be greater than zero");
        }

        if let Some(trigger) = &self.comment_trigger {
            if trigger.comment.trim().is_empty() {
                result.add_error("comment_trigger requires a comment");
            }
        }

        if let Some(server) = &self.log_server {
            if server.ip.trim().is_empty() {
                result.add_error("log_server requires an ip");
            }
        }

        if let Err(e) = self.whitelist() {
            result.add_error(e.to_string());
        }

        if let Err(e) = self.language() {
            result.add_error(e.to_string());
        }

        if self.token.as_deref().map_or(true, str::is_empty) {
            result.add_warning("no token configured, API rate limits will be low");
        }

        if matches!(self.command_timeout, Some(t) if t < Duration::from_secs(1)) {
            result.add_warning("command_timeout under one second will fail most commands");
        }

        result
    }
}

impl Validate for Config {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.repos.is_empty() {
            result.add_error("no repositories configured");
        }

        for (i, repo) in self.repos.iter().enumerate() {
            let context = if repo.url.trim().is_empty() {
                format!("repo #{}", i + 1)
            } else {
                repo.url.trim().to_string()
            };
            result.merge_with_context(&context, repo.validate());
        }

        result
    }
}

/// Parses configuration text without validating it.
pub fn parse_config(text: &str) -> Result<Config> {
    Ok(toml::from_str(text)?)
}

/// Reads, parses and validates the configuration file.
///
/// Warnings are logged; errors are returned as one [`Error::Config`].
pub fn load_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    let config = parse_config(&text)?;

    for warning in config.validate().into_result()? {
        tracing::warn!(config = ?path, "{}", warning);
    }

    Ok(config)
}
