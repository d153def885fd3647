//! Error types for the localci orchestrator.

use thiserror::Error;

use crate::eligibility::IneligibleReason;

/// Top-level error type for discovery, scheduling and test runs.
#[derive(Error, Debug)]
pub enum Error {
    /// Hosting API transport, auth or response-shape failure.
    #[error("hosting platform error: {0}")]
    Platform(String),

    /// A caller passed an argument the operation refuses to work with.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The revision failed an eligibility check.
    #[error("revision {id} cannot be tested: {reason}")]
    Ineligible { id: String, reason: IneligibleReason },

    /// A stage command exited non-zero or could not be started.
    #[error("stage '{stage}' failed{}: {reason}", command_suffix(.command))]
    Stage {
        stage: String,
        command: Option<String>,
        reason: String,
    },

    /// Toolchain or working-directory setup failed.
    #[error("environment error: {0}")]
    Environment(String),

    /// Malformed or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// Copying logs to the archive host failed.
    #[error("log archive copy failed: {0}")]
    Archive(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn command_suffix(command: &Option<String>) -> String {
    match command {
        Some(command) => format!(" running `{}`", command),
        None => String::new(),
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Self::Platform(value.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(value: toml::de::Error) -> Self {
        Self::Config(value.to_string())
    }
}

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;
