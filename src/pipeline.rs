//! Fixed stage ordering for one test run.

use crate::error::Error;
use crate::stage::{Stage, StageConfig};

pub const SETUP: &str = "setup";
pub const RUN: &str = "run";
pub const TEARDOWN: &str = "teardown";
pub const ON_SUCCESS: &str = "onSuccess";
pub const ON_FAILURE: &str = "onFailure";

/// Command lists for every stage of a repository's pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSet {
    pub setup: Vec<String>,
    pub run: Vec<String>,
    pub teardown: Vec<String>,
    pub on_success: Vec<String>,
    pub on_failure: Vec<String>,
}

impl StageSet {
    /// Main stages in execution order.
    fn main_stages(&self) -> [Stage; 3] {
        [
            Stage::new(SETUP, self.setup.clone()),
            Stage::new(RUN, self.run.clone()),
            Stage::new(TEARDOWN, self.teardown.clone()),
        ]
    }

    /// Runs `setup`, `run` and `teardown`, stopping at the first failure, then
    /// the matching `onSuccess`/`onFailure` stage.
    ///
    /// Failures of the follow-up stage are logged and never change the outcome.
    pub async fn execute(&self, config: &StageConfig) -> PipelineOutcome {
        let mut outcome = PipelineOutcome::Passed;

        for stage in self.main_stages() {
            if let Err(error) = stage.run(config).await {
                tracing::error!(stage = %stage.name, error = %error, "stage failed");
                outcome = PipelineOutcome::Failed {
                    stage: stage.name.clone(),
                    error,
                };
                break;
            }
        }

        let follow_up = if outcome.passed() {
            Stage::new(ON_SUCCESS, self.on_success.clone())
        } else {
            Stage::new(ON_FAILURE, self.on_failure.clone())
        };

        if let Err(e) = follow_up.run(config).await {
            tracing::warn!(stage = %follow_up.name, error = %e, "follow-up stage failed");
        }

        outcome
    }
}

/// How a pipeline run ended.
#[derive(Debug)]
pub enum PipelineOutcome {
    Passed,
    Failed { stage: String, error: Error },
}

impl PipelineOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, PipelineOutcome::Passed)
    }
}
