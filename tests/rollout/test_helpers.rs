//! Shared fixtures for rollout BDD scenarios.

use std::sync::Arc;

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use rstest::fixture;
use tempfile::TempDir;
use thiserror::Error;
use upkeep::config::StackConfig;
use upkeep::orchestrator::OrchestratorError;
use upkeep::stack::StackStatus;
use upkeep::test_support::{
    ScriptedProbe, ScriptedProvider, ScriptedRunner, rollout_provider, stack_config,
};

#[derive(Clone, Debug)]
pub struct RolloutContext {
    pub provider: ScriptedProvider,
    pub runner: ScriptedRunner,
    pub probe: ScriptedProbe,
    pub config: StackConfig,
    pub output_dir: Utf8PathBuf,
    pub outcome: Option<RolloutResult>,
    pub(crate) _output_tmp: Arc<TempDir>,
}

impl RolloutContext {
    pub fn read_output(&self, name: &str) -> Option<String> {
        let dir = Dir::open_ambient_dir(&self.output_dir, ambient_authority())
            .unwrap_or_else(|err| panic!("open output dir {}: {err}", self.output_dir));
        dir.read_to_string(name).ok()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureKind {
    Config,
    Stack,
    Export,
    Resource,
    Fleet,
    BalancerHealth,
    Restore,
    Extras,
    Liveness,
    Teardown,
}

impl FailureKind {
    pub fn of(err: &OrchestratorError) -> Self {
        match err {
            OrchestratorError::Config(_) => Self::Config,
            OrchestratorError::Provision { .. } | OrchestratorError::StackNotComplete { .. } => {
                Self::Stack
            }
            OrchestratorError::Export(_) => Self::Export,
            OrchestratorError::ResourceNotFound { .. } | OrchestratorError::Datastore { .. } => {
                Self::Resource
            }
            OrchestratorError::Fleet { step, .. } if step.contains("balancer health") => {
                Self::BalancerHealth
            }
            OrchestratorError::Fleet { .. } => Self::Fleet,
            OrchestratorError::Restore(_) => Self::Restore,
            OrchestratorError::ExtrasSession { .. } | OrchestratorError::ExtrasCommand { .. } => {
                Self::Extras
            }
            OrchestratorError::Liveness(_) => Self::Liveness,
            OrchestratorError::Teardown { .. } | OrchestratorError::StackNotDeleted { .. } => {
                Self::Teardown
            }
        }
    }

    pub fn parse(label: &str) -> Self {
        match label {
            "config" => Self::Config,
            "stack" => Self::Stack,
            "export" => Self::Export,
            "resource" => Self::Resource,
            "fleet" => Self::Fleet,
            "balancer health" => Self::BalancerHealth,
            "restore" => Self::Restore,
            "extras" => Self::Extras,
            "liveness" => Self::Liveness,
            "teardown" => Self::Teardown,
            other => panic!("unknown failure step label: {other}"),
        }
    }
}

#[derive(Clone, Debug)]
pub enum RolloutResult {
    Started { hosts: Vec<String>, base_url: String },
    Stopped(StackStatus),
    Failure { kind: FailureKind, message: String },
}

#[derive(Clone, Debug, Error)]
pub enum RolloutTestError {
    #[error("failed to create output directory: {0}")]
    Workspace(String),
}

#[fixture]
pub fn rollout_context_result() -> Result<RolloutContext, RolloutTestError> {
    build_rollout_context()
}

#[fixture]
pub fn rollout_context(
    rollout_context_result: Result<RolloutContext, RolloutTestError>,
) -> RolloutContext {
    rollout_context_result
        .unwrap_or_else(|err| panic!("rollout context fixture should initialise: {err}"))
}

fn build_rollout_context() -> Result<RolloutContext, RolloutTestError> {
    let tmp_dir =
        TempDir::new().map_err(|err| RolloutTestError::Workspace(format!("tempdir: {err}")))?;
    let output_dir = Utf8PathBuf::from_path_buf(tmp_dir.path().to_path_buf()).map_err(|path| {
        RolloutTestError::Workspace(format!("non-utf8 tempdir path: {}", path.display()))
    })?;

    Ok(RolloutContext {
        provider: rollout_provider(2),
        runner: ScriptedRunner::succeeding(),
        probe: ScriptedProbe::default(),
        config: stack_config(&output_dir),
        output_dir,
        outcome: None,
        _output_tmp: Arc::new(tmp_dir),
    })
}
