//! Binary entry point for the `upkeep` CLI.

mod cli;

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tracing::info;

use upkeep::config::StackConfig;
use upkeep::liveness::HttpProbe;
use upkeep::logging::{LoggingError, init_logging};
use upkeep::manifest::{ManifestError, ManifestStore};
use upkeep::orchestrator::{OrchestratorError, RolloutOrchestrator, StackTeardown};
use upkeep::provider::AwsCliProvider;
use upkeep::session::{SessionConfig, SessionFactory};
use upkeep::transport::StreamingCommandRunner;

use cli::{Cli, StepArgs};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Logging(#[from] LoggingError),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    init_logging()?;
    dispatch(cli).await
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Start(args) => {
            if skipped("start", &args) {
                return Ok(());
            }
            start().await
        }
        Cli::Stop(args) => {
            if skipped("stop", &args) {
                return Ok(());
            }
            stop().await
        }
    }
}

fn skipped(step: &str, args: &StepArgs) -> bool {
    if args.skip {
        info!(step, "Skipping step as requested");
    }
    args.skip
}

fn load_stack_config() -> Result<StackConfig, CliError> {
    StackConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))
}

async fn start() -> Result<(), CliError> {
    let config = load_stack_config()?;
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let session_config =
        SessionConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let sessions = SessionFactory::new(session_config, StreamingCommandRunner)
        .map_err(|err| CliError::Config(err.to_string()))?;
    let manifest = ManifestStore::new().load()?;
    if let Some(ref source) = manifest.source {
        info!(manifest = %source, parameters = manifest.parameters.len(), "Loaded run manifest");
    }

    let provider = AwsCliProvider::with_process_runner(config.aws_settings());
    let summary = RolloutOrchestrator::new(config, manifest, provider, sessions, HttpProbe)
        .start()
        .await?;
    info!(
        base_url = %summary.base_url,
        hosts = ?summary.hosts,
        restored = summary.restore.is_some(),
        "Stack is serving traffic"
    );
    Ok(())
}

async fn stop() -> Result<(), CliError> {
    let config = load_stack_config()?;
    config
        .validate_teardown()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let provider = AwsCliProvider::with_process_runner(config.aws_settings());
    StackTeardown::new(provider, config.stack_name.trim())
        .execute()
        .await?;
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
