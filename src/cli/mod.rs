//! Command-line interface definitions for the `upkeep` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `upkeep` binary.
#[derive(Debug, Parser)]
#[command(
    name = "upkeep",
    about = "Provision an application stack, restore it from backups, and gate on fleet health",
    long_about = "Provision an application stack, restore it from backups, and gate on fleet \
                  health.\n\nSettings come from upkeep.toml and UPKEEP_* environment variables.",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Create the stack, restore it, and wait until it serves traffic.
    #[command(
        name = "start",
        about = "Create the stack, restore it, and wait until it serves traffic"
    )]
    Start(StepArgs),
    /// Delete the stack and wait until it is gone.
    #[command(name = "stop", about = "Delete the stack and wait until it is gone")]
    Stop(StepArgs),
}

/// Arguments shared by every subcommand.
#[derive(Args, Debug)]
pub(crate) struct StepArgs {
    /// Do nothing and exit successfully, for pipelines that toggle the step.
    #[arg(long)]
    pub(crate) skip: bool,
}
