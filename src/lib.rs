//! Core library for the `upkeep` rollout tool.
//!
//! The crate provisions an application stack through a cloud provider,
//! restores its datastore and per-host artifacts from backups over SSH,
//! and gates completion on balancer health and public reachability. Every
//! wait in that pipeline goes through the bounded [`poller::Poller`].

pub mod config;
pub mod exports;
pub mod fleet;
pub mod liveness;
pub mod logging;
pub mod manifest;
pub mod orchestrator;
pub mod poller;
pub mod provider;
pub mod restore;
pub mod session;
pub mod stack;
pub mod test_support;
pub mod transport;

pub use config::{ConfigError, StackConfig};
pub use orchestrator::{
    OrchestratorError, RolloutOrchestrator, RolloutSummary, RolloutTimings, StackTeardown,
};
pub use poller::{PollFailure, PollOutcome, Poller};
pub use provider::{AwsCliProvider, ResourceProvider};
pub use session::{RemoteSession, SessionConfig, SessionFactory};
