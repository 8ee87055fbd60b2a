//! Resource provider abstraction.
//!
//! The orchestration core never talks to a cloud API directly. Everything it
//! needs to know about stacks, balancers, instances and databases goes
//! through [`ResourceProvider`], which has one production implementation
//! ([`AwsCliProvider`]) and an in-memory scripted one for tests.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::transport::SpawnError;

mod aws;
mod types;

pub use aws::{AwsCliProvider, AwsCliSettings, DEFAULT_AWS_BIN};
pub use types::{
    BalancerDescription, HealthState, InstanceAddresses, InstanceHealth, InstanceStatus,
    OnFailure, ParseOnFailureError, StackDescription, StackHandle, StackOutput, StackResource,
};

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Errors raised by resource providers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// The provider could not be reached or throttled the request. Safe to
    /// retry.
    #[error("provider transport error during {operation}: {message}")]
    Transport {
        /// Operation being attempted.
        operation: String,
        /// Diagnostic from the provider client.
        message: String,
    },
    /// A named resource does not exist.
    #[error("{resource} not found")]
    NotFound {
        /// Description of the missing resource.
        resource: String,
    },
    /// The provider client rejected the request.
    #[error("{program} {operation} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Client program, typically `aws`.
        program: String,
        /// Operation being attempted.
        operation: String,
        /// Human readable exit status.
        status_text: String,
        /// Stderr captured from the client.
        stderr: String,
    },
    /// Provider output could not be parsed.
    #[error("failed to parse {operation} output: {message}")]
    Parse {
        /// Operation whose output was malformed.
        operation: String,
        /// Parser error message.
        message: String,
    },
    /// The client binary could not be started.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

impl ProviderError {
    /// Returns `true` for failures that may succeed on a later attempt.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Operations the orchestration core needs from a cloud provider.
///
/// Implementations resolve credentials once, at construction.
pub trait ResourceProvider: Send + Sync {
    /// Returns `true` when a live stack called `name` exists.
    fn stack_exists<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, bool>;

    /// Submits creation of a stack.
    fn create_stack<'a>(&'a self, handle: &'a StackHandle) -> ProviderFuture<'a, ()>;

    /// Describes a stack, or `None` when no such stack exists.
    fn describe_stack<'a>(&'a self, name: &'a str)
    -> ProviderFuture<'a, Option<StackDescription>>;

    /// Lists the resources of a stack with their current status.
    fn describe_stack_resources<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Vec<StackResource>>;

    /// Requests deletion of a stack. Missing stacks yield
    /// [`ProviderError::NotFound`].
    fn delete_stack<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, ()>;

    /// Reports lifecycle and reachability of an instance, or `None` when the
    /// provider has no reservation for it.
    fn describe_instance_status<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, Option<InstanceStatus>>;

    /// Lists balancers whose name matches `name`.
    fn describe_balancers<'a>(&'a self, name: &'a str)
    -> ProviderFuture<'a, Vec<BalancerDescription>>;

    /// Reports balancer health for every registered instance.
    fn describe_instance_health<'a>(
        &'a self,
        balancer: &'a str,
    ) -> ProviderFuture<'a, Vec<InstanceHealth>>;

    /// Resolves network addresses for the given instances.
    fn instance_addresses<'a>(
        &'a self,
        instance_ids: &'a [String],
    ) -> ProviderFuture<'a, Vec<InstanceAddresses>>;

    /// Returns the connection host name of a managed database instance.
    fn datastore_endpoint<'a>(&'a self, db_instance_id: &'a str) -> ProviderFuture<'a, String>;
}
