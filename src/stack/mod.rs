//! Stack provisioning and state watching.
//!
//! [`StackWatcher`] creates a stack only when none of that name exists, then
//! polls it at a fixed cadence until it reaches a terminal state. Every
//! distinct status of the stack and of each of its resources is logged once,
//! so a long provisioning run reads as a list of transitions rather than a
//! repeated dump.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::poller::{PollFailure, Poller};
use crate::provider::{
    ProviderError, ResourceProvider, StackDescription, StackHandle, StackOutput, StackResource,
};

/// Default delay between stack status polls.
pub const DEFAULT_STACK_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Coarse lifecycle state of a stack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StackState {
    /// Creation, update or deletion is under way.
    InProgress,
    /// Creation or update finished successfully.
    Complete,
    /// Creation, update or deletion failed, or the stack was rolled back.
    Failed,
    /// A rollback itself failed; manual cleanup is required.
    RollbackFailed,
    /// The stack was deleted.
    Deleted,
    /// The provider reported a status this crate does not recognise.
    Unknown,
    /// No stack with the requested name exists.
    NoSuchStack,
}

impl StackState {
    /// Maps a provider status string onto a state.
    ///
    /// Completed rollbacks are terminal failures: the stack will not make
    /// further progress on its own.
    #[must_use]
    pub fn from_provider(status: &str) -> Self {
        match status {
            "CREATE_COMPLETE" | "UPDATE_COMPLETE" | "IMPORT_COMPLETE" => Self::Complete,
            "DELETE_COMPLETE" => Self::Deleted,
            s if s.ends_with("ROLLBACK_FAILED") => Self::RollbackFailed,
            s if s.ends_with("_IN_PROGRESS") => Self::InProgress,
            s if s.ends_with("_FAILED") || s.ends_with("ROLLBACK_COMPLETE") => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// Returns `true` when no further spontaneous transition will occur.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Failed | Self::RollbackFailed | Self::Deleted | Self::NoSuchStack
        )
    }
}

impl fmt::Display for StackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InProgress => "in progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::RollbackFailed => "rollback failed",
            Self::Deleted => "deleted",
            Self::Unknown => "unknown",
            Self::NoSuchStack => "no such stack",
        })
    }
}

/// State of a stack plus the provider's explanation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StackStatus {
    /// Coarse state.
    pub state: StackState,
    /// Free-text reason reported by the provider.
    pub reason: Option<String>,
}

impl StackStatus {
    const fn absent() -> Self {
        Self {
            state: StackState::NoSuchStack,
            reason: None,
        }
    }

    fn from_description(description: &StackDescription) -> Self {
        Self {
            state: StackState::from_provider(&description.status),
            reason: description.reason.clone(),
        }
    }

    /// Returns `true` when the stack is gone.
    #[must_use]
    pub const fn is_gone(&self) -> bool {
        matches!(self.state, StackState::Deleted | StackState::NoSuchStack)
    }
}

/// Result of an idempotent create.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CreateOutcome {
    /// Creation was requested.
    Submitted,
    /// A stack with this name already existed; nothing was requested.
    AlreadyExists,
}

/// Outputs and resources of a completed stack.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StackSnapshot {
    /// Stack outputs in provider order.
    pub outputs: Vec<StackOutput>,
    /// Stack resources in provider order.
    pub resources: Vec<StackResource>,
}

impl StackSnapshot {
    /// Returns the value of output `key`.
    #[must_use]
    pub fn output(&self, key: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|output| output.key == key)
            .map(|output| output.value.as_str())
    }

    /// Returns the physical identifier of the resource named `logical_id`.
    #[must_use]
    pub fn physical_id(&self, logical_id: &str) -> Option<&str> {
        self.resources
            .iter()
            .find(|resource| resource.logical_id == logical_id)
            .and_then(|resource| resource.physical_id.as_deref())
    }
}

/// Errors raised while provisioning or watching a stack.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StackError {
    /// The provider call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The stack to describe does not exist.
    #[error("stack {name} does not exist")]
    NoSuchStack {
        /// Stack name.
        name: String,
    },
}

fn classify(err: ProviderError) -> PollFailure<StackError> {
    if err.is_transient() {
        PollFailure::Transient(StackError::Provider(err))
    } else {
        PollFailure::Fatal(StackError::Provider(err))
    }
}

/// Remembers the last logged status of every resource.
#[derive(Debug, Default)]
struct TransitionLog {
    last_seen: HashMap<String, String>,
}

impl TransitionLog {
    /// Logs `status` for `resource` unless it was the last one logged.
    /// Returns `true` when a line was emitted.
    fn observe(&mut self, resource: &str, status: &str, reason: Option<&str>) -> bool {
        if self.last_seen.get(resource).is_some_and(|seen| seen == status) {
            return false;
        }
        self.last_seen
            .insert(resource.to_owned(), status.to_owned());

        let detail = reason.unwrap_or_default();
        if status.contains("FAILED") {
            warn!(resource, status, reason = detail, "Status changed");
        } else {
            info!(resource, status, reason = detail, "Status changed");
        }
        true
    }
}

async fn observe_stack<P: ResourceProvider>(
    provider: &P,
    name: &str,
    log: &RefCell<TransitionLog>,
    latest: &RefCell<StackStatus>,
) -> Result<bool, PollFailure<StackError>> {
    let Some(description) = provider.describe_stack(name).await.map_err(classify)? else {
        info!(stack = name, "Stack does not exist");
        *latest.borrow_mut() = StackStatus::absent();
        return Ok(true);
    };

    let status = StackStatus::from_description(&description);
    let resources = if status.state == StackState::Deleted {
        Vec::new()
    } else {
        match provider.describe_stack_resources(name).await {
            Ok(resources) => resources,
            Err(ProviderError::NotFound { .. }) => {
                info!(stack = name, "Stack disappeared while it was being described");
                *latest.borrow_mut() = StackStatus::absent();
                return Ok(true);
            }
            Err(err) => return Err(classify(err)),
        }
    };

    {
        let mut log = log.borrow_mut();
        log.observe(name, &description.status, description.reason.as_deref());
        for resource in &resources {
            log.observe(
                &resource.logical_id,
                &resource.status,
                resource.reason.as_deref(),
            );
        }
    }

    let terminal = status.state.is_terminal();
    *latest.borrow_mut() = status;
    Ok(terminal)
}

/// Creates, describes, deletes and waits on stacks.
#[derive(Debug)]
pub struct StackWatcher<'p, P: ResourceProvider> {
    provider: &'p P,
    poll_interval: Duration,
}

impl<'p, P: ResourceProvider> StackWatcher<'p, P> {
    /// Creates a watcher polling at the default cadence.
    #[must_use]
    pub const fn new(provider: &'p P) -> Self {
        Self {
            provider,
            poll_interval: DEFAULT_STACK_POLL_INTERVAL,
        }
    }

    /// Overrides the poll cadence.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Requests creation unless a stack of that name already exists.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Provider`] when the existence check or the
    /// create request fails.
    pub async fn create(&self, handle: &StackHandle) -> Result<CreateOutcome, StackError> {
        if self.provider.stack_exists(&handle.name).await? {
            info!(stack = %handle.name, "Stack already exists; skipping creation");
            return Ok(CreateOutcome::AlreadyExists);
        }

        info!(
            stack = %handle.name,
            template = %handle.template_url,
            parameters = handle.parameters.len(),
            on_failure = %handle.on_failure,
            "Creating stack"
        );
        self.provider.create_stack(handle).await?;
        Ok(CreateOutcome::Submitted)
    }

    /// Polls until the stack reaches a terminal state. There is no ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Provider`] for non-transient provider failures.
    pub async fn await_terminal(&self, name: &str) -> Result<StackStatus, StackError> {
        let log = RefCell::new(TransitionLog::default());
        let latest = RefCell::new(StackStatus::absent());
        let (log_ref, latest_ref, provider) = (&log, &latest, self.provider);

        Poller::unbounded(self.poll_interval)
            .wait_until(move || observe_stack(provider, name, log_ref, latest_ref))
            .await?;

        Ok(latest.into_inner())
    }

    /// Returns the outputs and resources of a stack.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::NoSuchStack`] when the stack is absent.
    pub async fn describe(&self, name: &str) -> Result<StackSnapshot, StackError> {
        let description =
            self.provider
                .describe_stack(name)
                .await?
                .ok_or_else(|| StackError::NoSuchStack {
                    name: name.to_owned(),
                })?;
        let resources = self.provider.describe_stack_resources(name).await?;
        Ok(StackSnapshot {
            outputs: description.outputs,
            resources,
        })
    }

    /// Requests deletion and waits for the stack to disappear.
    ///
    /// A stack that does not exist is already deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Provider`] when the delete request or the
    /// subsequent wait fails.
    pub async fn delete(&self, name: &str) -> Result<StackStatus, StackError> {
        info!(stack = name, "Deleting stack");
        match self.provider.delete_stack(name).await {
            Ok(()) => {}
            Err(ProviderError::NotFound { .. }) => {
                info!(stack = name, "Stack does not exist; nothing to delete");
                return Ok(StackStatus::absent());
            }
            Err(err) => return Err(err.into()),
        }
        self.await_terminal(name).await
    }
}
