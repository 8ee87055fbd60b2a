//! Provider-neutral descriptions of stacks, balancers and instances.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// What the provider does with a stack whose creation fails.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OnFailure {
    /// Leave the failed resources in place for inspection.
    DoNothing,
    /// Roll back created resources.
    Rollback,
    /// Delete the stack.
    #[default]
    Delete,
}

impl OnFailure {
    /// Provider spelling of the policy.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DoNothing => "DO_NOTHING",
            Self::Rollback => "ROLLBACK",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when an on-failure policy string is not recognised.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown on-failure policy {value:?}; expected DO_NOTHING, ROLLBACK or DELETE")]
pub struct ParseOnFailureError {
    /// Rejected input.
    pub value: String,
}

impl FromStr for OnFailure {
    type Err = ParseOnFailureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DO_NOTHING" => Ok(Self::DoNothing),
            "ROLLBACK" => Ok(Self::Rollback),
            "DELETE" => Ok(Self::Delete),
            _ => Err(ParseOnFailureError {
                value: value.to_owned(),
            }),
        }
    }
}

/// Everything needed to request creation of a named stack.
///
/// Immutable once creation has been requested.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StackHandle {
    /// Stack name; unique per account and region.
    pub name: String,
    /// URL of the template the stack is built from.
    pub template_url: String,
    /// Template parameters keyed by parameter name.
    pub parameters: BTreeMap<String, String>,
    /// Policy applied when creation fails.
    pub on_failure: OnFailure,
}

/// Named value exported by a completed stack.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StackOutput {
    /// Output key.
    pub key: String,
    /// Output value.
    pub value: String,
}

/// Provider view of a stack at one point in time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StackDescription {
    /// Stack name.
    pub name: String,
    /// Raw provider status, for example `CREATE_IN_PROGRESS`.
    pub status: String,
    /// Optional status reason.
    pub reason: Option<String>,
    /// Outputs, empty until the stack completes.
    pub outputs: Vec<StackOutput>,
}

/// One resource belonging to a stack.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StackResource {
    /// Template-defined name.
    pub logical_id: String,
    /// Provider-assigned identifier, absent until created.
    pub physical_id: Option<String>,
    /// Provider resource type, for example `AWS::EC2::Instance`.
    pub resource_type: String,
    /// Raw provider status.
    pub status: String,
    /// Optional status reason.
    pub reason: Option<String>,
}

/// Lifecycle and reachability of one compute instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceStatus {
    /// Instance identifier.
    pub instance_id: String,
    /// Lifecycle state, for example `pending`, `running` or `terminated`.
    pub state: String,
    /// Reachability check status, for example `initializing` or `ok`.
    pub status: String,
}

impl InstanceStatus {
    /// Returns `true` once the instance is running and passing checks.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == "running" && self.status == "ok"
    }
}

/// A load balancer and its registered instances.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BalancerDescription {
    /// Balancer name.
    pub name: String,
    /// Public DNS name of the balancer.
    pub dns_name: String,
    /// Identifiers of registered instances, in provider order.
    pub instances: Vec<String>,
}

/// Balancer-reported health of an instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HealthState {
    /// Receiving traffic.
    InService,
    /// Failing health checks.
    OutOfService,
    /// Not yet reported or unrecognised.
    Unknown,
}

impl HealthState {
    /// Maps the provider spelling onto a health state.
    #[must_use]
    pub fn from_provider(value: &str) -> Self {
        match value {
            "InService" => Self::InService,
            "OutOfService" => Self::OutOfService,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InService => "InService",
            Self::OutOfService => "OutOfService",
            Self::Unknown => "Unknown",
        })
    }
}

/// Health of one instance behind a balancer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceHealth {
    /// Instance identifier.
    pub instance_id: String,
    /// Reported state.
    pub state: HealthState,
}

/// Network addresses assigned to an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceAddresses {
    /// Instance identifier.
    pub instance_id: String,
    /// Public DNS name, when the instance has one.
    pub public_dns: Option<String>,
    /// Private IPv4 address.
    pub private_ip: Option<String>,
}
