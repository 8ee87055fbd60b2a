//! Balancer topology discovery and fleet health waits.
//!
//! [`FleetGate`] turns a balancer name into the instances registered with
//! it, waits for each instance to boot, resolves their addresses once they
//! are running, and waits for the balancer to report every instance in
//! service. All waits go through [`Poller`].

use std::cell::RefCell;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::poller::{PollFailure, PollOutcome, Poller};
use crate::provider::{HealthState, InstanceHealth, ProviderError, ResourceProvider};

/// Default delay between instance status polls.
pub const DEFAULT_INSTANCE_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default delay between balancer health polls.
pub const DEFAULT_HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Which instance address sessions connect to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressMode {
    /// Public DNS name; used when hosts are reached directly.
    Public,
    /// Private IP; used when hosts are reached through a relay.
    Private,
}

/// One host behind the balancer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceTarget {
    /// Instance identifier.
    pub instance_id: String,
    /// Address sessions connect to.
    pub address: String,
    /// Last known balancer health.
    pub health: HealthState,
}

/// A balancer and the instance ids registered with it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BalancerMembers {
    /// Balancer name.
    pub balancer: String,
    /// Public DNS name of the balancer.
    pub balancer_dns: String,
    /// Instance ids in balancer registration order.
    pub instance_ids: Vec<String>,
}

/// Ordered hosts behind one balancer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceTopology {
    /// Balancer name.
    pub balancer: String,
    /// Public DNS name of the balancer.
    pub balancer_dns: String,
    /// Hosts in balancer registration order.
    pub instances: Vec<InstanceTarget>,
}

impl InstanceTopology {
    /// Connection addresses in order.
    #[must_use]
    pub fn hosts(&self) -> Vec<String> {
        self.instances
            .iter()
            .map(|instance| instance.address.clone())
            .collect()
    }
}

/// Errors raised while resolving or waiting on the fleet.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FleetError {
    /// A named resource is missing or ambiguous. Never retried.
    #[error("{resource}: {detail}")]
    ResourceNotFound {
        /// Resource being resolved.
        resource: String,
        /// What was wrong with it.
        detail: String,
    },
    /// A bounded wait ran out of time.
    #[error("timed out after {}s (limit {}s) waiting for {what}", .elapsed.as_secs(), .ceiling.as_secs())]
    Timeout {
        /// What was being waited for.
        what: String,
        /// Time spent waiting.
        elapsed: Duration,
        /// Configured ceiling.
        ceiling: Duration,
    },
    /// The provider call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

fn classify(err: ProviderError) -> PollFailure<FleetError> {
    if err.is_transient() {
        PollFailure::Transient(FleetError::Provider(err))
    } else {
        PollFailure::Fatal(FleetError::Provider(err))
    }
}

fn poller_for(max_wait: Option<Duration>, interval: Duration) -> Poller {
    max_wait.map_or_else(
        || Poller::unbounded(interval),
        |ceiling| Poller::bounded(ceiling, interval),
    )
}

/// Resolves the fleet behind a balancer and gates on its health.
#[derive(Debug)]
pub struct FleetGate<'p, P: ResourceProvider> {
    provider: &'p P,
    address_mode: AddressMode,
    instance_poll_interval: Duration,
    abandon_instance_wait: bool,
}

impl<'p, P: ResourceProvider> FleetGate<'p, P> {
    /// Creates a gate resolving addresses with `address_mode`.
    #[must_use]
    pub const fn new(provider: &'p P, address_mode: AddressMode) -> Self {
        Self {
            provider,
            address_mode,
            instance_poll_interval: DEFAULT_INSTANCE_POLL_INTERVAL,
            abandon_instance_wait: false,
        }
    }

    /// Overrides the instance status poll cadence.
    #[must_use]
    pub const fn with_instance_poll_interval(mut self, interval: Duration) -> Self {
        self.instance_poll_interval = interval;
        self
    }

    /// When set, an instance that is still booting when its wait times out
    /// is logged and skipped instead of failing the run.
    #[must_use]
    pub const fn abandon_instance_wait(mut self, abandon: bool) -> Self {
        self.abandon_instance_wait = abandon;
        self
    }

    /// Looks up `balancer` and the instances registered with it.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::ResourceNotFound`] unless exactly one balancer
    /// matches, or when it has no instances. No instance lookups happen here.
    pub async fn resolve_members(&self, balancer: &str) -> Result<BalancerMembers, FleetError> {
        let matches = self.provider.describe_balancers(balancer).await?;
        let found = matches.len();
        let Ok([described]) = <[_; 1]>::try_from(matches) else {
            return Err(FleetError::ResourceNotFound {
                resource: format!("load balancer {balancer}"),
                detail: format!("expected exactly one match, found {found}"),
            });
        };

        if described.instances.is_empty() {
            return Err(FleetError::ResourceNotFound {
                resource: format!("load balancer {balancer}"),
                detail: String::from("no instances are registered"),
            });
        }

        info!(
            balancer = %described.name,
            dns = %described.dns_name,
            instances = ?described.instances,
            "Resolved balancer"
        );
        Ok(BalancerMembers {
            balancer: described.name,
            balancer_dns: described.dns_name,
            instance_ids: described.instances,
        })
    }

    /// Resolves the hosts registered with `balancer` in one go.
    ///
    /// Addresses are looked up immediately, so this suits fleets already
    /// known to be running; a rollout waits on [`Self::resolve_members`]
    /// before calling [`Self::resolve_addresses`].
    ///
    /// # Errors
    ///
    /// See [`Self::resolve_members`] and [`Self::resolve_addresses`].
    pub async fn resolve_targets(&self, balancer: &str) -> Result<InstanceTopology, FleetError> {
        let members = self.resolve_members(balancer).await?;
        self.resolve_addresses(members).await
    }

    /// Resolves the connection address of every member, in order.
    ///
    /// Call this once the instances are running: booting instances may not
    /// have a public DNS name yet.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::ResourceNotFound`] when an instance has no
    /// address of the required kind.
    pub async fn resolve_addresses(
        &self,
        members: BalancerMembers,
    ) -> Result<InstanceTopology, FleetError> {
        let addresses = self.provider.instance_addresses(&members.instance_ids).await?;
        let mut instances = Vec::with_capacity(members.instance_ids.len());
        for instance_id in members.instance_ids {
            let resolved = addresses
                .iter()
                .find(|candidate| candidate.instance_id == instance_id)
                .and_then(|candidate| match self.address_mode {
                    AddressMode::Public => candidate.public_dns.clone(),
                    AddressMode::Private => candidate.private_ip.clone(),
                });
            let Some(address) = resolved else {
                return Err(FleetError::ResourceNotFound {
                    resource: format!("instance {instance_id}"),
                    detail: format!("no {} address", self.address_label()),
                });
            };
            instances.push(InstanceTarget {
                instance_id,
                address,
                health: HealthState::Unknown,
            });
        }

        info!(
            balancer = %members.balancer,
            hosts = ?instances.iter().map(|i| i.address.as_str()).collect::<Vec<_>>(),
            "Resolved fleet"
        );
        Ok(InstanceTopology {
            balancer: members.balancer,
            balancer_dns: members.balancer_dns,
            instances,
        })
    }

    const fn address_label(&self) -> &'static str {
        match self.address_mode {
            AddressMode::Public => "public DNS",
            AddressMode::Private => "private IP",
        }
    }

    /// Waits for each instance, in order, to be running with passing status
    /// checks. A terminated instance is logged and waiting continues.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::ResourceNotFound`] when the provider has no
    /// reservation for an instance, and [`FleetError::Timeout`] when an
    /// instance is not ready within `per_instance_timeout` (unless the gate
    /// abandons such waits).
    pub async fn await_instances_running(
        &self,
        members: &BalancerMembers,
        per_instance_timeout: Option<Duration>,
    ) -> Result<(), FleetError> {
        let poller = poller_for(per_instance_timeout, self.instance_poll_interval);
        for instance_id in members.instance_ids.iter().map(String::as_str) {
            info!(instance = instance_id, "Waiting for instance to be running");
            let provider = self.provider;
            let outcome = poller
                .wait_until(move || observe_instance(provider, instance_id))
                .await?;

            if let PollOutcome::TimedOut {
                elapsed, ceiling, ..
            } = outcome
            {
                if self.abandon_instance_wait {
                    warn!(instance = instance_id, "Instance still not ready; continuing anyway");
                    continue;
                }
                return Err(FleetError::Timeout {
                    what: format!("instance {instance_id} to be running"),
                    elapsed,
                    ceiling,
                });
            }
            info!(instance = instance_id, "Instance is running");
        }
        Ok(())
    }

    /// Waits until the balancer reports no instance out of service and
    /// returns the final per-instance health.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Timeout`] when instances remain out of service
    /// for `max_wait`, or a provider error that is not transient.
    pub async fn await_health_check(
        &self,
        balancer: &str,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Result<Vec<InstanceHealth>, FleetError> {
        info!(balancer, "Waiting for every instance to be in service");
        let latest = RefCell::new(Vec::new());
        let (latest_ref, provider) = (&latest, self.provider);
        let outcome = Poller::bounded(max_wait, poll_interval)
            .wait_until(move || observe_health(provider, balancer, latest_ref))
            .await?;

        if let PollOutcome::TimedOut {
            elapsed, ceiling, ..
        } = outcome
        {
            return Err(FleetError::Timeout {
                what: format!("instances behind {balancer} to be in service"),
                elapsed,
                ceiling,
            });
        }
        info!(balancer, "All instances are in service");
        Ok(latest.into_inner())
    }
}

async fn observe_instance<P: ResourceProvider>(
    provider: &P,
    instance_id: &str,
) -> Result<bool, PollFailure<FleetError>> {
    let Some(status) = provider
        .describe_instance_status(instance_id)
        .await
        .map_err(classify)?
    else {
        return Err(PollFailure::Fatal(FleetError::ResourceNotFound {
            resource: format!("instance {instance_id}"),
            detail: String::from("no reservation found"),
        }));
    };

    if status.state == "terminated" {
        warn!(instance = instance_id, "Instance is terminated; still waiting");
        return Ok(false);
    }
    if status.is_ready() {
        return Ok(true);
    }
    info!(
        instance = instance_id,
        state = %status.state,
        status = %status.status,
        "Instance not ready yet"
    );
    Ok(false)
}

async fn observe_health<P: ResourceProvider>(
    provider: &P,
    balancer: &str,
    latest: &RefCell<Vec<InstanceHealth>>,
) -> Result<bool, PollFailure<FleetError>> {
    let report = provider
        .describe_instance_health(balancer)
        .await
        .map_err(classify)?;
    let out_of_service = report
        .iter()
        .filter(|health| health.state == HealthState::OutOfService)
        .count();

    if out_of_service > 0 {
        for health in &report {
            info!(instance = %health.instance_id, state = %health.state, "Balancer health");
        }
        info!(balancer, out_of_service, "Instances still out of service");
    }
    *latest.borrow_mut() = report;
    Ok(out_of_service == 0)
}

#[cfg(test)]
mod tests;
