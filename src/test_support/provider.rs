//! In-memory [`ResourceProvider`] with scripted answers.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use crate::provider::{
    BalancerDescription, HealthState, InstanceAddresses, InstanceHealth, InstanceStatus,
    ProviderError, ProviderFuture, ResourceProvider, StackDescription, StackHandle, StackOutput,
    StackResource,
};

/// One call observed by [`ScriptedProvider`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProviderCall {
    /// `stack_exists(name)`.
    StackExists(String),
    /// `create_stack(handle)`.
    CreateStack(StackHandle),
    /// `describe_stack(name)`.
    DescribeStack(String),
    /// `describe_stack_resources(name)`.
    DescribeStackResources(String),
    /// `delete_stack(name)`.
    DeleteStack(String),
    /// `describe_instance_status(id)`.
    DescribeInstanceStatus(String),
    /// `describe_balancers(name)`.
    DescribeBalancers(String),
    /// `describe_instance_health(balancer)`.
    DescribeInstanceHealth(String),
    /// `instance_addresses(ids)`.
    InstanceAddresses(Vec<String>),
    /// `datastore_endpoint(id)`.
    DatastoreEndpoint(String),
}

impl ProviderCall {
    /// Returns `true` for calls that inspect individual instances.
    #[must_use]
    pub const fn touches_instances(&self) -> bool {
        matches!(
            self,
            Self::DescribeInstanceStatus(_)
                | Self::DescribeInstanceHealth(_)
                | Self::InstanceAddresses(_)
        )
    }
}

/// Queue whose last element repeats forever once reached.
#[derive(Debug)]
struct Sticky<T> {
    items: VecDeque<T>,
}

impl<T> Default for Sticky<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<T: Clone> Sticky<T> {
    fn set(&mut self, items: impl IntoIterator<Item = T>) {
        self.items = items.into_iter().collect();
    }

    fn next(&mut self) -> Option<T> {
        if self.items.len() > 1 {
            self.items.pop_front()
        } else {
            self.items.front().cloned()
        }
    }
}

#[derive(Debug, Default)]
struct ProviderState {
    calls: Vec<ProviderCall>,
    failures: HashMap<&'static str, VecDeque<ProviderError>>,
    live_stacks: BTreeMap<String, Sticky<String>>,
    pending_statuses: BTreeMap<String, Vec<String>>,
    outputs: Vec<StackOutput>,
    resources: Sticky<Vec<StackResource>>,
    balancers: Vec<BalancerDescription>,
    instance_statuses: BTreeMap<String, Sticky<InstanceStatus>>,
    health: Sticky<Vec<InstanceHealth>>,
    addresses: Vec<InstanceAddresses>,
    dns_after_running: BTreeSet<String>,
    observed_states: BTreeMap<String, String>,
    datastore_endpoint: Option<String>,
}

/// Scripted provider for unit and behavioural tests.
///
/// Stacks come into existence when created (or when seeded with
/// [`ScriptedProvider::seed_stack`]) and vanish when deleted. Status
/// sequences repeat their final entry once exhausted.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl ScriptedProvider {
    /// Creates an empty provider with no stacks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ProviderState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    fn answer<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut ProviderState) -> Result<T, ProviderError>,
    ) -> ProviderFuture<'static, T> {
        let result = self.with_state(f);
        Box::pin(async move { result })
    }

    /// Returns every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.with_state(|state| state.calls.clone())
    }

    /// Counts calls matching `predicate`.
    #[must_use]
    pub fn count_calls(&self, predicate: impl Fn(&ProviderCall) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    /// Marks `name` as already existing, reporting `statuses` when described.
    pub fn seed_stack(&self, name: &str, statuses: &[&str]) {
        self.with_state(|state| {
            let mut script = Sticky::default();
            script.set(statuses.iter().map(|status| (*status).to_owned()));
            state.live_stacks.insert(name.to_owned(), script);
        });
    }

    /// Statuses reported for `name` once it is created.
    pub fn script_creation(&self, name: &str, statuses: &[&str]) {
        self.with_state(|state| {
            state.pending_statuses.insert(
                name.to_owned(),
                statuses.iter().map(|status| (*status).to_owned()).collect(),
            );
        });
    }

    /// Outputs reported by every described stack.
    pub fn set_outputs(&self, outputs: &[(&str, &str)]) {
        self.with_state(|state| {
            state.outputs = outputs
                .iter()
                .map(|(key, value)| StackOutput {
                    key: (*key).to_owned(),
                    value: (*value).to_owned(),
                })
                .collect();
        });
    }

    /// Successive resource listings; the last one repeats.
    pub fn script_resources(&self, listings: Vec<Vec<StackResource>>) {
        self.with_state(|state| state.resources.set(listings));
    }

    /// Balancers returned by every lookup.
    pub fn set_balancers(&self, balancers: Vec<BalancerDescription>) {
        self.with_state(|state| state.balancers = balancers);
    }

    /// Successive `(state, status)` pairs for one instance.
    pub fn script_instance(&self, instance_id: &str, states: &[(&str, &str)]) {
        self.with_state(|state| {
            let mut script = Sticky::default();
            script.set(states.iter().map(|(lifecycle, status)| InstanceStatus {
                instance_id: instance_id.to_owned(),
                state: (*lifecycle).to_owned(),
                status: (*status).to_owned(),
            }));
            state.instance_statuses.insert(instance_id.to_owned(), script);
        });
    }

    /// Successive health reports; the last one repeats.
    pub fn script_health(&self, reports: &[&[(&str, HealthState)]]) {
        self.with_state(|state| {
            state.health.set(reports.iter().map(|report| {
                report
                    .iter()
                    .map(|(id, health)| InstanceHealth {
                        instance_id: (*id).to_owned(),
                        state: *health,
                    })
                    .collect::<Vec<_>>()
            }));
        });
    }

    /// Addresses returned for instance lookups.
    pub fn set_addresses(&self, addresses: &[(&str, Option<&str>, Option<&str>)]) {
        self.with_state(|state| {
            state.addresses = addresses
                .iter()
                .map(|(id, public_dns, private_ip)| InstanceAddresses {
                    instance_id: (*id).to_owned(),
                    public_dns: public_dns.map(str::to_owned),
                    private_ip: private_ip.map(str::to_owned),
                })
                .collect();
        });
    }

    /// Withholds the public DNS name of `instance_id` until a status check
    /// has reported it running, as the provider does for booting instances.
    pub fn publish_dns_once_running(&self, instance_id: &str) {
        self.with_state(|state| {
            state.dns_after_running.insert(instance_id.to_owned());
        });
    }

    /// Endpoint returned for every database lookup.
    pub fn set_datastore_endpoint(&self, endpoint: &str) {
        self.with_state(|state| state.datastore_endpoint = Some(endpoint.to_owned()));
    }

    /// Makes the next call to `operation` fail with `error`.
    ///
    /// `operation` is the trait method name, for example `"describe_stack"`.
    pub fn fail_next(&self, operation: &'static str, error: ProviderError) {
        self.with_state(|state| {
            state
                .failures
                .entry(operation)
                .or_default()
                .push_back(error);
        });
    }
}

impl ProviderState {
    fn record(&mut self, operation: &'static str, call: ProviderCall) -> Result<(), ProviderError> {
        self.calls.push(call);
        match self.failures.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl ResourceProvider for ScriptedProvider {
    fn stack_exists<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, bool> {
        self.answer(|state| {
            state.record("stack_exists", ProviderCall::StackExists(name.to_owned()))?;
            Ok(state.live_stacks.contains_key(name))
        })
    }

    fn create_stack<'a>(&'a self, handle: &'a StackHandle) -> ProviderFuture<'a, ()> {
        self.answer(|state| {
            state.record("create_stack", ProviderCall::CreateStack(handle.clone()))?;
            let statuses = state
                .pending_statuses
                .remove(&handle.name)
                .unwrap_or_else(|| vec![String::from("CREATE_COMPLETE")]);
            let mut script = Sticky::default();
            script.set(statuses);
            state.live_stacks.insert(handle.name.clone(), script);
            Ok(())
        })
    }

    fn describe_stack<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<StackDescription>> {
        self.answer(|state| {
            state.record("describe_stack", ProviderCall::DescribeStack(name.to_owned()))?;
            let outputs = state.outputs.clone();
            Ok(state
                .live_stacks
                .get_mut(name)
                .and_then(Sticky::next)
                .map(|status| StackDescription {
                    name: name.to_owned(),
                    status,
                    reason: None,
                    outputs,
                }))
        })
    }

    fn describe_stack_resources<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Vec<StackResource>> {
        self.answer(|state| {
            state.record(
                "describe_stack_resources",
                ProviderCall::DescribeStackResources(name.to_owned()),
            )?;
            Ok(state.resources.next().unwrap_or_default())
        })
    }

    fn delete_stack<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, ()> {
        self.answer(|state| {
            state.record("delete_stack", ProviderCall::DeleteStack(name.to_owned()))?;
            state
                .live_stacks
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| ProviderError::NotFound {
                    resource: format!("stack {name}"),
                })
        })
    }

    fn describe_instance_status<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, Option<InstanceStatus>> {
        self.answer(|state| {
            state.record(
                "describe_instance_status",
                ProviderCall::DescribeInstanceStatus(instance_id.to_owned()),
            )?;
            let status = state
                .instance_statuses
                .get_mut(instance_id)
                .and_then(Sticky::next);
            if let Some(ref observed) = status {
                state
                    .observed_states
                    .insert(instance_id.to_owned(), observed.state.clone());
            }
            Ok(status)
        })
    }

    fn describe_balancers<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Vec<BalancerDescription>> {
        self.answer(|state| {
            state.record(
                "describe_balancers",
                ProviderCall::DescribeBalancers(name.to_owned()),
            )?;
            Ok(state.balancers.clone())
        })
    }

    fn describe_instance_health<'a>(
        &'a self,
        balancer: &'a str,
    ) -> ProviderFuture<'a, Vec<InstanceHealth>> {
        self.answer(|state| {
            state.record(
                "describe_instance_health",
                ProviderCall::DescribeInstanceHealth(balancer.to_owned()),
            )?;
            Ok(state.health.next().unwrap_or_default())
        })
    }

    fn instance_addresses<'a>(
        &'a self,
        instance_ids: &'a [String],
    ) -> ProviderFuture<'a, Vec<InstanceAddresses>> {
        self.answer(|state| {
            state.record(
                "instance_addresses",
                ProviderCall::InstanceAddresses(instance_ids.to_vec()),
            )?;
            Ok(instance_ids
                .iter()
                .filter_map(|id| {
                    let mut address = state
                        .addresses
                        .iter()
                        .find(|address| &address.instance_id == id)
                        .cloned()?;
                    let running = state
                        .observed_states
                        .get(id)
                        .is_some_and(|observed| observed == "running");
                    if state.dns_after_running.contains(id) && !running {
                        address.public_dns = None;
                    }
                    Some(address)
                })
                .collect())
        })
    }

    fn datastore_endpoint<'a>(&'a self, db_instance_id: &'a str) -> ProviderFuture<'a, String> {
        self.answer(|state| {
            state.record(
                "datastore_endpoint",
                ProviderCall::DatastoreEndpoint(db_instance_id.to_owned()),
            )?;
            state
                .datastore_endpoint
                .clone()
                .ok_or_else(|| ProviderError::NotFound {
                    resource: format!("database {db_instance_id}"),
                })
        })
    }
}
