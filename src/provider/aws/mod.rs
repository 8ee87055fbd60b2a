//! [`ResourceProvider`] backed by the `aws` command line client.
//!
//! Every call runs `aws <service> <operation> --region R [--profile P]
//! --output json` through a [`CommandRunner`] and parses the JSON response.
//! Credentials are resolved by the client from the profile, so this is the
//! only place that decides which account and region are used.

use std::ffi::OsString;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::transport::{CommandOutput, CommandRunner, ProcessCommandRunner};

use super::{
    BalancerDescription, HealthState, InstanceAddresses, InstanceHealth, InstanceStatus,
    ProviderError, ProviderFuture, ResourceProvider, StackDescription, StackHandle, StackOutput,
    StackResource,
};

mod types;

use types::{
    DescribeDbInstances, DescribeInstanceHealth, DescribeInstanceStatus, DescribeInstances,
    DescribeLoadBalancers, DescribeStackResources, DescribeStacks,
};

/// Default `aws` binary name.
pub const DEFAULT_AWS_BIN: &str = "aws";

const NOT_FOUND_MARKERS: &[&str] = &[
    "does not exist",
    "LoadBalancerNotFound",
    "DBInstanceNotFound",
    "InvalidInstanceID.NotFound",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "Throttling",
    "RequestLimitExceeded",
    "Rate exceeded",
    "Could not connect to the endpoint URL",
    "Connection was closed",
    "Read timeout",
    "ServiceUnavailable",
    "InternalFailure",
];

/// Client settings shared by every call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AwsCliSettings {
    /// Path to the `aws` executable.
    pub aws_bin: String,
    /// Region every request targets.
    pub region: String,
    /// Named credentials profile; the client default chain applies when
    /// unset.
    pub profile: Option<String>,
}

/// Resource provider that shells out to the `aws` CLI.
#[derive(Clone, Debug)]
pub struct AwsCliProvider<R: CommandRunner> {
    settings: AwsCliSettings,
    runner: R,
}

impl AwsCliProvider<ProcessCommandRunner> {
    /// Creates a provider wired to the real process runner.
    #[must_use]
    pub const fn with_process_runner(settings: AwsCliSettings) -> Self {
        Self::new(settings, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> AwsCliProvider<R> {
    /// Creates a provider using the supplied settings and runner.
    #[must_use]
    pub const fn new(settings: AwsCliSettings, runner: R) -> Self {
        Self { settings, runner }
    }

    fn build_args(&self, service: &str, operation: &str, extra: Vec<OsString>) -> Vec<OsString> {
        let mut args = vec![
            OsString::from(service),
            OsString::from(operation),
            OsString::from("--region"),
            OsString::from(&self.settings.region),
        ];
        if let Some(ref profile) = self.settings.profile {
            args.push(OsString::from("--profile"));
            args.push(OsString::from(profile));
        }
        args.push(OsString::from("--output"));
        args.push(OsString::from("json"));
        args.extend(extra);
        args
    }

    fn call(
        &self,
        service: &str,
        operation: &str,
        resource: &str,
        extra: Vec<OsString>,
    ) -> Result<CommandOutput, ProviderError> {
        let args = self.build_args(service, operation, extra);
        debug!(service, operation, resource, "Calling provider");
        let output = self.runner.run(&self.settings.aws_bin, &args)?;
        if output.is_success() {
            return Ok(output);
        }
        Err(self.classify_failure(operation, resource, &output))
    }

    fn call_json<T: DeserializeOwned>(
        &self,
        service: &str,
        operation: &str,
        resource: &str,
        extra: Vec<OsString>,
    ) -> Result<T, ProviderError> {
        let output = self.call(service, operation, resource, extra)?;
        serde_json::from_str(&output.stdout).map_err(|err| ProviderError::Parse {
            operation: operation.to_owned(),
            message: err.to_string(),
        })
    }

    fn classify_failure(&self, operation: &str, resource: &str, output: &CommandOutput) -> ProviderError {
        let stderr = output.stderr.trim().to_owned();
        if NOT_FOUND_MARKERS.iter().any(|marker| stderr.contains(marker)) {
            return ProviderError::NotFound {
                resource: resource.to_owned(),
            };
        }
        if TRANSIENT_MARKERS.iter().any(|marker| stderr.contains(marker)) {
            return ProviderError::Transport {
                operation: operation.to_owned(),
                message: stderr,
            };
        }
        ProviderError::CommandFailure {
            program: self.settings.aws_bin.clone(),
            operation: operation.to_owned(),
            status_text: output.status_text(),
            stderr,
        }
    }

    fn describe_stack_now(&self, name: &str) -> Result<Option<StackDescription>, ProviderError> {
        let resource = format!("stack {name}");
        let response = match self.call_json::<DescribeStacks>(
            "cloudformation",
            "describe-stacks",
            &resource,
            vec![OsString::from("--stack-name"), OsString::from(name)],
        ) {
            Ok(response) => response,
            Err(ProviderError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };

        Ok(response.stacks.into_iter().next().map(|stack| StackDescription {
            name: stack.stack_name,
            status: stack.stack_status,
            reason: stack.stack_status_reason,
            outputs: stack
                .outputs
                .into_iter()
                .map(|output| StackOutput {
                    key: output.output_key,
                    value: output.output_value,
                })
                .collect(),
        }))
    }

    fn create_stack_now(&self, handle: &StackHandle) -> Result<(), ProviderError> {
        let mut extra = vec![
            OsString::from("--stack-name"),
            OsString::from(&handle.name),
            OsString::from("--template-url"),
            OsString::from(&handle.template_url),
            OsString::from("--on-failure"),
            OsString::from(handle.on_failure.as_str()),
            OsString::from("--capabilities"),
            OsString::from("CAPABILITY_IAM"),
        ];
        if !handle.parameters.is_empty() {
            let parameters = handle
                .parameters
                .iter()
                .map(|(key, value)| json!({ "ParameterKey": key, "ParameterValue": value }))
                .collect::<Vec<_>>();
            extra.push(OsString::from("--parameters"));
            extra.push(OsString::from(Value::Array(parameters).to_string()));
        }

        let resource = format!("stack {}", handle.name);
        self.call("cloudformation", "create-stack", &resource, extra)
            .map(|_| ())
    }

    fn describe_stack_resources_now(&self, name: &str) -> Result<Vec<StackResource>, ProviderError> {
        let response: DescribeStackResources = self.call_json(
            "cloudformation",
            "describe-stack-resources",
            &format!("stack {name}"),
            vec![OsString::from("--stack-name"), OsString::from(name)],
        )?;
        Ok(response
            .stack_resources
            .into_iter()
            .map(|resource| StackResource {
                logical_id: resource.logical_resource_id,
                physical_id: resource.physical_resource_id,
                resource_type: resource.resource_type,
                status: resource.resource_status,
                reason: resource.resource_status_reason,
            })
            .collect())
    }

    fn delete_stack_now(&self, name: &str) -> Result<(), ProviderError> {
        self.call(
            "cloudformation",
            "delete-stack",
            &format!("stack {name}"),
            vec![OsString::from("--stack-name"), OsString::from(name)],
        )
        .map(|_| ())
    }

    fn describe_instance_status_now(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceStatus>, ProviderError> {
        let response = match self.call_json::<DescribeInstanceStatus>(
            "ec2",
            "describe-instance-status",
            &format!("instance {instance_id}"),
            vec![
                OsString::from("--instance-ids"),
                OsString::from(instance_id),
                OsString::from("--include-all-instances"),
            ],
        ) {
            Ok(response) => response,
            Err(ProviderError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };

        Ok(response
            .instance_statuses
            .into_iter()
            .find(|status| status.instance_id == instance_id)
            .map(|status| InstanceStatus {
                instance_id: status.instance_id,
                state: status.instance_state.name,
                status: status.instance_status.status,
            }))
    }

    fn describe_balancers_now(&self, name: &str) -> Result<Vec<BalancerDescription>, ProviderError> {
        let response = match self.call_json::<DescribeLoadBalancers>(
            "elb",
            "describe-load-balancers",
            &format!("load balancer {name}"),
            vec![
                OsString::from("--load-balancer-names"),
                OsString::from(name),
            ],
        ) {
            Ok(response) => response,
            Err(ProviderError::NotFound { .. }) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        Ok(response
            .load_balancer_descriptions
            .into_iter()
            .map(|balancer| BalancerDescription {
                name: balancer.load_balancer_name,
                dns_name: balancer.dns_name,
                instances: balancer
                    .instances
                    .into_iter()
                    .map(|instance| instance.instance_id)
                    .collect(),
            })
            .collect())
    }

    fn describe_instance_health_now(&self, balancer: &str) -> Result<Vec<InstanceHealth>, ProviderError> {
        let response: DescribeInstanceHealth = self.call_json(
            "elb",
            "describe-instance-health",
            &format!("load balancer {balancer}"),
            vec![
                OsString::from("--load-balancer-name"),
                OsString::from(balancer),
            ],
        )?;
        Ok(response
            .instance_states
            .into_iter()
            .map(|state| InstanceHealth {
                instance_id: state.instance_id,
                state: HealthState::from_provider(&state.state),
            })
            .collect())
    }

    fn instance_addresses_now(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<InstanceAddresses>, ProviderError> {
        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut extra = vec![OsString::from("--instance-ids")];
        extra.extend(instance_ids.iter().map(OsString::from));
        let response: DescribeInstances =
            self.call_json("ec2", "describe-instances", "instances", extra)?;

        let described = response
            .reservations
            .into_iter()
            .flat_map(|reservation| reservation.instances)
            .collect::<Vec<_>>();
        Ok(instance_ids
            .iter()
            .filter_map(|id| described.iter().find(|instance| &instance.instance_id == id))
            .map(|instance| InstanceAddresses {
                instance_id: instance.instance_id.clone(),
                public_dns: non_empty(instance.public_dns_name.as_deref()),
                private_ip: non_empty(instance.private_ip_address.as_deref()),
            })
            .collect())
    }

    fn datastore_endpoint_now(&self, db_instance_id: &str) -> Result<String, ProviderError> {
        let resource = format!("database {db_instance_id}");
        let response: DescribeDbInstances = self.call_json(
            "rds",
            "describe-db-instances",
            &resource,
            vec![
                OsString::from("--db-instance-identifier"),
                OsString::from(db_instance_id),
            ],
        )?;
        response
            .db_instances
            .into_iter()
            .find_map(|instance| instance.endpoint)
            .map(|endpoint| endpoint.address)
            .ok_or(ProviderError::NotFound { resource })
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_owned)
}

impl<R> ResourceProvider for AwsCliProvider<R>
where
    R: CommandRunner + Send + Sync,
{
    fn stack_exists<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, bool> {
        Box::pin(async move { self.describe_stack_now(name).map(|stack| stack.is_some()) })
    }

    fn create_stack<'a>(&'a self, handle: &'a StackHandle) -> ProviderFuture<'a, ()> {
        Box::pin(async move { self.create_stack_now(handle) })
    }

    fn describe_stack<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<StackDescription>> {
        Box::pin(async move { self.describe_stack_now(name) })
    }

    fn describe_stack_resources<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Vec<StackResource>> {
        Box::pin(async move { self.describe_stack_resources_now(name) })
    }

    fn delete_stack<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move { self.delete_stack_now(name) })
    }

    fn describe_instance_status<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, Option<InstanceStatus>> {
        Box::pin(async move { self.describe_instance_status_now(instance_id) })
    }

    fn describe_balancers<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Vec<BalancerDescription>> {
        Box::pin(async move { self.describe_balancers_now(name) })
    }

    fn describe_instance_health<'a>(
        &'a self,
        balancer: &'a str,
    ) -> ProviderFuture<'a, Vec<InstanceHealth>> {
        Box::pin(async move { self.describe_instance_health_now(balancer) })
    }

    fn instance_addresses<'a>(
        &'a self,
        instance_ids: &'a [String],
    ) -> ProviderFuture<'a, Vec<InstanceAddresses>> {
        Box::pin(async move { self.instance_addresses_now(instance_ids) })
    }

    fn datastore_endpoint<'a>(&'a self, db_instance_id: &'a str) -> ProviderFuture<'a, String> {
        Box::pin(async move { self.datastore_endpoint_now(db_instance_id) })
    }
}

#[cfg(test)]
mod tests;
