//! JSON shapes emitted by `aws ... --output json`.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct DescribeStacks {
    #[serde(default)]
    pub(super) stacks: Vec<CfnStack>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct CfnStack {
    pub(super) stack_name: String,
    pub(super) stack_status: String,
    pub(super) stack_status_reason: Option<String>,
    #[serde(default)]
    pub(super) outputs: Vec<CfnOutput>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct CfnOutput {
    pub(super) output_key: String,
    pub(super) output_value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct DescribeStackResources {
    #[serde(default)]
    pub(super) stack_resources: Vec<CfnResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct CfnResource {
    pub(super) logical_resource_id: String,
    pub(super) physical_resource_id: Option<String>,
    pub(super) resource_type: String,
    pub(super) resource_status: String,
    pub(super) resource_status_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct DescribeInstanceStatus {
    #[serde(default)]
    pub(super) instance_statuses: Vec<Ec2InstanceStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct Ec2InstanceStatus {
    pub(super) instance_id: String,
    pub(super) instance_state: Ec2StateName,
    pub(super) instance_status: Ec2StatusSummary,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct Ec2StateName {
    pub(super) name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct Ec2StatusSummary {
    pub(super) status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct DescribeInstances {
    #[serde(default)]
    pub(super) reservations: Vec<Ec2Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct Ec2Reservation {
    #[serde(default)]
    pub(super) instances: Vec<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct Ec2Instance {
    pub(super) instance_id: String,
    pub(super) public_dns_name: Option<String>,
    pub(super) private_ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct DescribeLoadBalancers {
    #[serde(default)]
    pub(super) load_balancer_descriptions: Vec<ElbDescription>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct ElbDescription {
    pub(super) load_balancer_name: String,
    #[serde(rename = "DNSName")]
    pub(super) dns_name: String,
    #[serde(default)]
    pub(super) instances: Vec<ElbInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct ElbInstance {
    pub(super) instance_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct DescribeInstanceHealth {
    #[serde(default)]
    pub(super) instance_states: Vec<ElbInstanceState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct ElbInstanceState {
    pub(super) instance_id: String,
    pub(super) state: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct DescribeDbInstances {
    #[serde(rename = "DBInstances", default)]
    pub(super) db_instances: Vec<RdsInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct RdsInstance {
    pub(super) endpoint: Option<RdsEndpoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct RdsEndpoint {
    pub(super) address: String,
}
