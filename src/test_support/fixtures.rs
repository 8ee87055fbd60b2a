//! Ready-made configurations and a provider scripted for a healthy rollout.

use camino::Utf8Path;

use crate::config::StackConfig;
use crate::provider::{BalancerDescription, StackResource};
use crate::session::SessionConfig;

use super::ScriptedProvider;

/// Balancer name resolved by [`rollout_provider`].
pub const ROLLOUT_BALANCER: &str = "jira-lb";

/// Database identifier resolved by [`rollout_provider`].
pub const ROLLOUT_DATASTORE: &str = "jira-db";

/// Session settings that never prompt and use the default ports.
#[must_use]
pub fn session_config() -> SessionConfig {
    SessionConfig {
        ssh_bin: String::from("ssh"),
        scp_bin: String::from("scp"),
        ssh_user: String::from("ec2-user"),
        ssh_port: 22,
        ssh_identity_file: None,
        ssh_batch_mode: true,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        control_persist_secs: 300,
        relay_host: None,
        relay_user: None,
        relay_port: 22,
    }
}

/// Stack settings with restore enabled and every file written under
/// `output_dir`.
#[must_use]
pub fn stack_config(output_dir: &Utf8Path) -> StackConfig {
    StackConfig {
        stack_name: String::from("Demo"),
        template_url: String::from("https://templates.example/jira.yaml"),
        region: String::from("us-west-2"),
        aws_profile: None,
        aws_bin: String::from("aws"),
        on_failure: String::from("DELETE"),
        balancer_logical_id: String::from("LoadBalancer"),
        balancer_physical_id: None,
        base_url: None,
        datastore_logical_id: String::from("DB"),
        datastore_physical_id: None,
        datastore_password: Some(String::from("s3cret")),
        address_mode: String::from("public"),
        outputs_file: output_dir.join("outputs.conf").into_string(),
        hosts_file: output_dir.join("hosts").into_string(),
        base_url_file: output_dir.join("baseurl").into_string(),
        exports: Some(String::from("JDBCURL")),
        max_service_wait_secs: 120,
        max_balancer_wait_secs: 120,
        instance_wait_secs: Some(300),
        abandon_instance_wait: false,
        restore_enabled: true,
        backup_bucket: Some(String::from("backups")),
        backup_datastore_dump: Some(String::from("jira/db.dump")),
        backup_artifact_bundle: Some(String::from("jira/indexes.tar.gz")),
        backup_credentials_file: Some(String::from("/creds/credentials")),
        backup_config_file: Some(String::from("/creds/config")),
        setenv_file: None,
    }
}

fn resource(logical_id: &str, physical_id: &str, resource_type: &str) -> StackResource {
    StackResource {
        logical_id: logical_id.to_owned(),
        physical_id: Some(physical_id.to_owned()),
        resource_type: resource_type.to_owned(),
        status: String::from("CREATE_COMPLETE"),
        reason: None,
    }
}

/// Provider whose stack completes at once, with `hosts` instances named
/// `i-1`, `i-2`, ... reachable as `h1.example`, `h2.example`, ... and all
/// running and in service.
#[must_use]
pub fn rollout_provider(hosts: usize) -> ScriptedProvider {
    let provider = ScriptedProvider::new();
    let instance_ids: Vec<String> = (1..=hosts).map(|n| format!("i-{n}")).collect();

    provider.set_outputs(&[
        ("JDBCURL", "jdbc:postgresql://db.example:5432/jira"),
        ("ClusterNodeSG", "sg-1234"),
    ]);
    provider.script_resources(vec![vec![
        resource("LoadBalancer", ROLLOUT_BALANCER, "AWS::ElasticLoadBalancing::LoadBalancer"),
        resource("DB", ROLLOUT_DATASTORE, "AWS::RDS::DBInstance"),
    ]]);
    provider.set_balancers(vec![BalancerDescription {
        name: String::from(ROLLOUT_BALANCER),
        dns_name: String::from("jira-lb.elb.example"),
        instances: instance_ids.clone(),
    }]);

    let addresses: Vec<(String, String)> = (1..=hosts)
        .map(|n| (format!("i-{n}"), format!("h{n}.example")))
        .collect();
    let borrowed: Vec<(&str, Option<&str>, Option<&str>)> = addresses
        .iter()
        .map(|(id, dns)| (id.as_str(), Some(dns.as_str()), Some("10.0.0.1")))
        .collect();
    provider.set_addresses(&borrowed);

    for instance_id in &instance_ids {
        provider.script_instance(instance_id, &[("running", "ok")]);
    }
    provider.set_datastore_endpoint("db.example");
    provider
}
