//! Tests for fleet resolution and health gating.

use std::time::Duration;

use rstest::rstest;

use super::*;
use crate::provider::BalancerDescription;
use crate::test_support::{ProviderCall, ScriptedProvider};

fn balancer(name: &str, instances: &[&str]) -> BalancerDescription {
    BalancerDescription {
        name: name.to_owned(),
        dns_name: format!("{name}.elb.example"),
        instances: instances.iter().map(|id| (*id).to_owned()).collect(),
    }
}

fn two_host_provider() -> ScriptedProvider {
    let provider = ScriptedProvider::new();
    provider.set_balancers(vec![balancer("lb", &["i-1", "i-2"])]);
    provider.set_addresses(&[
        ("i-1", Some("h1.example"), Some("10.0.0.1")),
        ("i-2", Some("h2.example"), Some("10.0.0.2")),
    ]);
    provider
}

#[rstest]
#[case::none(vec![])]
#[case::two(vec![balancer("lb", &["i-1"]), balancer("lb", &["i-2"])])]
#[tokio::test]
async fn ambiguous_balancer_fails_without_instance_calls(#[case] balancers: Vec<BalancerDescription>) {
    let provider = ScriptedProvider::new();
    provider.set_balancers(balancers);
    let gate = FleetGate::new(&provider, AddressMode::Public);

    let err = gate.resolve_targets("lb").await.expect_err("must be rejected");

    assert!(matches!(err, FleetError::ResourceNotFound { .. }), "{err}");
    assert_eq!(provider.count_calls(ProviderCall::touches_instances), 0);
}

#[rstest]
#[tokio::test]
async fn empty_balancer_is_rejected() {
    let provider = ScriptedProvider::new();
    provider.set_balancers(vec![balancer("lb", &[])]);
    let gate = FleetGate::new(&provider, AddressMode::Public);

    let err = gate.resolve_targets("lb").await.expect_err("empty balancer");

    assert_eq!(
        err,
        FleetError::ResourceNotFound {
            resource: String::from("load balancer lb"),
            detail: String::from("no instances are registered"),
        }
    );
}

#[rstest]
#[case(AddressMode::Public, vec!["h1.example", "h2.example"])]
#[case(AddressMode::Private, vec!["10.0.0.1", "10.0.0.2"])]
#[tokio::test]
async fn addresses_follow_the_connection_mode(#[case] mode: AddressMode, #[case] hosts: Vec<&str>) {
    let provider = two_host_provider();
    let gate = FleetGate::new(&provider, mode);

    let topology = gate
        .resolve_targets("lb")
        .await
        .unwrap_or_else(|err| panic!("resolve should succeed: {err}"));

    assert_eq!(topology.hosts(), hosts);
    assert_eq!(topology.balancer_dns, "lb.elb.example");
    assert!(topology
        .instances
        .iter()
        .all(|instance| instance.health == HealthState::Unknown));
}

#[rstest]
#[tokio::test]
async fn missing_public_address_is_reported() {
    let provider = ScriptedProvider::new();
    provider.set_balancers(vec![balancer("lb", &["i-1"])]);
    provider.set_addresses(&[("i-1", None, Some("10.0.0.1"))]);
    let gate = FleetGate::new(&provider, AddressMode::Public);

    let err = gate.resolve_targets("lb").await.expect_err("no public DNS");

    assert!(err.to_string().contains("instance i-1"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn instances_are_awaited_in_order_through_termination() {
    let provider = two_host_provider();
    provider.script_instance(
        "i-1",
        &[("pending", "initializing"), ("terminated", "not-applicable"), ("running", "ok")],
    );
    provider.script_instance("i-2", &[("running", "initializing"), ("running", "ok")]);
    let gate = FleetGate::new(&provider, AddressMode::Public);
    let members = gate
        .resolve_members("lb")
        .await
        .unwrap_or_else(|err| panic!("resolve should succeed: {err}"));

    let started = tokio::time::Instant::now();
    gate.await_instances_running(&members, Some(Duration::from_secs(300)))
        .await
        .unwrap_or_else(|err| panic!("instances should come up: {err}"));

    assert_eq!(started.elapsed(), Duration::from_secs(90));
    let statuses = provider
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            ProviderCall::DescribeInstanceStatus(id) => Some(id),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(statuses, vec!["i-1", "i-1", "i-1", "i-2", "i-2"]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn addresses_are_resolved_once_instances_run() {
    let provider = two_host_provider();
    provider.script_instance("i-1", &[("running", "ok")]);
    provider.script_instance("i-2", &[("pending", "initializing"), ("running", "ok")]);
    provider.publish_dns_once_running("i-2");
    let gate = FleetGate::new(&provider, AddressMode::Public);
    let members = gate
        .resolve_members("lb")
        .await
        .unwrap_or_else(|err| panic!("resolve should succeed: {err}"));
    assert_eq!(provider.count_calls(ProviderCall::touches_instances), 0);

    gate.await_instances_running(&members, Some(Duration::from_secs(300)))
        .await
        .unwrap_or_else(|err| panic!("instances should come up: {err}"));
    let topology = gate
        .resolve_addresses(members)
        .await
        .unwrap_or_else(|err| panic!("addresses should resolve: {err}"));

    assert_eq!(topology.hosts(), vec!["h1.example", "h2.example"]);
}

#[rstest]
#[tokio::test]
async fn booting_instance_has_no_public_address_yet() {
    let provider = two_host_provider();
    provider.publish_dns_once_running("i-2");
    let gate = FleetGate::new(&provider, AddressMode::Public);

    let err = gate
        .resolve_targets("lb")
        .await
        .expect_err("i-2 has not been seen running");

    assert!(err.to_string().contains("instance i-2"), "{err}");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn missing_reservation_is_fatal() {
    let provider = two_host_provider();
    let gate = FleetGate::new(&provider, AddressMode::Public);
    let members = gate
        .resolve_members("lb")
        .await
        .unwrap_or_else(|err| panic!("resolve should succeed: {err}"));

    let err = gate
        .await_instances_running(&members, None)
        .await
        .expect_err("unknown instance");

    assert!(matches!(err, FleetError::ResourceNotFound { ref resource, .. } if resource == "instance i-1"));
}

#[rstest]
#[case(false, true)]
#[case(true, false)]
#[tokio::test(start_paused = true)]
async fn instance_timeout_fails_unless_abandoned(#[case] abandon: bool, #[case] fails: bool) {
    let provider = two_host_provider();
    provider.script_instance("i-1", &[("pending", "initializing")]);
    provider.script_instance("i-2", &[("running", "ok")]);
    let gate = FleetGate::new(&provider, AddressMode::Public).abandon_instance_wait(abandon);
    let members = gate
        .resolve_members("lb")
        .await
        .unwrap_or_else(|err| panic!("resolve should succeed: {err}"));

    let result = gate
        .await_instances_running(&members, Some(Duration::from_secs(60)))
        .await;

    assert_eq!(result.is_err(), fails);
    if let Err(FleetError::Timeout { ceiling, .. }) = result {
        assert_eq!(ceiling, Duration::from_secs(60));
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn health_check_waits_for_out_of_service_to_clear() {
    let provider = two_host_provider();
    provider.script_health(&[
        &[("i-1", HealthState::OutOfService), ("i-2", HealthState::InService)],
        &[("i-1", HealthState::Unknown), ("i-2", HealthState::InService)],
    ]);
    let gate = FleetGate::new(&provider, AddressMode::Public);

    let report = gate
        .await_health_check("lb", Duration::from_secs(300), Duration::from_secs(15))
        .await
        .unwrap_or_else(|err| panic!("health check should pass: {err}"));

    assert_eq!(report.len(), 2);
    assert_eq!(
        provider.count_calls(|call| matches!(call, ProviderCall::DescribeInstanceHealth(_))),
        2
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn health_check_times_out_with_elapsed_and_ceiling() {
    let provider = two_host_provider();
    provider.script_health(&[&[("i-1", HealthState::OutOfService)]]);
    let gate = FleetGate::new(&provider, AddressMode::Public);

    let err = gate
        .await_health_check("lb", Duration::from_secs(60), Duration::from_secs(15))
        .await
        .expect_err("health never clears");

    let FleetError::Timeout {
        elapsed, ceiling, ..
    } = err
    else {
        panic!("expected timeout, got {err}");
    };
    assert_eq!(ceiling, Duration::from_secs(60));
    assert!(elapsed >= ceiling && elapsed <= ceiling + Duration::from_secs(15));
}
