//! Tests for the `aws` CLI provider.

use std::collections::BTreeMap;

use rstest::{fixture, rstest};

use super::*;
use crate::provider::OnFailure;
use crate::test_support::ScriptedRunner;

#[fixture]
fn settings() -> AwsCliSettings {
    AwsCliSettings {
        aws_bin: String::from("aws"),
        region: String::from("us-west-2"),
        profile: Some(String::from("ops")),
    }
}

fn provider(settings: AwsCliSettings, runner: &ScriptedRunner) -> AwsCliProvider<ScriptedRunner> {
    AwsCliProvider::new(settings, runner.clone())
}

#[rstest]
#[tokio::test]
async fn describe_stack_parses_status_and_outputs(settings: AwsCliSettings) {
    let runner = ScriptedRunner::new();
    runner.push_output(
        Some(0),
        r#"{"Stacks":[{"StackName":"Demo","StackStatus":"CREATE_COMPLETE",
            "Outputs":[{"OutputKey":"JIRAURL","OutputValue":"http://lb.example"}]}]}"#,
        "",
    );
    let aws = provider(settings, &runner);

    let stack = aws
        .describe_stack("Demo")
        .await
        .unwrap_or_else(|err| panic!("describe should succeed: {err}"))
        .unwrap_or_else(|| panic!("stack should exist"));

    assert_eq!(stack.status, "CREATE_COMPLETE");
    assert_eq!(
        stack.outputs,
        vec![StackOutput {
            key: String::from("JIRAURL"),
            value: String::from("http://lb.example"),
        }]
    );
    assert_eq!(
        runner.command_lines()[0],
        "aws cloudformation describe-stacks --region us-west-2 --profile ops --output json \
         --stack-name Demo"
    );
}

#[rstest]
#[tokio::test]
async fn missing_stack_is_none(settings: AwsCliSettings) {
    let runner = ScriptedRunner::new();
    runner.push_output(
        Some(254),
        "",
        "An error occurred (ValidationError) when calling the DescribeStacks operation: Stack with id Demo does not exist",
    );
    let aws = provider(settings, &runner);

    let exists = aws
        .stack_exists("Demo")
        .await
        .unwrap_or_else(|err| panic!("missing stack is not an error: {err}"));

    assert!(!exists);
}

#[rstest]
#[tokio::test]
async fn create_stack_passes_parameters_as_json(settings: AwsCliSettings) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), r#"{"StackId":"arn:stack/Demo"}"#, "");
    let aws = provider(settings, &runner);
    let handle = StackHandle {
        name: String::from("Demo"),
        template_url: String::from("https://templates.example/jira.template"),
        parameters: BTreeMap::from([(String::from("KeyName"), String::from("ops,key"))]),
        on_failure: OnFailure::Delete,
    };

    aws.create_stack(&handle)
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));

    let line = runner.command_lines().remove(0);
    assert!(line.contains("--on-failure DELETE"));
    assert!(line.contains("--capabilities CAPABILITY_IAM"));
    assert!(line.ends_with(r#"--parameters [{"ParameterKey":"KeyName","ParameterValue":"ops,key"}]"#));
}

#[rstest]
#[case("Throttling: Rate exceeded", true)]
#[case("Could not connect to the endpoint URL: \"https://ec2.us-west-2.amazonaws.com/\"", true)]
#[case("An error occurred (UnauthorizedOperation)", false)]
#[tokio::test]
async fn failures_are_classified(
    settings: AwsCliSettings,
    #[case] stderr: &str,
    #[case] transient: bool,
) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(255), "", stderr);
    let aws = provider(settings, &runner);

    let err = aws
        .describe_instance_health("lb")
        .await
        .expect_err("call should fail");

    assert_eq!(err.is_transient(), transient, "{err}");
}

#[rstest]
#[tokio::test]
async fn balancers_include_registered_instances(settings: AwsCliSettings) {
    let runner = ScriptedRunner::new();
    runner.push_output(
        Some(0),
        r#"{"LoadBalancerDescriptions":[{"LoadBalancerName":"lb","DNSName":"lb-1.elb.example",
            "Instances":[{"InstanceId":"i-1"},{"InstanceId":"i-2"}]}]}"#,
        "",
    );
    let aws = provider(settings, &runner);

    let balancers = aws
        .describe_balancers("lb")
        .await
        .unwrap_or_else(|err| panic!("describe should succeed: {err}"));

    assert_eq!(balancers.len(), 1);
    assert_eq!(balancers[0].dns_name, "lb-1.elb.example");
    assert_eq!(balancers[0].instances, vec!["i-1", "i-2"]);
}

#[rstest]
#[tokio::test]
async fn unknown_balancer_yields_no_matches(settings: AwsCliSettings) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(254), "", "LoadBalancerNotFound: There is no ACTIVE Load Balancer named 'lb'");
    let aws = provider(settings, &runner);

    let balancers = aws
        .describe_balancers("lb")
        .await
        .unwrap_or_else(|err| panic!("not found maps to empty: {err}"));

    assert!(balancers.is_empty());
}

#[rstest]
#[tokio::test]
async fn instance_status_and_addresses_are_parsed(settings: AwsCliSettings) {
    let runner = ScriptedRunner::new();
    runner.push_output(
        Some(0),
        r#"{"InstanceStatuses":[{"InstanceId":"i-1","InstanceState":{"Name":"running"},
            "InstanceStatus":{"Status":"ok"}}]}"#,
        "",
    );
    runner.push_output(
        Some(0),
        r#"{"Reservations":[{"Instances":[
            {"InstanceId":"i-2","PublicDnsName":"","PrivateIpAddress":"10.0.0.2"},
            {"InstanceId":"i-1","PublicDnsName":"ec2-1.example","PrivateIpAddress":"10.0.0.1"}]}]}"#,
        "",
    );
    let aws = provider(settings, &runner);

    let status = aws
        .describe_instance_status("i-1")
        .await
        .unwrap_or_else(|err| panic!("status should parse: {err}"))
        .unwrap_or_else(|| panic!("status should be present"));
    let ids = vec![String::from("i-1"), String::from("i-2")];
    let addresses = aws
        .instance_addresses(&ids)
        .await
        .unwrap_or_else(|err| panic!("addresses should parse: {err}"));

    assert!(status.is_ready());
    assert_eq!(addresses[0].public_dns.as_deref(), Some("ec2-1.example"));
    assert_eq!(addresses[1].public_dns, None);
    assert_eq!(addresses[1].private_ip.as_deref(), Some("10.0.0.2"));
}

#[rstest]
#[tokio::test]
async fn datastore_endpoint_requires_an_address(settings: AwsCliSettings) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), r#"{"DBInstances":[{"Endpoint":{"Address":"db.example","Port":5432}}]}"#, "");
    runner.push_output(Some(0), r#"{"DBInstances":[]}"#, "");
    let aws = provider(settings, &runner);

    let endpoint = aws
        .datastore_endpoint("db-1")
        .await
        .unwrap_or_else(|err| panic!("endpoint should parse: {err}"));
    let missing = aws.datastore_endpoint("db-1").await;

    assert_eq!(endpoint, "db.example");
    assert_eq!(
        missing,
        Err(ProviderError::NotFound {
            resource: String::from("database db-1")
        })
    );
}

#[rstest]
#[tokio::test]
async fn malformed_json_is_a_parse_error(settings: AwsCliSettings) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "not json", "");
    let aws = provider(settings, &runner);

    let err = aws
        .describe_stack_resources("Demo")
        .await
        .expect_err("parse should fail");

    assert!(matches!(err, ProviderError::Parse { ref operation, .. } if operation == "describe-stack-resources"));
}
