//! BDD step definitions for `upkeep start` and `upkeep stop`.

use rstest_bdd_macros::{given, then, when};
use tokio::runtime::{Builder, Runtime};
use upkeep::manifest::RunManifest;
use upkeep::orchestrator::{RolloutOrchestrator, StackTeardown};
use upkeep::provider::HealthState;
use upkeep::session::SessionFactory;
use upkeep::test_support::{rollout_provider, session_config};

use super::test_helpers::{FailureKind, RolloutContext, RolloutResult};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn paused_runtime() -> Result<Runtime, StepError> {
    Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .map_err(|err| StepError::Assertion(format!("runtime: {err}")))
}

#[given("a provisioned stack with \"{count}\" hosts")]
fn provisioned_stack(rollout_context: &mut RolloutContext, count: usize) {
    rollout_context.provider = rollout_provider(count);
}

#[given("restore from backups is enabled")]
fn restore_enabled(rollout_context: &mut RolloutContext) {
    rollout_context.config.restore_enabled = true;
}

#[given("restore from backups is disabled")]
fn restore_disabled(rollout_context: &mut RolloutContext) {
    rollout_context.config.restore_enabled = false;
}

#[given("stack creation rolls back")]
fn creation_rolls_back(rollout_context: &mut RolloutContext) {
    rollout_context.provider.script_creation(
        &rollout_context.config.stack_name,
        &["CREATE_IN_PROGRESS", "ROLLBACK_IN_PROGRESS", "ROLLBACK_COMPLETE"],
    );
}

#[given("the service on \"{host}\" fails to stop")]
fn service_fails_to_stop(rollout_context: &mut RolloutContext, host: String) {
    rollout_context
        .runner
        .respond_always(&format!("ec2-user@{host} (sudo"), 1);
}

#[given("instance \"{instance}\" stays out of service")]
fn instance_out_of_service(rollout_context: &mut RolloutContext, instance: String) {
    rollout_context
        .provider
        .script_health(&[&[(instance.as_str(), HealthState::OutOfService)]]);
}

#[given("instance \"{instance}\" is still booting")]
fn instance_still_booting(rollout_context: &mut RolloutContext, instance: String) {
    rollout_context
        .provider
        .script_instance(&instance, &[("pending", "initializing"), ("running", "ok")]);
    rollout_context.provider.publish_dns_once_running(&instance);
}

#[given("the stack already exists")]
fn stack_exists(rollout_context: &mut RolloutContext) {
    rollout_context
        .provider
        .seed_stack(&rollout_context.config.stack_name, &["CREATE_COMPLETE"]);
}

#[when("I start the rollout")]
fn start_rollout(rollout_context: &mut RolloutContext) -> Result<(), StepError> {
    let runtime = paused_runtime()?;
    let sessions = SessionFactory::new(session_config(), rollout_context.runner.clone())
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    let orchestrator = RolloutOrchestrator::new(
        rollout_context.config.clone(),
        RunManifest::default(),
        rollout_context.provider.clone(),
        sessions,
        rollout_context.probe.clone(),
    );

    let outcome = match runtime.block_on(orchestrator.start()) {
        Ok(summary) => RolloutResult::Started {
            hosts: summary.hosts,
            base_url: summary.base_url,
        },
        Err(err) => RolloutResult::Failure {
            kind: FailureKind::of(&err),
            message: err.to_string(),
        },
    };

    rollout_context.outcome = Some(outcome);
    Ok(())
}

#[when("I stop the stack")]
fn stop_stack(rollout_context: &mut RolloutContext) -> Result<(), StepError> {
    let runtime = paused_runtime()?;
    let teardown = StackTeardown::new(
        rollout_context.provider.clone(),
        rollout_context.config.stack_name.clone(),
    );

    let outcome = match runtime.block_on(teardown.execute()) {
        Ok(status) => RolloutResult::Stopped(status),
        Err(err) => RolloutResult::Failure {
            kind: FailureKind::of(&err),
            message: err.to_string(),
        },
    };

    rollout_context.outcome = Some(outcome);
    Ok(())
}

#[then("the rollout succeeds")]
fn rollout_succeeds(rollout_context: &RolloutContext) -> Result<(), StepError> {
    match rollout_context.outcome {
        Some(RolloutResult::Started { .. }) => Ok(()),
        Some(RolloutResult::Failure { ref message, .. }) => Err(StepError::Assertion(format!(
            "expected success, got failure: {message}"
        ))),
        ref other => Err(StepError::Assertion(format!(
            "expected a started rollout, got {other:?}"
        ))),
    }
}

#[then("the rollout fails at the \"{step}\" step")]
fn rollout_fails_at(rollout_context: &RolloutContext, step: String) -> Result<(), StepError> {
    let expected = FailureKind::parse(&step);
    match rollout_context.outcome {
        Some(RolloutResult::Failure { kind, ref message }) if kind == expected => {
            if message.is_empty() {
                return Err(StepError::Assertion(String::from(
                    "failure message should not be empty",
                )));
            }
            Ok(())
        }
        ref other => Err(StepError::Assertion(format!(
            "expected failure at {step}, got {other:?}"
        ))),
    }
}

#[then("the datastore is restored exactly once")]
fn restored_once(rollout_context: &RolloutContext) -> Result<(), StepError> {
    let restores = rollout_context.runner.count_containing("pg_restore");
    if restores == 1 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected one datastore restore, saw {restores}"
        )))
    }
}

#[then("the datastore is never restored")]
fn never_restored(rollout_context: &RolloutContext) -> Result<(), StepError> {
    let restores = rollout_context.runner.count_containing("pg_restore");
    if restores == 0 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no datastore restore, saw {restores}"
        )))
    }
}

#[then("every host is restarted")]
fn every_host_restarted(rollout_context: &RolloutContext) -> Result<(), StepError> {
    let Some(RolloutResult::Started { ref hosts, .. }) = rollout_context.outcome else {
        return Err(StepError::Assertion(String::from("rollout did not start")));
    };
    for host in hosts {
        let starts = rollout_context
            .runner
            .count_containing(&format!("ec2-user@{host} sudo su -c"));
        if starts != 1 {
            return Err(StepError::Assertion(format!(
                "expected one start on {host}, saw {starts}"
            )));
        }
    }
    Ok(())
}

#[then("no remote session is opened")]
fn no_remote_session(rollout_context: &RolloutContext) -> Result<(), StepError> {
    let lines = rollout_context.runner.command_lines();
    if lines.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no ssh or scp invocations, saw {lines:?}"
        )))
    }
}

#[then("the hosts file lists \"{count}\" hosts")]
fn hosts_file_lists(rollout_context: &RolloutContext, count: usize) -> Result<(), StepError> {
    let contents = rollout_context
        .read_output("hosts")
        .ok_or_else(|| StepError::Assertion(String::from("hosts file was not written")))?;
    let expected: Vec<String> = (1..=count).map(|n| format!("h{n}.example")).collect();
    let listed: Vec<String> = contents.lines().map(str::to_owned).collect();
    if listed == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected hosts {expected:?}, found {listed:?}"
        )))
    }
}

#[then("the base URL file holds the balancer address")]
fn base_url_recorded(rollout_context: &RolloutContext) -> Result<(), StepError> {
    let Some(RolloutResult::Started { ref base_url, .. }) = rollout_context.outcome else {
        return Err(StepError::Assertion(String::from("rollout did not start")));
    };
    match rollout_context.read_output("baseurl") {
        Some(ref recorded) if recorded == base_url && base_url == "jira-lb.elb.example" => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected base URL {base_url}, found {other:?}"
        ))),
    }
}

#[then("the base URL file is absent")]
fn base_url_absent(rollout_context: &RolloutContext) -> Result<(), StepError> {
    match rollout_context.read_output("baseurl") {
        None => Ok(()),
        Some(contents) => Err(StepError::Assertion(format!(
            "base URL file should not exist, found {contents:?}"
        ))),
    }
}

#[then("the stack is gone")]
fn stack_is_gone(rollout_context: &RolloutContext) -> Result<(), StepError> {
    match rollout_context.outcome {
        Some(RolloutResult::Stopped(ref status)) if status.is_gone() => Ok(()),
        ref other => Err(StepError::Assertion(format!(
            "expected the stack to be deleted, got {other:?}"
        ))),
    }
}
