//! BDD scenarios for the rollout and teardown workflows.

use rstest_bdd_macros::scenario;

use super::test_helpers::{RolloutContext, rollout_context};

#[scenario(
    path = "tests/features/rollout.feature",
    name = "Roll out a stack and restore it from backups"
)]
fn scenario_rollout_with_restore(rollout_context: RolloutContext) {
    drop(rollout_context);
}

#[scenario(
    path = "tests/features/rollout.feature",
    name = "Skip the restore when it is disabled"
)]
fn scenario_rollout_without_restore(rollout_context: RolloutContext) {
    drop(rollout_context);
}

#[scenario(
    path = "tests/features/rollout.feature",
    name = "Wait for a booting host before recording its address"
)]
fn scenario_booting_host(rollout_context: RolloutContext) {
    drop(rollout_context);
}

#[scenario(
    path = "tests/features/rollout.feature",
    name = "Abort when stack creation rolls back"
)]
fn scenario_stack_rolls_back(rollout_context: RolloutContext) {
    drop(rollout_context);
}

#[scenario(
    path = "tests/features/rollout.feature",
    name = "Abort when a host cannot be stopped"
)]
fn scenario_stop_failure(rollout_context: RolloutContext) {
    drop(rollout_context);
}

#[scenario(
    path = "tests/features/rollout.feature",
    name = "Gate on balancer health before publishing the URL"
)]
fn scenario_balancer_health_gate(rollout_context: RolloutContext) {
    drop(rollout_context);
}

#[scenario(
    path = "tests/features/rollout.feature",
    name = "Tear down an existing stack"
)]
fn scenario_teardown(rollout_context: RolloutContext) {
    drop(rollout_context);
}
