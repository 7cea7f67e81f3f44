//! BDD scenarios for the pipeline lifecycle.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LifecycleWorld, lifecycle_world};

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Retry deployment through a capacity shortage"
)]
fn scenario_capacity_retry(lifecycle_world: LifecycleWorld) {
    drop(lifecycle_world);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Stage the workspace before running step scripts"
)]
fn scenario_staging_order(lifecycle_world: LifecycleWorld) {
    drop(lifecycle_world);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Skip on-success steps after a nonzero exit"
)]
fn scenario_nonzero_exit(lifecycle_world: LifecycleWorld) {
    drop(lifecycle_world);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Abort when the VM configuration is rejected"
)]
fn scenario_rejected_configuration(lifecycle_world: LifecycleWorld) {
    drop(lifecycle_world);
}
