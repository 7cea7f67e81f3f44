//! BDD step definitions for the pipeline lifecycle.

use orka_runner::engine::Engine;
use orka_runner::lifecycle::{LifecycleController, LifecycleError};
use orka_runner::orka::OrkaError;
use orka_runner::test_support::{FakeDialer, ProcessBehaviour, SessionOp, VmCall};
use rstest_bdd_macros::{given, then, when};
use tokio_util::sync::CancellationToken;

use super::test_helpers::{Discard, LifecycleOutcome, LifecycleWorld, compile_pipeline};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a pipeline with steps \"{names}\"")]
fn pipeline_with_steps(lifecycle_world: &LifecycleWorld, names: String) {
    let list: Vec<&str> = names.split(',').map(str::trim).collect();
    lifecycle_world.spec.replace(compile_pipeline(&list));
}

#[given("the farm has no capacity for \"{count}\" deploys")]
fn no_capacity(lifecycle_world: &LifecycleWorld, count: u32) {
    lifecycle_world
        .api
        .replace_with(|api| api.clone().fail_deploys(count, OrkaError::InsufficientCapacity));
}

#[given("every step exits with code \"{code}\"")]
fn steps_exit_with(lifecycle_world: &LifecycleWorld, code: i32) {
    lifecycle_world
        .session
        .replace_with(|session| session.clone().behaviour(ProcessBehaviour::Exit(code)));
}

#[given("the VM configuration is rejected")]
fn configuration_rejected(lifecycle_world: &LifecycleWorld) {
    lifecycle_world.api.replace_with(|api| {
        api.clone().fail_create(OrkaError::Api {
            messages: vec![String::from("Invalid base image")],
        })
    });
}

#[when("the pipeline runs")]
fn pipeline_runs(lifecycle_world: &LifecycleWorld) -> Result<(), StepError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    let api = lifecycle_world.api.borrow().clone();
    let dialer = FakeDialer::with_session(lifecycle_world.session.borrow().clone());
    let controller = LifecycleController::new(Engine::new(api, dialer));
    let mut spec = lifecycle_world.spec.borrow().clone();

    let result = runtime.block_on(async {
        controller
            .execute(&mut spec, &Discard, &CancellationToken::new())
            .await
    });
    let outcome = match result {
        Ok(report) => LifecycleOutcome::Completed(report),
        Err(err @ LifecycleError::Setup { .. }) => LifecycleOutcome::SetupFailed(err.to_string()),
        Err(err) => LifecycleOutcome::Failed(err.to_string()),
    };
    lifecycle_world.spec.replace(spec);
    lifecycle_world.outcome.replace(Some(outcome));
    Ok(())
}

#[then("the pipeline succeeds")]
fn pipeline_succeeds(lifecycle_world: &LifecycleWorld) -> Result<(), StepError> {
    match &*lifecycle_world.outcome.borrow() {
        Some(LifecycleOutcome::Completed(report)) if !report.failed() => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a successful pipeline, got {other:?}"
        ))),
    }
}

#[then("the pipeline reports a failure")]
fn pipeline_reports_failure(lifecycle_world: &LifecycleWorld) -> Result<(), StepError> {
    match &*lifecycle_world.outcome.borrow() {
        Some(LifecycleOutcome::Completed(report)) if report.failed() => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a failed pipeline report, got {other:?}"
        ))),
    }
}

#[then("the pipeline errors during setup")]
fn pipeline_errors_during_setup(lifecycle_world: &LifecycleWorld) -> Result<(), StepError> {
    match &*lifecycle_world.outcome.borrow() {
        Some(LifecycleOutcome::SetupFailed(message)) if message.contains("Invalid base image") => {
            Ok(())
        }
        other => Err(StepError::Assertion(format!(
            "expected a setup error, got {other:?}"
        ))),
    }
}

#[then("step \"{name}\" exited with code \"{code}\"")]
fn step_exited_with(
    lifecycle_world: &LifecycleWorld,
    name: String,
    code: i32,
) -> Result<(), StepError> {
    let outcome = lifecycle_world.outcome.borrow();
    let Some(LifecycleOutcome::Completed(report)) = &*outcome else {
        return Err(StepError::Assertion(String::from("pipeline did not complete")));
    };
    let state = report.step(&name).and_then(|step| step.state);
    if state.map(|state| state.exit_code) == Some(code) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {name} to exit with {code}, got {state:?}"
        )))
    }
}

#[then("step \"{name}\" was skipped")]
fn step_was_skipped(lifecycle_world: &LifecycleWorld, name: String) -> Result<(), StepError> {
    let outcome = lifecycle_world.outcome.borrow();
    let Some(LifecycleOutcome::Completed(report)) = &*outcome else {
        return Err(StepError::Assertion(String::from("pipeline did not complete")));
    };
    if report.step(&name).is_some_and(|step| step.skipped) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("expected {name} to be skipped")))
    }
}

#[then("the VM was deployed \"{count}\" times")]
fn vm_deployed(lifecycle_world: &LifecycleWorld, count: usize) -> Result<(), StepError> {
    let deploys = lifecycle_world
        .api
        .borrow()
        .count(|call| matches!(call, VmCall::Deploy(_)));
    if deploys == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} deploys, got {deploys}"
        )))
    }
}

#[then("the VM was purged \"{count}\" times")]
fn vm_purged(lifecycle_world: &LifecycleWorld, count: usize) -> Result<(), StepError> {
    let purges = lifecycle_world
        .api
        .borrow()
        .count(|call| matches!(call, VmCall::Delete(_)));
    if purges == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} purges, got {purges}"
        )))
    }
}

#[then("the workspace is created before any script is uploaded")]
fn workspace_before_scripts(lifecycle_world: &LifecycleWorld) -> Result<(), StepError> {
    let ops = lifecycle_world.session.borrow().ops();
    let workspace = ops
        .iter()
        .position(|op| *op == SessionOp::CreateDir(String::from("/tmp/source")));
    let first_write = ops
        .iter()
        .position(|op| matches!(op, SessionOp::Write(..)));
    match (workspace, first_write) {
        (Some(created), Some(written)) if created < written => Ok(()),
        _ => Err(StepError::Assertion(format!(
            "workspace must be created before scripts are written: {ops:?}"
        ))),
    }
}

#[then("the last remote command is \"{command}\"")]
fn last_remote_command(lifecycle_world: &LifecycleWorld, command: String) -> Result<(), StepError> {
    let ops = lifecycle_world.session.borrow().ops();
    let last = ops.iter().rev().find_map(|op| match op {
        SessionOp::Start(started) => Some(started.clone()),
        _ => None,
    });
    if last.as_deref() == Some(command.as_str()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected last command {command}, got {last:?}"
        )))
    }
}
