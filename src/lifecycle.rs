//! Orchestrates a full pipeline run against a [`Runtime`].
//!
//! The controller sets the VM up once, runs each step in order while honouring
//! its run policy, and tears the VM down afterwards. Teardown is attempted on
//! every exit path; when it fails after an earlier failure the teardown error
//! is appended to the original message instead of replacing it.

use std::fmt::Display;
use std::io;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::{DestroyError, ExecError, Runtime, SetupError};
use crate::remote::OutputSink;
use crate::spec::{ExecutionState, Spec, Step};

/// Errors surfaced while executing a pipeline.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Raised when provisioning or workspace staging fails.
    #[error("pipeline setup failed: {message}")]
    Setup {
        /// Human-readable description of the failure.
        message: String,
        /// Underlying setup error.
        #[source]
        source: Box<SetupError>,
    },
    /// Raised when a step could not be executed to completion.
    #[error("step {step} failed: {message}")]
    Step {
        /// Name of the failing step.
        step: String,
        /// Human-readable description of the failure.
        message: String,
        /// Underlying execution error.
        #[source]
        source: Box<ExecError>,
    },
    /// Raised when teardown fails after every step completed.
    #[error(transparent)]
    Teardown(#[from] DestroyError),
}

/// Hands each step its own output sink.
pub trait OutputFactory: Send + Sync {
    /// Returns the writer that receives the combined output of `step`.
    fn output_for(&self, step: &Step) -> OutputSink;
}

/// Streams every step's output to standard output.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutOutputs;

impl OutputFactory for StdoutOutputs {
    fn output_for(&self, _step: &Step) -> OutputSink {
        Box::new(io::stdout())
    }
}

/// Outcome of one pipeline step.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StepReport {
    /// Step name.
    pub name: String,
    /// Execution result; `None` when the step was skipped.
    pub state: Option<ExecutionState>,
    /// Whether the run policy skipped the step.
    pub skipped: bool,
}

impl StepReport {
    fn ran(name: &str, state: ExecutionState) -> Self {
        Self {
            name: name.to_owned(),
            state: Some(state),
            skipped: false,
        }
    }

    fn skipped(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            state: None,
            skipped: true,
        }
    }
}

/// Per-step outcomes of a completed pipeline.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PipelineReport {
    /// Reports in step order.
    pub steps: Vec<StepReport>,
}

impl PipelineReport {
    /// Returns `true` when any executed step exited nonzero.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.steps
            .iter()
            .filter_map(|step| step.state)
            .any(|state| !state.is_success())
    }

    /// Returns the report for the named step.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|step| step.name == name)
    }
}

/// Executes pipelines using the provided runtime.
#[derive(Debug)]
pub struct LifecycleController<R> {
    runtime: R,
}

impl<R: Runtime> LifecycleController<R> {
    /// Creates a new controller.
    #[must_use]
    pub const fn new(runtime: R) -> Self {
        Self { runtime }
    }

    /// Runs setup, every eligible step, and teardown.
    ///
    /// A nonzero step exit marks the pipeline failed and gates later steps
    /// through their run policy; it is reported, not raised.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when setup fails, when a step cannot be
    /// executed, or when teardown fails after an otherwise clean run.
    pub async fn execute(
        &self,
        spec: &mut Spec,
        outputs: &dyn OutputFactory,
        cancel: &CancellationToken,
    ) -> Result<PipelineReport, LifecycleError> {
        if let Err(err) = self.runtime.setup(spec, cancel).await {
            let message = self.destroy_with_note(spec, &err).await;
            return Err(LifecycleError::Setup {
                message,
                source: Box::new(err),
            });
        }

        let mut report = PipelineReport::default();
        let mut failed = false;
        for step in &spec.steps {
            if !step.run_policy.should_run(failed) {
                info!(step = %step.name, policy = ?step.run_policy, "step skipped");
                report.steps.push(StepReport::skipped(&step.name));
                continue;
            }

            info!(step = %step.name, "step started");
            match self
                .runtime
                .run(spec, step, outputs.output_for(step), cancel)
                .await
            {
                Ok(state) => {
                    info!(step = %step.name, exit_code = state.exit_code, "step finished");
                    failed |= !state.is_success();
                    report.steps.push(StepReport::ran(&step.name, state));
                }
                Err(err) => {
                    let message = self.destroy_with_note(spec, &err).await;
                    return Err(LifecycleError::Step {
                        step: step.name.clone(),
                        message,
                        source: Box::new(err),
                    });
                }
            }
        }

        if let Err(err) = self.runtime.destroy(spec).await {
            if !failed {
                return Err(LifecycleError::Teardown(err));
            }
            warn!(id = %spec.name, error = %err, "teardown failed after pipeline failure");
        }
        Ok(report)
    }

    async fn destroy_with_note<E: Display>(&self, spec: &Spec, err: &E) -> String {
        let teardown_error = self.runtime.destroy(spec).await.err();
        if let Some(teardown) = teardown_error.as_ref() {
            warn!(id = %spec.name, error = %teardown, "teardown failed");
        }
        append_teardown_note(err.to_string(), teardown_error.as_ref())
    }
}

fn append_teardown_note<E: Display>(message: String, teardown_error: Option<&E>) -> String {
    let Some(teardown) = teardown_error else {
        return message;
    };
    format!("{message} (teardown also failed: {teardown})")
}
