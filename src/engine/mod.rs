//! Setup, run, destroy and ping for pipelines executed on Orka VMs.
//!
//! [`Runtime`] is the capability set the lifecycle controller drives.
//! [`Engine`] implements it on top of a [`VmApi`] and a [`Dialer`]:
//! setup provisions the VM and stages the global files, each run dials the
//! VM afresh to execute one step, and destroy purges the VM.

mod connect;
mod error;
mod exec;
mod preamble;
mod provision;
mod stage;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::orka::OrkaError;
use crate::remote::{Dialer, OutputSink};
use crate::spec::{ExecutionState, Spec, Step};
use crate::vm::VmApi;

pub use error::{ConnectError, DestroyError, ExecError, ProvisionError, SetupError, StageError};
pub use exec::PROTOCOL_FAILURE_EXIT_CODE;
pub use provision::{Disposition, classify_api_error};

const DEPLOY_BUDGET: Duration = Duration::from_secs(60 * 60);
const DEPLOY_BACKOFF: Duration = Duration::from_secs(60);
const CONNECT_BUDGET: Duration = Duration::from_secs(10 * 60);
const CONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Future returned by [`Runtime`] operations.
pub type RuntimeFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Operations a pipeline runtime offers to the lifecycle controller.
pub trait Runtime: Send + Sync {
    /// Provisions the VM for `spec` and stages its global files.
    fn setup<'a>(
        &'a self,
        spec: &'a mut Spec,
        cancel: &'a CancellationToken,
    ) -> RuntimeFuture<'a, (), SetupError>;

    /// Runs one step, streaming its output into `output`.
    ///
    /// A nonzero remote exit is a result, not an error.
    fn run<'a>(
        &'a self,
        spec: &'a Spec,
        step: &'a Step,
        output: OutputSink,
        cancel: &'a CancellationToken,
    ) -> RuntimeFuture<'a, ExecutionState, ExecError>;

    /// Purges the VM. A no-op when no address was ever recorded.
    fn destroy<'a>(&'a self, spec: &'a Spec) -> RuntimeFuture<'a, (), DestroyError>;

    /// Checks that the VM API accepts the configured token.
    fn ping(&self) -> RuntimeFuture<'_, (), OrkaError>;
}

/// Waits and budgets used while provisioning.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timings {
    /// Total time allowed for deploy-and-connect retries.
    pub deploy_budget: Duration,
    /// Pause between deploy attempts after a transient failure.
    pub deploy_backoff: Duration,
    /// Total time allowed for dialling a deployed VM.
    pub connect_budget: Duration,
    /// Pause between dial attempts.
    pub connect_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            deploy_budget: DEPLOY_BUDGET,
            deploy_backoff: DEPLOY_BACKOFF,
            connect_budget: CONNECT_BUDGET,
            connect_interval: CONNECT_INTERVAL,
        }
    }
}

/// Runtime backed by the Orka API and a remote shell dialer.
#[derive(Debug)]
pub struct Engine<A, D> {
    api: A,
    dialer: D,
    timings: Timings,
}

impl<A, D> Engine<A, D>
where
    A: VmApi,
    D: Dialer,
{
    /// Creates an engine with the default timings.
    #[must_use]
    pub fn new(api: A, dialer: D) -> Self {
        Self {
            api,
            dialer,
            timings: Timings::default(),
        }
    }

    /// Overrides the provisioning budget.
    #[must_use]
    pub const fn with_deploy_budget(mut self, budget: Duration) -> Self {
        self.timings.deploy_budget = budget;
        self
    }

    /// Overrides the pause between deploy attempts.
    #[must_use]
    pub const fn with_deploy_backoff(mut self, backoff: Duration) -> Self {
        self.timings.deploy_backoff = backoff;
        self
    }

    /// Overrides the connection budget.
    #[must_use]
    pub const fn with_connect_budget(mut self, budget: Duration) -> Self {
        self.timings.connect_budget = budget;
        self
    }

    /// Overrides the pause between dial attempts.
    #[must_use]
    pub const fn with_connect_interval(mut self, interval: Duration) -> Self {
        self.timings.connect_interval = interval;
        self
    }

    /// Returns the timings in effect.
    #[must_use]
    pub const fn timings(&self) -> Timings {
        self.timings
    }

    async fn setup_inner(
        &self,
        spec: &mut Spec,
        cancel: &CancellationToken,
    ) -> Result<(), SetupError> {
        let mut session = self.provision(spec, cancel).await?;
        let files = spec.files.clone();
        tokio::task::spawn_blocking(move || stage::stage(&mut session, &files))
            .await
            .map_err(|err| StageError::Interrupted {
                message: err.to_string(),
            })??;
        info!(id = %spec.name, ip = spec.address().unwrap_or_default(), "vm ready");
        Ok(())
    }

    async fn destroy_inner(&self, spec: &Spec) -> Result<(), DestroyError> {
        if spec.address().is_none() {
            debug!(id = %spec.name, "nothing provisioned, skipping destroy");
            return Ok(());
        }
        self.api
            .delete(&spec.name)
            .await
            .map_err(|source| DestroyError {
                name: spec.name.clone(),
                source,
            })?;
        debug!(id = %spec.name, "vm purged");
        Ok(())
    }

    async fn ping_inner(&self) -> Result<(), OrkaError> {
        let token = self.api.check_token().await?;
        if token.is_valid() {
            return Ok(());
        }
        Err(OrkaError::InvalidToken {
            authenticated: token.authenticated,
            revoked: token.is_token_revoked,
        })
    }
}

impl<A, D> Runtime for Engine<A, D>
where
    A: VmApi,
    D: Dialer,
{
    fn setup<'a>(
        &'a self,
        spec: &'a mut Spec,
        cancel: &'a CancellationToken,
    ) -> RuntimeFuture<'a, (), SetupError> {
        Box::pin(self.setup_inner(spec, cancel))
    }

    fn run<'a>(
        &'a self,
        spec: &'a Spec,
        step: &'a Step,
        output: OutputSink,
        cancel: &'a CancellationToken,
    ) -> RuntimeFuture<'a, ExecutionState, ExecError> {
        Box::pin(self.run_step(spec, step, output, cancel))
    }

    fn destroy<'a>(&'a self, spec: &'a Spec) -> RuntimeFuture<'a, (), DestroyError> {
        Box::pin(self.destroy_inner(spec))
    }

    fn ping(&self) -> RuntimeFuture<'_, (), OrkaError> {
        Box::pin(self.ping_inner())
    }
}
