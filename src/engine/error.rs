//! Errors surfaced by the provisioning engine.

use std::time::Duration;

use thiserror::Error;

use crate::orka::OrkaError;
use crate::remote::RemoteError;

/// Errors raised while provisioning a VM.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The VM configuration could not be registered.
    #[error("failed to register VM configuration {name}: {source}")]
    Config {
        /// VM name.
        name: String,
        /// API error.
        #[source]
        source: OrkaError,
    },
    /// Deployment failed with an error that is not worth retrying.
    #[error("failed to deploy VM {name}: {source}")]
    Deploy {
        /// VM name.
        name: String,
        /// API error.
        #[source]
        source: OrkaError,
    },
    /// The deployed VM never accepted a remote shell connection.
    #[error("failed to connect to VM {name}: {source}")]
    Connect {
        /// VM name.
        name: String,
        /// Connection error.
        #[source]
        source: ConnectError,
    },
    /// The provisioning budget ran out while retrying transient failures.
    #[error("VM {name} was not provisioned within {}s (last error: {last_error})", .budget.as_secs())]
    DeadlineExceeded {
        /// VM name.
        name: String,
        /// Budget that elapsed.
        budget: Duration,
        /// Text of the last transient failure.
        last_error: String,
    },
    /// The caller cancelled provisioning.
    #[error("provisioning cancelled")]
    Cancelled,
}

/// Errors raised while dialling a deployed VM.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Every dial within the connection budget failed.
    #[error("no connection to {address} after {attempts} attempts: {source}")]
    Exhausted {
        /// Address that was dialled.
        address: String,
        /// Number of dial attempts made.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        source: RemoteError,
    },
    /// The caller cancelled the connection attempts.
    #[error("connection attempts cancelled")]
    Cancelled,
}

/// Errors raised while staging files onto the VM.
#[derive(Debug, Error)]
pub enum StageError {
    /// A directory could not be created.
    #[error("failed to create directory {path}: {source}")]
    Directory {
        /// Remote directory path.
        path: String,
        /// Transfer error.
        #[source]
        source: RemoteError,
    },
    /// A file could not be written.
    #[error("failed to upload {path}: {source}")]
    Upload {
        /// Remote file path.
        path: String,
        /// Transfer error.
        #[source]
        source: RemoteError,
    },
    /// Permission bits could not be applied.
    #[error("failed to set mode {mode:o} on {path}: {source}")]
    Permissions {
        /// Remote path.
        path: String,
        /// Requested permission bits.
        mode: u32,
        /// Transfer error.
        #[source]
        source: RemoteError,
    },
    /// The blocking staging task did not complete.
    #[error("staging task failed: {message}")]
    Interrupted {
        /// Join error text.
        message: String,
    },
}

/// Errors raised by [`crate::engine::Runtime::setup`].
#[derive(Debug, Error)]
pub enum SetupError {
    /// Provisioning failed.
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    /// Global files could not be staged.
    #[error("workspace staging failed: {0}")]
    Stage(#[from] StageError),
}

/// Errors raised while running a step.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The step ran before setup recorded a VM address.
    #[error("step {step} cannot run: no VM address has been recorded")]
    NotProvisioned {
        /// Step name.
        step: String,
    },
    /// The step's own connection could not be established.
    #[error("step connection failed: {0}")]
    Connect(#[source] RemoteError),
    /// The step's session could not open a channel for the command.
    #[error("step session failed: {0}")]
    Session(#[source] RemoteError),
    /// Step files could not be staged.
    #[error("step staging failed: {0}")]
    Stage(#[from] StageError),
    /// A secret value is not valid UTF-8 and cannot be exported verbatim.
    #[error("secret {name} is not valid UTF-8")]
    InvalidSecret {
        /// Secret name.
        name: String,
    },
    /// An environment or secret name cannot be exported by a POSIX shell.
    #[error("invalid environment variable name {name:?}")]
    InvalidVariable {
        /// Offending name.
        name: String,
    },
    /// The caller cancelled the step.
    #[error("step cancelled")]
    Cancelled,
    /// The blocking execution task did not complete.
    #[error("step task failed: {message}")]
    Interrupted {
        /// Join error text.
        message: String,
    },
}

/// Raised when the VM could not be purged.
#[derive(Debug, Error)]
#[error("failed to destroy VM {name}: {source}")]
pub struct DestroyError {
    /// VM name.
    pub name: String,
    /// API error.
    #[source]
    pub source: OrkaError,
}
