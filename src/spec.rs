//! Pipeline specification consumed by the execution engine.
//!
//! A [`Spec`] describes one pipeline run: the VM to provision, the global
//! files staged before any step runs, and the ordered list of [`Step`]s. The
//! compiler produces it; the engine only reads it, apart from the network
//! address recorded once the VM becomes reachable.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Compute and authentication settings for the pipeline VM.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Settings {
    /// Base image the VM configuration is cloned from.
    pub image: String,
    /// CPU core count; applied to both the CPU and VCPU request fields.
    pub compute: u32,
    /// Remote shell user name.
    pub username: String,
    /// Remote shell password.
    pub password: String,
}

impl Settings {
    /// Returns the credentials used to dial the VM.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

/// Password credentials for the remote shell.
#[derive(Clone, Eq, PartialEq)]
pub struct Credentials {
    /// User name presented during authentication.
    pub username: String,
    /// Password presented during authentication.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A directory to create or a file to upload on the VM.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct File {
    /// Absolute path on the VM.
    pub path: String,
    /// Permission bits applied after the entry is created.
    pub mode: u32,
    /// Whether the entry is a directory.
    #[serde(default)]
    pub is_dir: bool,
    /// File content; always empty for directories.
    #[serde(default)]
    pub data: Vec<u8>,
}

impl File {
    /// Describes a directory entry.
    #[must_use]
    pub fn dir(path: impl Into<String>, mode: u32) -> Self {
        Self {
            path: path.into(),
            mode,
            is_dir: true,
            data: Vec::new(),
        }
    }

    /// Describes a regular file entry.
    #[must_use]
    pub fn file(path: impl Into<String>, mode: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            mode,
            is_dir: false,
            data: data.into(),
        }
    }
}

/// A secret already resolved by the compiler.
#[derive(Clone, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Secret {
    /// Name of the secret in the secret store.
    pub name: String,
    /// Environment variable the secret is exported as.
    pub env: String,
    /// Resolved secret value.
    #[serde(default)]
    pub data: Vec<u8>,
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("env", &self.env)
            .field("data", &"<redacted>")
            .finish()
    }
}

/// Rule deciding whether a step runs given the outcome of earlier steps.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunPolicy {
    /// Run regardless of earlier failures.
    Always,
    /// Run only while no earlier step has failed.
    #[default]
    OnSuccess,
    /// Run only once an earlier step has failed.
    OnFailure,
    /// Never run.
    Never,
}

impl RunPolicy {
    /// Returns `true` when a step with this policy should execute.
    #[must_use]
    pub const fn should_run(self, pipeline_failed: bool) -> bool {
        match self {
            Self::Always => true,
            Self::OnSuccess => !pipeline_failed,
            Self::OnFailure => pipeline_failed,
            Self::Never => false,
        }
    }
}

/// One unit of remote execution.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Step {
    /// Step name, unique within the pipeline.
    pub name: String,
    /// Program to invoke.
    pub command: String,
    /// Arguments joined onto the command line.
    #[serde(default)]
    pub args: Vec<String>,
    /// Directory the step script changes into before running.
    #[serde(default)]
    pub working_dir: String,
    /// Plain environment variables.
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    /// Secrets exported ahead of the plain environment.
    #[serde(default)]
    pub secrets: Vec<Secret>,
    /// Files uploaded before the command runs, usually the step script.
    #[serde(default)]
    pub files: Vec<File>,
    /// Run policy computed by the compiler.
    #[serde(default)]
    pub run_policy: RunPolicy,
    /// Names of the steps this step depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl Step {
    /// Renders the command line sent to the remote shell.
    #[must_use]
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            return self.command.clone();
        }
        format!("{} {}", self.command, self.args.join(" "))
    }
}

/// Specification of one pipeline run.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Spec {
    /// Unique run name, also used as the VM name.
    pub name: String,
    /// VM compute and authentication settings.
    pub settings: Settings,
    /// Global directories and files staged during setup.
    #[serde(default)]
    pub files: Vec<File>,
    /// Ordered pipeline steps.
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(skip)]
    address: Option<String>,
}

impl Spec {
    /// Creates a specification with no files or steps.
    #[must_use]
    pub fn new(name: impl Into<String>, settings: Settings) -> Self {
        Self {
            name: name.into(),
            settings,
            files: Vec::new(),
            steps: Vec::new(),
            address: None,
        }
    }

    /// Returns the `ip:port` address recorded once the VM was deployed.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Records the deployed VM address, replacing any earlier value from a
    /// previous provisioning attempt.
    pub(crate) fn record_address(&mut self, address: String) {
        self.address = Some(address);
    }
}

/// Outcome of a step that ran to completion.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ExecutionState {
    /// Remote exit status; 255 when the session failed mid-command.
    pub exit_code: i32,
    /// Whether the process exited.
    pub exited: bool,
    /// Reserved; never set by this engine.
    pub oom_killed: bool,
}

impl ExecutionState {
    /// Builds the state of a process that exited with `code`.
    #[must_use]
    pub const fn exited_with(code: i32) -> Self {
        Self {
            exit_code: code,
            exited: true,
            oom_killed: false,
        }
    }

    /// Returns `true` when the exit status is zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}
