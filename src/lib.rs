//! Core library for the Orka pipeline runner.
//!
//! The crate compiles CI pipeline documents into executable specifications
//! and runs them on short-lived Orka VMs. Provisioning retries through
//! capacity shortages and unreachable guests (deploy, wait for the remote
//! shell, purge and retry), each step runs over its own remote shell session,
//! and the VM is purged afterwards whatever the outcome.

pub mod compiler;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod logging;
pub mod manifest;
pub mod names;
pub mod orka;
pub mod remote;
pub mod spec;
pub mod test_support;
pub mod vm;

pub use compiler::{CompileError, Compiler, CompilerSettings, PipelineDocument};
pub use config::{ConfigError, RunnerConfig};
pub use engine::{Engine, ExecError, Runtime, SetupError};
pub use lifecycle::{LifecycleController, LifecycleError, OutputFactory, PipelineReport};
pub use orka::{OrkaClient, OrkaError};
pub use remote::{SshDialer, SshSession};
pub use spec::{ExecutionState, RunPolicy, Spec, Step};
pub use vm::VmApi;
