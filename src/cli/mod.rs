//! Command-line interface definitions for the `orka-runner` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Parser, Subcommand};

/// Top-level CLI for the `orka-runner` binary.
#[derive(Debug, Parser)]
#[command(
    name = "orka-runner",
    about = "Run CI pipeline steps on ephemeral Orka VMs",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log output format: `text` or `json`. The filter is read from `RUST_LOG`.
    #[arg(long, global = true, value_name = "FORMAT", default_value = "text")]
    pub(crate) log_format: String,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands offered by `orka-runner`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Compile a pipeline document and run it on a fresh VM.
    #[command(name = "run", about = "Compile a pipeline document and run it on a fresh VM")]
    Run(PipelineArgs),
    /// Run an already compiled specification.
    #[command(name = "exec", about = "Run an already compiled specification")]
    Exec(SpecArgs),
    /// Print the specification compiled from a pipeline document.
    #[command(
        name = "compile",
        about = "Print the specification compiled from a pipeline document"
    )]
    Compile(PipelineArgs),
    /// Check that the Orka API accepts the configured token.
    #[command(name = "ping", about = "Check that the Orka API accepts the configured token")]
    Ping,
    /// Report the deployment status of a VM.
    #[command(name = "status", about = "Report the deployment status of a VM")]
    Status(StatusArgs),
}

/// Arguments naming a pipeline document.
#[derive(Debug, Parser)]
pub(crate) struct PipelineArgs {
    /// Path to the pipeline document (JSON).
    #[arg(value_name = "PIPELINE")]
    pub(crate) pipeline: String,
}

/// Arguments naming a compiled specification.
#[derive(Debug, Parser)]
pub(crate) struct SpecArgs {
    /// Path to the compiled specification (JSON).
    #[arg(value_name = "SPEC")]
    pub(crate) spec: String,
}

/// Arguments for `orka-runner status`.
#[derive(Debug, Parser)]
pub(crate) struct StatusArgs {
    /// Name of the VM to query.
    #[arg(value_name = "NAME")]
    pub(crate) name: String,
}
