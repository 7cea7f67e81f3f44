//! Binary entry point for the Orka pipeline runner.

use std::io::{self, Write};
use std::process;

use camino::Utf8Path;
use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use orka_runner::compiler::{CompileError, Compiler};
use orka_runner::config::{ConfigError, RunnerConfig};
use orka_runner::engine::{Engine, Runtime};
use orka_runner::lifecycle::{LifecycleController, LifecycleError, PipelineReport, StdoutOutputs};
use orka_runner::logging::{self, LogFormat, LoggingError};
use orka_runner::manifest::{self, ManifestError};
use orka_runner::names::RandomNames;
use orka_runner::orka::{OrkaClient, OrkaError, StatusResponse};
use orka_runner::remote::SshDialer;
use orka_runner::spec::Spec;
use orka_runner::vm::VmApi;

mod cli;

use cli::{Cli, Command};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("logging error: {0}")]
    Logging(#[from] LoggingError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("invalid pipeline: {0}")]
    Compile(#[from] CompileError),
    #[error("pipeline failed: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("orka api error: {0}")]
    Api(#[from] OrkaError),
    #[error("failed to encode specification: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let format: LogFormat = cli.log_format.parse()?;
    logging::init(format)?;

    match cli.command {
        Command::Compile(args) => {
            let config = RunnerConfig::load_without_cli_args()?;
            let spec = compile(&config, Utf8Path::new(&args.pipeline))?;
            let rendered = serde_json::to_string_pretty(&spec)?;
            writeln!(io::stdout(), "{rendered}")?;
            Ok(0)
        }
        Command::Run(args) => {
            let config = load_config()?;
            let mut spec = compile(&config, Utf8Path::new(&args.pipeline))?;
            execute(&config, &mut spec).await
        }
        Command::Exec(args) => {
            let config = load_config()?;
            let mut spec = manifest::load_spec(Utf8Path::new(&args.spec))?;
            execute(&config, &mut spec).await
        }
        Command::Ping => {
            let config = load_config()?;
            let engine = Engine::new(client(&config), SshDialer::new());
            engine.ping().await?;
            writeln!(io::stdout(), "orka api at {} accepted the token", config.endpoint)?;
            Ok(0)
        }
        Command::Status(args) => {
            let config = load_config()?;
            let status = client(&config).status(&args.name).await?;
            write_status(io::stdout(), &status)?;
            Ok(0)
        }
    }
}

fn load_config() -> Result<RunnerConfig, CliError> {
    let config = RunnerConfig::load_without_cli_args()?;
    config.validate()?;
    Ok(config)
}

fn client(config: &RunnerConfig) -> OrkaClient {
    OrkaClient::new(&config.endpoint, &config.token).with_dump(config.debug_http)
}

fn compile(config: &RunnerConfig, path: &Utf8Path) -> Result<Spec, CliError> {
    let document = manifest::load_pipeline(path)?;
    let mut compiler = Compiler::new(config.compiler_settings()?, RandomNames::new());
    Ok(compiler.compile(&document)?)
}

async fn execute(config: &RunnerConfig, spec: &mut Spec) -> Result<i32, CliError> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling pipeline");
            on_signal.cancel();
        }
    });

    let controller = LifecycleController::new(Engine::new(client(config), SshDialer::new()));
    let report = controller.execute(spec, &StdoutOutputs, &cancel).await?;
    log_report(&spec.name, &report);
    Ok(exit_code(&report))
}

fn log_report(name: &str, report: &PipelineReport) {
    for step in &report.steps {
        let Some(state) = step.state else {
            info!(id = %name, step = %step.name, "skipped");
            continue;
        };
        info!(id = %name, step = %step.name, exit_code = state.exit_code, "completed");
    }
}

fn exit_code(report: &PipelineReport) -> i32 {
    i32::from(report.failed())
}

fn write_status(mut target: impl Write, status: &StatusResponse) -> io::Result<()> {
    if status.virtual_machine_resources.is_empty() {
        return writeln!(target, "no such vm");
    }
    for resource in &status.virtual_machine_resources {
        writeln!(
            target,
            "{}\t{}",
            resource.virtual_machine_name, resource.vm_deployment_status
        )?;
        for node in &resource.status {
            writeln!(
                target,
                "  {}\t{}:{}\t{}",
                node.node_location, node.virtual_machine_ip, node.ssh_port, node.vm_status
            )?;
        }
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
