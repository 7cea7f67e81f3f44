//! Compiles a pipeline document into an executable [`Spec`].
//!
//! Each document step becomes a shell script staged under `/tmp/scripts` and
//! run with `/bin/sh -e` from the `/tmp/source` workspace. Secrets and
//! environment values arrive already resolved; the compiler only merges and
//! places them.

mod script;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::names::NameGenerator;
use crate::spec::{File, RunPolicy, Secret, Settings, Spec, Step};

use script::{clone_commands, script, slug};

/// Workspace directory the steps run in.
pub const SOURCE_DIR: &str = "/tmp/source";
/// Directory holding the generated step scripts.
pub const SCRIPT_DIR: &str = "/tmp/scripts";
/// Name of the generated clone step.
pub const CLONE_STEP: &str = "clone";

const DIR_MODE: u32 = 0o700;
const SCRIPT_MODE: u32 = 0o700;
const SHELL: &str = "/bin/sh";

/// Repository checkout performed before the pipeline steps.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct CloneSettings {
    /// Skips the clone step entirely.
    pub disable: bool,
    /// Remote URL to fetch from.
    pub remote: String,
    /// Target branch.
    pub branch: String,
    /// Commit to check out.
    pub commit: String,
    /// Git reference that triggered the pipeline.
    #[serde(rename = "ref")]
    pub reference: String,
}

/// One step as declared in a pipeline document.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct StepDocument {
    /// Step name.
    pub name: String,
    /// Shell commands run in order.
    pub commands: Vec<String>,
    /// Environment layered over the pipeline environment.
    pub environment: BTreeMap<String, String>,
    /// Secrets exported into the step.
    pub secrets: Vec<Secret>,
    /// Run policy; defaults to `on-success`.
    pub run_policy: Option<RunPolicy>,
    /// Names of the steps this step waits for.
    pub depends_on: Vec<String>,
}

/// A pipeline as read from a JSON document.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct PipelineDocument {
    /// VM image overriding the configured default.
    pub image: Option<String>,
    /// Environment shared by every step.
    pub environment: BTreeMap<String, String>,
    /// Repository checkout settings.
    pub clone: CloneSettings,
    /// Pipeline steps in declaration order.
    pub steps: Vec<StepDocument>,
}

/// Runner-wide defaults applied to every compiled pipeline.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CompilerSettings {
    /// Default VM image.
    pub image: String,
    /// CPU cores requested for each VM.
    pub compute: u32,
    /// Remote shell user.
    pub username: String,
    /// Remote shell password.
    pub password: String,
}

/// Errors raised while compiling a pipeline document.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum CompileError {
    /// A step uses the name reserved for the generated clone step.
    #[error("step name `{name}` is reserved for the repository checkout")]
    ReservedName {
        /// Offending step name.
        name: String,
    },
    /// Two steps would share one script file.
    #[error("steps `{first}` and `{second}` both compile to {path}")]
    DuplicateScript {
        /// Step declared first.
        first: String,
        /// Step declared later.
        second: String,
        /// Shared script path.
        path: String,
    },
}

/// Turns pipeline documents into specifications.
#[derive(Debug)]
pub struct Compiler<N> {
    settings: CompilerSettings,
    names: N,
}

impl<N: NameGenerator> Compiler<N> {
    /// Creates a compiler drawing VM names from `names`.
    #[must_use]
    pub const fn new(settings: CompilerSettings, names: N) -> Self {
        Self { settings, names }
    }

    /// Compiles `document` into a specification.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError`] when a step is named after the clone step or
    /// two steps would write the same script.
    pub fn compile(&mut self, document: &PipelineDocument) -> Result<Spec, CompileError> {
        check_step_names(&document.steps)?;
        let image = document
            .image
            .as_deref()
            .filter(|image| !image.is_empty())
            .unwrap_or(&self.settings.image);
        let settings = Settings {
            image: image.to_owned(),
            compute: self.settings.compute,
            username: self.settings.username.clone(),
            password: self.settings.password.clone(),
        };
        let mut spec = Spec::new(self.names.next_name(), settings);
        spec.files = vec![File::dir(SOURCE_DIR, DIR_MODE), File::dir(SCRIPT_DIR, DIR_MODE)];

        let mut envs = document.environment.clone();
        envs.insert(String::from("DRONE_HOME"), String::from(SOURCE_DIR));
        envs.insert(String::from("DRONE_WORKSPACE"), String::from(SOURCE_DIR));
        envs.insert(String::from("GIT_TERMINAL_PROMPT"), String::from("0"));

        let cloning = !document.clone.disable;
        if cloning {
            let mut step = script_step(CLONE_STEP, &script(&clone_commands(&document.clone)));
            step.envs.clone_from(&envs);
            step.run_policy = RunPolicy::Always;
            spec.steps.push(step);
        }

        for source in &document.steps {
            let mut step = script_step(&source.name, &script(&source.commands));
            step.envs = envs.clone();
            step.envs.extend(source.environment.clone());
            step.secrets.clone_from(&source.secrets);
            step.run_policy = source.run_policy.unwrap_or_default();
            step.depends_on.clone_from(&source.depends_on);
            spec.steps.push(step);
        }

        if !spec.steps.iter().any(|step| !step.depends_on.is_empty()) {
            configure_serial(&mut spec.steps);
        } else if cloning {
            configure_clone_deps(&mut spec.steps);
        } else {
            remove_clone_deps(&mut spec.steps);
        }
        Ok(spec)
    }
}

fn check_step_names(steps: &[StepDocument]) -> Result<(), CompileError> {
    let mut seen: BTreeMap<String, &str> = BTreeMap::new();
    for step in steps {
        let key = slug(&step.name);
        if key == CLONE_STEP {
            return Err(CompileError::ReservedName {
                name: step.name.clone(),
            });
        }
        if let Some(first) = seen.get(&key) {
            return Err(CompileError::DuplicateScript {
                first: (*first).to_owned(),
                second: step.name.clone(),
                path: format!("{SCRIPT_DIR}/{key}"),
            });
        }
        seen.insert(key, &step.name);
    }
    Ok(())
}

fn script_step(name: &str, body: &str) -> Step {
    let path = format!("{SCRIPT_DIR}/{}", slug(name));
    Step {
        name: name.to_owned(),
        command: String::from(SHELL),
        args: vec![String::from("-e"), path.clone()],
        working_dir: String::from(SOURCE_DIR),
        files: vec![File::file(path, SCRIPT_MODE, body)],
        ..Step::default()
    }
}

fn configure_serial(steps: &mut [Step]) {
    let mut previous: Option<String> = None;
    for step in steps {
        if let Some(name) = previous.take() {
            step.depends_on = vec![name];
        }
        previous = Some(step.name.clone());
    }
}

fn configure_clone_deps(steps: &mut [Step]) {
    for step in steps.iter_mut().filter(|step| step.name != CLONE_STEP) {
        if step.depends_on.is_empty() {
            step.depends_on.push(String::from(CLONE_STEP));
        }
    }
}

fn remove_clone_deps(steps: &mut [Step]) {
    for step in steps {
        step.depends_on.retain(|name| name != CLONE_STEP);
    }
}
