//! Shared fixtures for lifecycle BDD scenarios.

use std::cell::RefCell;
use std::io;

use orka_runner::compiler::{
    CloneSettings, Compiler, CompilerSettings, PipelineDocument, StepDocument,
};
use orka_runner::lifecycle::{OutputFactory, PipelineReport};
use orka_runner::names::RandomNames;
use orka_runner::remote::OutputSink;
use orka_runner::spec::{Spec, Step};
use orka_runner::test_support::{FakeSession, FakeVmApi};
use rstest::fixture;

/// Outcome of running the pipeline in a scenario.
#[derive(Debug)]
pub enum LifecycleOutcome {
    Completed(PipelineReport),
    SetupFailed(String),
    Failed(String),
}

/// Mutable scenario state shared between steps.
#[derive(Debug, Default)]
pub struct LifecycleWorld {
    pub api: RefCell<FakeVmApi>,
    pub session: RefCell<FakeSession>,
    pub spec: RefCell<Spec>,
    pub outcome: RefCell<Option<LifecycleOutcome>>,
}

/// Discards step output.
pub struct Discard;

impl OutputFactory for Discard {
    fn output_for(&self, _step: &Step) -> OutputSink {
        Box::new(io::sink())
    }
}

#[fixture]
pub fn lifecycle_world() -> LifecycleWorld {
    LifecycleWorld::default()
}

/// Compiles a serial pipeline with one `make <name>` step per name.
pub fn compile_pipeline(names: &[&str]) -> Spec {
    let document = PipelineDocument {
        clone: CloneSettings {
            disable: true,
            ..CloneSettings::default()
        },
        steps: names
            .iter()
            .map(|name| StepDocument {
                name: (*name).to_owned(),
                commands: vec![format!("make {name}")],
                ..StepDocument::default()
            })
            .collect(),
        ..PipelineDocument::default()
    };
    let settings = CompilerSettings {
        image: String::from("catalina.img"),
        compute: 6,
        username: String::from("admin"),
        password: String::from("admin"),
    };
    Compiler::new(settings, RandomNames::seeded(11))
        .compile(&document)
        .unwrap_or_else(|err| panic!("compile pipeline: {err}"))
}
