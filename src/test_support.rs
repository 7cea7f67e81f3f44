//! Test support utilities shared across unit and integration tests.
//!
//! The doubles here stand in for the Orka API, the remote shell and the
//! runtime so retry budgets, staging order and step outcomes can be driven
//! deterministically.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::ffi::OsString;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::engine::{
    DestroyError, ExecError, Runtime, RuntimeFuture, SetupError, StageError,
};
use crate::orka::{
    ApiResponse, DeployResponse, OrkaError, StatusResponse, TokenResponse, VmConfig,
    VmNodeStatus, VmResource,
};
use crate::remote::{
    DialFuture, Dialer, OutputSink, RemoteError, RemoteProcess, RemoteSession, Terminate,
};
use crate::spec::{Credentials, ExecutionState, Spec, Step};
use crate::vm::{VmApi, VmFuture};

/// Address reported by [`FakeVmApi`] deployments unless overridden.
pub const FAKE_VM_ADDRESS: &str = "10.0.0.2:8822";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A call observed by [`FakeVmApi`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VmCall {
    /// `create` for the named VM.
    Create(String),
    /// `deploy` for the named VM.
    Deploy(String),
    /// `delete` for the named VM.
    Delete(String),
    /// `status` for the named VM.
    Status(String),
    /// `check_token`.
    CheckToken,
}

#[derive(Debug, Default)]
struct VmState {
    calls: Vec<VmCall>,
    deploy_failures: u32,
    deploy_error: Option<OrkaError>,
    create_error: Option<OrkaError>,
    delete_error: Option<OrkaError>,
    token: Option<TokenResponse>,
    deployment: Option<DeployResponse>,
}

/// In-memory VM API that records calls and replays scripted failures.
///
/// Clones share state, so a test can keep a handle while the engine owns
/// another.
#[derive(Clone, Debug, Default)]
pub struct FakeVmApi {
    state: Arc<Mutex<VmState>>,
}

impl FakeVmApi {
    /// Fails the next `count` deploy calls with `err`.
    #[must_use]
    pub fn fail_deploys(self, count: u32, err: OrkaError) -> Self {
        {
            let mut state = lock(&self.state);
            state.deploy_failures = count;
            state.deploy_error = Some(err);
        }
        self
    }

    /// Fails every create call with `err`.
    #[must_use]
    pub fn fail_create(self, err: OrkaError) -> Self {
        lock(&self.state).create_error = Some(err);
        self
    }

    /// Fails every delete call with `err`.
    #[must_use]
    pub fn fail_delete(self, err: OrkaError) -> Self {
        lock(&self.state).delete_error = Some(err);
        self
    }

    /// Replaces the token check response.
    #[must_use]
    pub fn with_token(self, token: TokenResponse) -> Self {
        lock(&self.state).token = Some(token);
        self
    }

    /// Replaces the successful deploy response.
    #[must_use]
    pub fn with_deployment(self, deployment: DeployResponse) -> Self {
        lock(&self.state).deployment = Some(deployment);
        self
    }

    /// Returns every call observed so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<VmCall> {
        lock(&self.state).calls.clone()
    }

    /// Counts the observed calls matching `predicate`.
    #[must_use]
    pub fn count(&self, predicate: impl Fn(&VmCall) -> bool) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| predicate(call))
            .count()
    }

    fn record(&self, call: VmCall) -> MutexGuard<'_, VmState> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        state
    }
}

fn default_deployment() -> DeployResponse {
    let (ip, port) = FAKE_VM_ADDRESS
        .split_once(':')
        .unwrap_or((FAKE_VM_ADDRESS, ""));
    DeployResponse {
        ip: ip.to_owned(),
        ssh_port: port.to_owned(),
        vm_id: String::from("fake-vm-id"),
        ..DeployResponse::default()
    }
}

impl VmApi for FakeVmApi {
    fn create<'a>(&'a self, config: &'a VmConfig) -> VmFuture<'a, ApiResponse> {
        let state = self.record(VmCall::Create(config.name.clone()));
        let result = state
            .create_error
            .clone()
            .map_or_else(|| Ok(ApiResponse::default()), Err);
        drop(state);
        Box::pin(async move { result })
    }

    fn deploy<'a>(&'a self, name: &'a str) -> VmFuture<'a, DeployResponse> {
        let mut state = self.record(VmCall::Deploy(name.to_owned()));
        let result = match state.deploy_error.clone() {
            Some(err) if state.deploy_failures > 0 => {
                state.deploy_failures -= 1;
                Err(err)
            }
            _ => Ok(state.deployment.clone().unwrap_or_else(default_deployment)),
        };
        drop(state);
        Box::pin(async move { result })
    }

    fn delete<'a>(&'a self, name: &'a str) -> VmFuture<'a, ApiResponse> {
        let state = self.record(VmCall::Delete(name.to_owned()));
        let result = state
            .delete_error
            .clone()
            .map_or_else(|| Ok(ApiResponse::default()), Err);
        drop(state);
        Box::pin(async move { result })
    }

    fn status<'a>(&'a self, name: &'a str) -> VmFuture<'a, StatusResponse> {
        drop(self.record(VmCall::Status(name.to_owned())));
        let response = StatusResponse {
            virtual_machine_resources: vec![VmResource {
                virtual_machine_name: name.to_owned(),
                vm_deployment_status: String::from("Deployed"),
                status: vec![VmNodeStatus {
                    vm_status: String::from("running"),
                    ..VmNodeStatus::default()
                }],
            }],
            ..StatusResponse::default()
        };
        Box::pin(async move { Ok(response) })
    }

    fn check_token(&self) -> VmFuture<'_, TokenResponse> {
        let state = self.record(VmCall::CheckToken);
        let token = state.token.clone().unwrap_or_else(|| TokenResponse {
            authenticated: true,
            is_token_revoked: false,
            ..TokenResponse::default()
        });
        drop(state);
        Box::pin(async move { Ok(token) })
    }
}

/// Operation observed by [`FakeSession`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionOp {
    /// `create_dir_all` on a path.
    CreateDir(String),
    /// `write_file` with the written bytes.
    Write(String, Vec<u8>),
    /// `chmod` with the applied mode.
    Chmod(String, u32),
    /// `start` with the command line.
    Start(String),
}

/// How a process started on a [`FakeSession`] behaves.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProcessBehaviour {
    /// Exits cleanly with the given status.
    Exit(i32),
    /// Fails at the protocol level with the given message.
    ProtocolFailure(String),
    /// Blocks until terminated.
    Hang,
    /// Ignores termination requests and exits cleanly after the given time.
    IgnoreTerminate(Duration),
}

impl Default for ProcessBehaviour {
    fn default() -> Self {
        Self::Exit(0)
    }
}

#[derive(Debug, Default)]
struct SessionShared {
    ops: Mutex<Vec<SessionOp>>,
    terminations: AtomicUsize,
    started: Arc<Notify>,
}

/// Remote session double recording every operation.
///
/// Clones share the operation log, so the copy handed out by
/// [`FakeDialer`] reports into the same log the test inspects.
#[derive(Clone, Debug, Default)]
pub struct FakeSession {
    shared: Arc<SessionShared>,
    fail_write_on: Option<String>,
    fail_start: Option<RemoteError>,
    behaviour: ProcessBehaviour,
    output: Vec<u8>,
}

impl FakeSession {
    /// Makes `write_file` fail for `path`.
    #[must_use]
    pub fn fail_write_on(mut self, path: &str) -> Self {
        self.fail_write_on = Some(path.to_owned());
        self
    }

    /// Makes `start` fail with `err` before any command is recorded.
    #[must_use]
    pub fn fail_start(mut self, err: RemoteError) -> Self {
        self.fail_start = Some(err);
        self
    }

    /// Sets how started processes behave.
    #[must_use]
    pub fn behaviour(mut self, behaviour: ProcessBehaviour) -> Self {
        self.behaviour = behaviour;
        self
    }

    /// Sets the output every started process writes.
    #[must_use]
    pub fn output(mut self, output: impl Into<Vec<u8>>) -> Self {
        self.output = output.into();
        self
    }

    /// Returns the operations performed so far.
    #[must_use]
    pub fn ops(&self) -> Vec<SessionOp> {
        lock(&self.shared.ops).clone()
    }

    /// Returns how many termination requests were delivered.
    #[must_use]
    pub fn terminations(&self) -> usize {
        self.shared.terminations.load(Ordering::SeqCst)
    }

    /// Returns a signal fired once a started process begins waiting.
    #[must_use]
    pub fn started_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.shared.started)
    }

    fn push(&self, op: SessionOp) {
        lock(&self.shared.ops).push(op);
    }
}

impl RemoteSession for FakeSession {
    fn create_dir_all(&mut self, path: &str) -> Result<(), RemoteError> {
        self.push(SessionOp::CreateDir(path.to_owned()));
        Ok(())
    }

    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), RemoteError> {
        if self.fail_write_on.as_deref() == Some(path) {
            return Err(RemoteError::Transfer {
                path: path.to_owned(),
                message: String::from("permission denied"),
            });
        }
        self.push(SessionOp::Write(path.to_owned(), data.to_vec()));
        Ok(())
    }

    fn chmod(&mut self, path: &str, mode: u32) -> Result<(), RemoteError> {
        self.push(SessionOp::Chmod(path.to_owned(), mode));
        Ok(())
    }

    fn start(
        &mut self,
        command: &str,
        output: OutputSink,
    ) -> Result<Box<dyn RemoteProcess>, RemoteError> {
        if let Some(err) = self.fail_start.clone() {
            return Err(err);
        }
        self.push(SessionOp::Start(command.to_owned()));
        Ok(Box::new(FakeProcess {
            behaviour: self.behaviour.clone(),
            data: self.output.clone(),
            sink: output,
            shared: Arc::clone(&self.shared),
            halt: Arc::default(),
        }))
    }
}

struct FakeProcess {
    behaviour: ProcessBehaviour,
    data: Vec<u8>,
    sink: OutputSink,
    shared: Arc<SessionShared>,
    halt: Arc<(Mutex<bool>, Condvar)>,
}

impl RemoteProcess for FakeProcess {
    fn terminator(&self) -> Box<dyn Terminate> {
        Box::new(FakeTerminator {
            halt: Arc::clone(&self.halt),
            shared: Arc::clone(&self.shared),
        })
    }

    fn wait(self: Box<Self>) -> Result<i32, RemoteError> {
        let Self {
            behaviour,
            data,
            mut sink,
            shared,
            halt,
        } = *self;
        sink.write_all(&data)
            .and_then(|()| sink.flush())
            .map_err(|err| RemoteError::Session {
                message: err.to_string(),
            })?;
        shared.started.notify_one();

        match behaviour {
            ProcessBehaviour::Exit(code) => Ok(code),
            ProcessBehaviour::ProtocolFailure(message) => Err(RemoteError::Session { message }),
            ProcessBehaviour::Hang => {
                let (flag, signal) = &*halt;
                let mut stopped = lock(flag);
                while !*stopped {
                    stopped = signal
                        .wait(stopped)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Err(RemoteError::Terminated)
            }
            ProcessBehaviour::IgnoreTerminate(runtime) => {
                std::thread::sleep(runtime);
                Ok(0)
            }
        }
    }
}

struct FakeTerminator {
    halt: Arc<(Mutex<bool>, Condvar)>,
    shared: Arc<SessionShared>,
}

impl Terminate for FakeTerminator {
    fn terminate(&self) -> Result<(), RemoteError> {
        self.shared.terminations.fetch_add(1, Ordering::SeqCst);
        let (flag, signal) = &*self.halt;
        *lock(flag) = true;
        signal.notify_all();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DialerState {
    dials: usize,
    failures_left: u32,
    failure: Option<RemoteError>,
}

/// Dialer double handing out clones of one [`FakeSession`].
#[derive(Clone, Debug, Default)]
pub struct FakeDialer {
    session: FakeSession,
    state: Arc<Mutex<DialerState>>,
}

impl FakeDialer {
    /// Creates a dialer that hands out clones of `session`.
    #[must_use]
    pub fn with_session(session: FakeSession) -> Self {
        Self {
            session,
            state: Arc::default(),
        }
    }

    /// Fails every dial with `err`.
    #[must_use]
    pub fn fail_always(self, err: RemoteError) -> Self {
        self.fail_times(u32::MAX, err)
    }

    /// Fails the next `count` dials with `err`.
    #[must_use]
    pub fn fail_times(self, count: u32, err: RemoteError) -> Self {
        {
            let mut state = lock(&self.state);
            state.failures_left = count;
            state.failure = Some(err);
        }
        self
    }

    /// Returns how many dials were attempted.
    #[must_use]
    pub fn dial_count(&self) -> usize {
        lock(&self.state).dials
    }
}

impl Dialer for FakeDialer {
    type Session = FakeSession;

    fn dial<'a>(
        &'a self,
        _address: &'a str,
        _credentials: &'a Credentials,
    ) -> DialFuture<'a, Self::Session> {
        let result = {
            let mut state = lock(&self.state);
            state.dials += 1;
            match state.failure.clone() {
                Some(err) if state.failures_left > 0 => {
                    state.failures_left -= 1;
                    Err(err)
                }
                _ => Ok(self.session.clone()),
            }
        };
        Box::pin(async move { result })
    }
}

/// Clonable in-memory writer used as a step output sink.
#[derive(Clone, Debug, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Returns everything written so far as lossy UTF-8.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.inner)).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.inner).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A call observed by [`ScriptedRuntime`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RuntimeCall {
    /// `setup`.
    Setup,
    /// `run` for the named step.
    Run(String),
    /// `destroy`.
    Destroy,
}

#[derive(Debug, Default)]
struct RuntimeState {
    calls: Vec<RuntimeCall>,
    setup_failure: Option<bool>,
    exits: BTreeMap<String, i32>,
    broken_steps: BTreeSet<String>,
    destroy_failure: bool,
}

/// Runtime double with scripted setup, step and destroy outcomes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRuntime {
    state: Arc<Mutex<RuntimeState>>,
}

impl ScriptedRuntime {
    /// Makes setup fail; with `after_deploy` the VM address is recorded
    /// first, as when staging fails on a deployed VM.
    #[must_use]
    pub fn fail_setup(self, after_deploy: bool) -> Self {
        lock(&self.state).setup_failure = Some(after_deploy);
        self
    }

    /// Makes the named step exit with `code`.
    #[must_use]
    pub fn exit_with(self, step: &str, code: i32) -> Self {
        lock(&self.state).exits.insert(step.to_owned(), code);
        self
    }

    /// Makes the named step fail with an execution error.
    #[must_use]
    pub fn break_step(self, step: &str) -> Self {
        lock(&self.state).broken_steps.insert(step.to_owned());
        self
    }

    /// Makes destroy fail.
    #[must_use]
    pub fn fail_destroy(self) -> Self {
        lock(&self.state).destroy_failure = true;
        self
    }

    /// Returns every call observed so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RuntimeCall> {
        lock(&self.state).calls.clone()
    }
}

impl Runtime for ScriptedRuntime {
    fn setup<'a>(
        &'a self,
        spec: &'a mut Spec,
        _cancel: &'a CancellationToken,
    ) -> RuntimeFuture<'a, (), SetupError> {
        let failure = {
            let mut state = lock(&self.state);
            state.calls.push(RuntimeCall::Setup);
            state.setup_failure
        };
        if failure != Some(false) {
            spec.record_address(String::from(FAKE_VM_ADDRESS));
        }
        let result = match failure {
            Some(_) => Err(SetupError::Stage(StageError::Interrupted {
                message: String::from("scripted setup failure"),
            })),
            None => Ok(()),
        };
        Box::pin(async move { result })
    }

    fn run<'a>(
        &'a self,
        _spec: &'a Spec,
        step: &'a Step,
        mut output: OutputSink,
        _cancel: &'a CancellationToken,
    ) -> RuntimeFuture<'a, ExecutionState, ExecError> {
        let (broken, code) = {
            let mut state = lock(&self.state);
            state.calls.push(RuntimeCall::Run(step.name.clone()));
            (
                state.broken_steps.contains(&step.name),
                state.exits.get(&step.name).copied().unwrap_or(0),
            )
        };
        writeln!(output, "+ {}", step.name).ok();
        let result = if broken {
            Err(ExecError::Interrupted {
                message: String::from("scripted step failure"),
            })
        } else {
            Ok(ExecutionState::exited_with(code))
        };
        Box::pin(async move { result })
    }

    fn destroy<'a>(&'a self, spec: &'a Spec) -> RuntimeFuture<'a, (), DestroyError> {
        let failure = {
            let mut state = lock(&self.state);
            state.calls.push(RuntimeCall::Destroy);
            state.destroy_failure
        };
        let result = if failure {
            Err(DestroyError {
                name: spec.name.clone(),
                source: OrkaError::Api {
                    messages: vec![String::from("scripted purge failure")],
                },
            })
        } else {
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn ping(&self) -> RuntimeFuture<'_, (), OrkaError> {
        Box::pin(async { Ok(()) })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: tokio::sync::MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }

    /// Removes environment variables for the guard's lifetime.
    pub async fn remove_vars(keys: &[&str]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(keys.len());
        for key in keys {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
