//! Remote step execution.
//!
//! Each step dials its own session, uploads its files with the script
//! preamble applied, and runs its command on the blocking pool while the
//! caller's cancellation token is watched. Cancellation always wins locally:
//! the remote process is asked to stop but the call returns without waiting.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::preamble::compose;
use super::stage::upload;
use super::{Engine, ExecError};
use crate::remote::{Dialer, OutputSink, RemoteError, RemoteSession, Terminate};
use crate::spec::{ExecutionState, File, Spec, Step};
use crate::vm::VmApi;

/// Exit code reported when the session fails before the command exits.
pub const PROTOCOL_FAILURE_EXIT_CODE: i32 = 255;

#[derive(Default)]
struct TerminationSlot {
    requested: bool,
    terminator: Option<Box<dyn Terminate>>,
}

/// Hand-off point between the blocking command and the cancelling caller.
///
/// Whichever side arrives second delivers the termination request, so a
/// cancellation racing the command start is never lost.
#[derive(Clone, Default)]
struct Termination {
    slot: Arc<Mutex<TerminationSlot>>,
}

impl Termination {
    fn lock(&self) -> MutexGuard<'_, TerminationSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request(&self) {
        let mut slot = self.lock();
        slot.requested = true;
        if let Some(terminator) = slot.terminator.take() {
            deliver(terminator.as_ref());
        }
    }

    fn is_requested(&self) -> bool {
        self.lock().requested
    }

    fn arm(&self, terminator: Box<dyn Terminate>) {
        let mut slot = self.lock();
        if slot.requested {
            deliver(terminator.as_ref());
        } else {
            slot.terminator = Some(terminator);
        }
    }
}

fn deliver(terminator: &dyn Terminate) {
    if let Err(err) = terminator.terminate() {
        debug!(error = %err, "kill remote process");
    }
}

impl<A, D> Engine<A, D>
where
    A: VmApi,
    D: Dialer,
{
    pub(crate) async fn run_step(
        &self,
        spec: &Spec,
        step: &Step,
        output: OutputSink,
        cancel: &CancellationToken,
    ) -> Result<ExecutionState, ExecError> {
        let address = spec.address().ok_or_else(|| ExecError::NotProvisioned {
            step: step.name.clone(),
        })?;
        let files = step
            .files
            .iter()
            .map(|file| {
                Ok(File {
                    data: compose(step, &file.data)?,
                    ..file.clone()
                })
            })
            .collect::<Result<Vec<_>, ExecError>>()?;

        let credentials = spec.settings.credentials();
        let session = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ExecError::Cancelled),
            result = self.dialer.dial(address, &credentials) => result.map_err(ExecError::Connect)?,
        };

        let command = step.command_line();
        let termination = Termination::default();
        let remote = termination.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            execute_blocking(session, &files, &command, output, &remote)
        });
        debug!(step = %step.name, ip = address, "ssh session started");

        let waited = tokio::select! {
            biased;
            joined = &mut task => joined,
            () = cancel.cancelled() => {
                termination.request();
                debug!(step = %step.name, "ssh session killed");
                return Err(ExecError::Cancelled);
            }
        };

        let outcome = waited.map_err(|err| ExecError::Interrupted {
            message: err.to_string(),
        })??;
        let state = match outcome {
            Ok(code) => ExecutionState::exited_with(code),
            Err(RemoteError::Terminated) => return Err(ExecError::Cancelled),
            Err(err) => {
                warn!(step = %step.name, error = %err, "remote session failed");
                ExecutionState::exited_with(PROTOCOL_FAILURE_EXIT_CODE)
            }
        };
        debug!(step = %step.name, ssh.exit = state.exit_code, "ssh session finished");
        Ok(state)
    }
}

/// Uploads the step files, runs the command and waits for it.
///
/// The outer error covers failures before the command request is sent; the
/// inner result is the command outcome itself.
fn execute_blocking<S: RemoteSession>(
    mut session: S,
    files: &[File],
    command: &str,
    output: OutputSink,
    termination: &Termination,
) -> Result<Result<i32, RemoteError>, ExecError> {
    for file in files {
        upload(&mut session, &file.path, &file.data, file.mode)?;
    }
    if termination.is_requested() {
        return Err(ExecError::Cancelled);
    }

    let process = match session.start(command, output) {
        Ok(process) => process,
        Err(err @ RemoteError::Channel { .. }) => return Err(ExecError::Session(err)),
        Err(err) => return Ok(Err(err)),
    };
    termination.arm(process.terminator());
    Ok(process.wait())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Settings;
    use crate::test_support::{
        FakeDialer, FakeSession, FakeVmApi, ProcessBehaviour, SessionOp, SharedBuffer,
    };
    use rstest::rstest;
    use std::time::Duration;

    fn provisioned_spec() -> Spec {
        let mut spec = Spec::new(
            "drone-test",
            Settings {
                image: String::from("catalina.img"),
                compute: 6,
                username: String::from("admin"),
                password: String::from("admin"),
            },
        );
        spec.record_address(String::from("10.0.0.2:8822"));
        spec
    }

    fn script_step() -> Step {
        Step {
            name: String::from("build"),
            command: String::from("/bin/sh"),
            args: vec![String::from("-e"), String::from("/tmp/scripts/build")],
            working_dir: String::from("/tmp/source"),
            envs: [(String::from("FOO"), String::from("bar"))].into_iter().collect(),
            files: vec![File::file("/tmp/scripts/build", 0o700, "echo $FOO\n")],
            ..Step::default()
        }
    }

    fn engine_with(session: FakeSession) -> (Engine<FakeVmApi, FakeDialer>, FakeDialer) {
        let dialer = FakeDialer::with_session(session);
        (Engine::new(FakeVmApi::default(), dialer.clone()), dialer)
    }

    async fn run(
        engine: &Engine<FakeVmApi, FakeDialer>,
        spec: &Spec,
        output: OutputSink,
    ) -> Result<ExecutionState, ExecError> {
        engine
            .run_step(spec, &script_step(), output, &CancellationToken::new())
            .await
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(42)]
    #[case(255)]
    #[tokio::test]
    async fn clean_exit_status_is_reported_verbatim(#[case] code: i32) {
        let (engine, _) =
            engine_with(FakeSession::default().behaviour(ProcessBehaviour::Exit(code)));

        let state = run(&engine, &provisioned_spec(), Box::new(std::io::sink()))
            .await
            .expect("step completes");

        assert_eq!(state, ExecutionState::exited_with(code));
    }

    #[tokio::test]
    async fn protocol_failure_maps_to_255() {
        let (engine, _) = engine_with(
            FakeSession::default().behaviour(ProcessBehaviour::ProtocolFailure(String::from(
                "connection reset by peer",
            ))),
        );

        let state = run(&engine, &provisioned_spec(), Box::new(std::io::sink()))
            .await
            .expect("protocol failure is still a result");

        assert_eq!(state.exit_code, PROTOCOL_FAILURE_EXIT_CODE);
        assert!(state.exited);
    }

    #[tokio::test]
    async fn script_is_uploaded_with_preamble_before_start() {
        let session = FakeSession::default();
        let (engine, _) = engine_with(session.clone());

        run(&engine, &provisioned_spec(), Box::new(std::io::sink()))
            .await
            .expect("step completes");

        assert_eq!(
            session.ops(),
            vec![
                SessionOp::Write(
                    String::from("/tmp/scripts/build"),
                    b"cd /tmp/source\nexport FOO=bar\necho $FOO\n".to_vec()
                ),
                SessionOp::Chmod(String::from("/tmp/scripts/build"), 0o700),
                SessionOp::Start(String::from("/bin/sh -e /tmp/scripts/build")),
            ]
        );
    }

    #[tokio::test]
    async fn output_is_streamed_to_sink() {
        let (engine, _) = engine_with(FakeSession::default().output("hello from the vm\n"));
        let buffer = SharedBuffer::default();

        run(&engine, &provisioned_spec(), Box::new(buffer.clone()))
            .await
            .expect("step completes");

        assert_eq!(buffer.contents(), "hello from the vm\n");
    }

    #[tokio::test]
    async fn cancellation_returns_without_waiting_for_remote_exit() {
        let session = FakeSession::default().behaviour(ProcessBehaviour::Hang);
        let started = session.started_signal();
        let (engine, _) = engine_with(session.clone());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            started.notified().await;
            trigger.cancel();
        });

        let spec = provisioned_spec();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            engine.run_step(&spec, &script_step(), Box::new(std::io::sink()), &cancel),
        )
        .await
        .expect("run_step returns promptly after cancellation");

        assert!(
            matches!(result, Err(ExecError::Cancelled)),
            "unexpected result: {result:?}"
        );
        assert_eq!(session.terminations(), 1);
    }

    #[tokio::test]
    async fn cancellation_does_not_depend_on_remote_termination() {
        let session = FakeSession::default()
            .behaviour(ProcessBehaviour::IgnoreTerminate(Duration::from_secs(3)));
        let started = session.started_signal();
        let (engine, _) = engine_with(session.clone());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            started.notified().await;
            trigger.cancel();
        });

        let spec = provisioned_spec();
        let result = tokio::time::timeout(
            Duration::from_millis(500),
            engine.run_step(&spec, &script_step(), Box::new(std::io::sink()), &cancel),
        )
        .await
        .expect("run_step returns while the remote process keeps running");

        assert!(
            matches!(result, Err(ExecError::Cancelled)),
            "unexpected result: {result:?}"
        );
        assert_eq!(session.terminations(), 1);
    }

    #[tokio::test]
    async fn channel_failure_is_an_error() {
        let session = FakeSession::default().fail_start(RemoteError::Channel {
            message: String::from("channel open failed"),
        });
        let (engine, _) = engine_with(session.clone());

        let result = run(&engine, &provisioned_spec(), Box::new(std::io::sink())).await;

        assert!(
            matches!(result, Err(ExecError::Session(RemoteError::Channel { .. }))),
            "unexpected result: {result:?}"
        );
        assert!(
            !session.ops().iter().any(|op| matches!(op, SessionOp::Start(_))),
            "no command should be recorded as started"
        );
    }

    #[tokio::test]
    async fn rejected_command_request_maps_to_255() {
        let session = FakeSession::default().fail_start(RemoteError::Session {
            message: String::from("exec request denied"),
        });
        let (engine, _) = engine_with(session);

        let state = run(&engine, &provisioned_spec(), Box::new(std::io::sink()))
            .await
            .expect("a rejected command is still a result");

        assert_eq!(state, ExecutionState::exited_with(PROTOCOL_FAILURE_EXIT_CODE));
    }

    #[tokio::test]
    async fn missing_address_is_rejected() {
        let (engine, dialer) = engine_with(FakeSession::default());
        let spec = Spec::new("drone-test", Settings::default());

        let result = run(&engine, &spec, Box::new(std::io::sink())).await;

        assert!(
            matches!(result, Err(ExecError::NotProvisioned { .. })),
            "unexpected result: {result:?}"
        );
        assert_eq!(dialer.dial_count(), 0);
    }

    #[tokio::test]
    async fn dial_failure_is_an_error() {
        let dialer = FakeDialer::default().fail_always(RemoteError::Auth {
            address: String::from("10.0.0.2:8822"),
            username: String::from("admin"),
        });
        let engine = Engine::new(FakeVmApi::default(), dialer.clone());

        let result = run(&engine, &provisioned_spec(), Box::new(std::io::sink())).await;

        assert!(
            matches!(result, Err(ExecError::Connect(RemoteError::Auth { .. }))),
            "unexpected result: {result:?}"
        );
        assert_eq!(dialer.dial_count(), 1);
    }
}
