//! VM provisioning with transient-failure retry.
//!
//! The farm runs out of capacity and suffers short network partitions that
//! clear within minutes. Those failures purge the VM and try again after a
//! fixed backoff; anything else aborts on the first attempt.

use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ConnectError, Engine, ProvisionError};
use crate::orka::{OrkaError, VmConfig};
use crate::remote::Dialer;
use crate::spec::Spec;
use crate::vm::VmApi;

const CAPACITY_MARKER: &str = "No available nodes";
const UNREACHABLE_MARKER: &str = "network is unreachable";

/// Whether a failed provisioning attempt is worth repeating.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// Purge the VM and try again after the backoff.
    Retry,
    /// Give up immediately.
    Fatal,
}

/// Failure of one deploy-and-connect cycle.
#[derive(Debug)]
pub(crate) enum AttemptError {
    Register(OrkaError),
    Deploy(OrkaError),
    Connect(ConnectError),
}

impl AttemptError {
    fn into_provision_error(self, vm_name: &str) -> ProvisionError {
        let name = vm_name.to_owned();
        match self {
            Self::Register(source) => ProvisionError::Config { name, source },
            Self::Deploy(source) => ProvisionError::Deploy { name, source },
            Self::Connect(ConnectError::Cancelled) => ProvisionError::Cancelled,
            Self::Connect(source) => ProvisionError::Connect { name, source },
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Register(err) | Self::Deploy(err) => err.fmt(f),
            Self::Connect(err) => err.fmt(f),
        }
    }
}

/// Classifies an API error raised by create or deploy.
///
/// Capacity exhaustion is recognised structurally; the text markers cover
/// wording the client does not map, such as transport failures.
#[must_use]
pub fn classify_api_error(err: &OrkaError) -> Disposition {
    if err.is_capacity() {
        return Disposition::Retry;
    }
    classify_text(&err.to_string())
}

fn classify_connect_error(err: &ConnectError) -> Disposition {
    match err {
        ConnectError::Exhausted { source, .. } => classify_text(&source.to_string()),
        ConnectError::Cancelled => Disposition::Fatal,
    }
}

fn classify_text(text: &str) -> Disposition {
    if text.contains(CAPACITY_MARKER) || text.contains(UNREACHABLE_MARKER) {
        Disposition::Retry
    } else {
        Disposition::Fatal
    }
}

fn classify(err: &AttemptError) -> Disposition {
    match err {
        AttemptError::Register(source) | AttemptError::Deploy(source) => {
            classify_api_error(source)
        }
        AttemptError::Connect(source) => classify_connect_error(source),
    }
}

impl<A, D> Engine<A, D>
where
    A: VmApi,
    D: Dialer,
{
    /// Registers and deploys the VM for `spec`, then dials it.
    ///
    /// The deployed address is recorded on `spec` before dialling, so a later
    /// destroy can find the VM even when the connection never succeeds.
    pub(crate) async fn provision(
        &self,
        spec: &mut Spec,
        cancel: &CancellationToken,
    ) -> Result<D::Session, ProvisionError> {
        let config = VmConfig {
            name: spec.name.clone(),
            image: spec.settings.image.clone(),
            cpu: spec.settings.compute,
            vcpu: spec.settings.compute,
        };
        debug!(id = %spec.name, image = %config.image, cpu = config.cpu, "registering vm");
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ProvisionError::Cancelled),
            result = self.api.create(&config) => {
                result.map_err(|source| ProvisionError::Config {
                    name: spec.name.clone(),
                    source,
                })?;
            }
        }

        let budget = self.timings.deploy_budget;
        let deadline = Instant::now() + budget;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ProvisionError::Cancelled),
                result = timeout_at(
                    deadline,
                    self.attempt(spec, &config, attempt, cancel),
                ) => result,
            };
            let err = match outcome {
                Ok(Ok(session)) => return Ok(session),
                Ok(Err(err)) => err,
                Err(_) => {
                    return Err(ProvisionError::DeadlineExceeded {
                        name: spec.name.clone(),
                        budget,
                        last_error: String::from("attempt still running at deadline"),
                    });
                }
            };

            if classify(&err) == Disposition::Fatal {
                debug!(id = %spec.name, attempt, error = %err, "provisioning failed");
                return Err(err.into_provision_error(&spec.name));
            }

            warn!(
                id = %spec.name,
                attempt,
                error = %err,
                "transient provisioning failure, retrying"
            );
            self.purge(&spec.name).await;

            let wake = Instant::now() + self.timings.deploy_backoff;
            if wake >= deadline {
                return Err(ProvisionError::DeadlineExceeded {
                    name: spec.name.clone(),
                    budget,
                    last_error: err.to_string(),
                });
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ProvisionError::Cancelled),
                () = sleep_until(wake) => {}
            }
        }
    }

    async fn attempt(
        &self,
        spec: &mut Spec,
        config: &VmConfig,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<D::Session, AttemptError> {
        // A purge removes the configuration along with the VM.
        if attempt > 1 {
            self.api
                .create(config)
                .await
                .map_err(AttemptError::Register)?;
        }

        debug!(id = %spec.name, attempt, "deploying vm");
        let deployed = self
            .api
            .deploy(&spec.name)
            .await
            .map_err(AttemptError::Deploy)?;
        let address = deployed
            .ssh_address()
            .ok_or_else(|| {
                AttemptError::Deploy(OrkaError::MissingAddress {
                    name: spec.name.clone(),
                })
            })?;
        debug!(id = %spec.name, ip = %address, vm_id = %deployed.vm_id, "vm deployed");
        spec.record_address(address.clone());

        self.connect(&address, &spec.settings.credentials(), cancel)
            .await
            .map_err(AttemptError::Connect)
    }

    /// Best-effort purge between retries; a failure is only logged because
    /// the next cycle registers the VM again regardless.
    async fn purge(&self, name: &str) {
        if let Err(err) = self.api.delete(name).await {
            debug!(id = %name, error = %err, "purge before retry failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::remote::RemoteError;
    use crate::spec::Settings;
    use crate::test_support::{FakeDialer, FakeVmApi, VmCall};
    use rstest::rstest;

    fn spec() -> Spec {
        Spec::new(
            "drone-test",
            Settings {
                image: String::from("catalina.img"),
                compute: 6,
                username: String::from("admin"),
                password: String::from("admin"),
            },
        )
    }

    fn unreachable() -> RemoteError {
        RemoteError::Connect {
            address: String::from("10.0.0.2:8822"),
            message: String::from("connect: network is unreachable"),
        }
    }

    #[rstest]
    #[case(OrkaError::InsufficientCapacity, Disposition::Retry)]
    #[case(
        OrkaError::Api { messages: vec![String::from("No available nodes in region")] },
        Disposition::Retry
    )]
    #[case(
        OrkaError::Http {
            method: String::from("POST"),
            url: String::from("http://orka/resources/vm/deploy"),
            message: String::from("dial tcp: network is unreachable"),
        },
        Disposition::Retry
    )]
    #[case(
        OrkaError::Api { messages: vec![String::from("Image not found")] },
        Disposition::Fatal
    )]
    #[case(
        OrkaError::MissingAddress { name: String::from("drone-test") },
        Disposition::Fatal
    )]
    fn api_errors_are_classified(#[case] err: OrkaError, #[case] expected: Disposition) {
        assert_eq!(classify_api_error(&err), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_failures_purge_and_retry_after_backoff() {
        let api = FakeVmApi::default().fail_deploys(3, OrkaError::InsufficientCapacity);
        let engine = Engine::new(api.clone(), FakeDialer::default());
        let mut spec = spec();
        let started = Instant::now();

        engine
            .provision(&mut spec, &CancellationToken::new())
            .await
            .expect("fourth deploy succeeds");

        assert_eq!(api.count(|call| matches!(call, VmCall::Delete(_))), 3);
        assert_eq!(api.count(|call| matches!(call, VmCall::Deploy(_))), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(180));
        assert_eq!(spec.address(), Some("10.0.0.2:8822"));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_precedes_each_new_registration() {
        let api = FakeVmApi::default().fail_deploys(1, OrkaError::InsufficientCapacity);
        let engine = Engine::new(api.clone(), FakeDialer::default());

        engine
            .provision(&mut spec(), &CancellationToken::new())
            .await
            .expect("second deploy succeeds");

        let name = String::from("drone-test");
        assert_eq!(
            api.calls(),
            vec![
                VmCall::Create(name.clone()),
                VmCall::Deploy(name.clone()),
                VmCall::Delete(name.clone()),
                VmCall::Create(name.clone()),
                VmCall::Deploy(name),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unrecognised_errors_fail_without_retry() {
        let api = FakeVmApi::default().fail_deploys(
            1,
            OrkaError::Api {
                messages: vec![String::from("Image not found")],
            },
        );
        let engine = Engine::new(api.clone(), FakeDialer::default());

        let err = engine
            .provision(&mut spec(), &CancellationToken::new())
            .await
            .expect_err("deploy should fail");

        assert!(matches!(err, ProvisionError::Deploy { .. }), "unexpected error: {err}");
        assert_eq!(api.count(|call| matches!(call, VmCall::Deploy(_))), 1);
        assert_eq!(api.count(|call| matches!(call, VmCall::Delete(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn registration_failure_is_fatal() {
        let api = FakeVmApi::default().fail_create(OrkaError::InsufficientCapacity);
        let engine = Engine::new(api.clone(), FakeDialer::default());

        let err = engine
            .provision(&mut spec(), &CancellationToken::new())
            .await
            .expect_err("create should fail");

        assert!(matches!(err, ProvisionError::Config { .. }), "unexpected error: {err}");
        assert_eq!(api.count(|call| matches!(call, VmCall::Deploy(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_network_redeploys_after_connect_budget() {
        let api = FakeVmApi::default();
        let dialer = FakeDialer::default().fail_times(60, unreachable());
        let engine = Engine::new(api.clone(), dialer.clone());
        let started = Instant::now();

        engine
            .provision(&mut spec(), &CancellationToken::new())
            .await
            .expect("second cycle connects");

        assert_eq!(api.count(|call| matches!(call, VmCall::Deploy(_))), 2);
        assert_eq!(api.count(|call| matches!(call, VmCall::Delete(_))), 1);
        assert_eq!(dialer.dial_count(), 61);
        assert_eq!(started.elapsed(), Duration::from_secs(660));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_retrying() {
        let api = FakeVmApi::default().fail_deploys(u32::MAX, OrkaError::InsufficientCapacity);
        let engine = Engine::new(api.clone(), FakeDialer::default());

        let err = engine
            .provision(&mut spec(), &CancellationToken::new())
            .await
            .expect_err("budget should run out");

        assert!(
            matches!(
                err,
                ProvisionError::DeadlineExceeded { ref last_error, .. }
                    if last_error.contains("sufficient CPU")
            ),
            "unexpected error: {err}"
        );
        assert_eq!(api.count(|call| matches!(call, VmCall::Deploy(_))), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_returns_promptly() {
        let api = FakeVmApi::default().fail_deploys(u32::MAX, OrkaError::InsufficientCapacity);
        let engine = Engine::new(api, FakeDialer::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(90)).await;
            trigger.cancel();
        });
        let started = Instant::now();

        let err = engine
            .provision(&mut spec(), &cancel)
            .await
            .expect_err("provisioning should be cancelled");

        assert!(matches!(err, ProvisionError::Cancelled), "unexpected error: {err}");
        assert_eq!(started.elapsed(), Duration::from_secs(90));
    }
}
