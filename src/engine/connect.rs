//! Dial retry against a deployed VM.

use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{ConnectError, Engine};
use crate::remote::{Dialer, RemoteError};
use crate::spec::Credentials;
use crate::vm::VmApi;

impl<A, D> Engine<A, D>
where
    A: VmApi,
    D: Dialer,
{
    /// Dials `address` until a session is established or the connection
    /// budget, measured from the first attempt, runs out.
    pub(crate) async fn connect(
        &self,
        address: &str,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<D::Session, ConnectError> {
        let deadline = Instant::now() + self.timings.connect_budget;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let dialled = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ConnectError::Cancelled),
                result = timeout_at(deadline, self.dialer.dial(address, credentials)) => result,
            };
            let err = match dialled {
                Ok(Ok(session)) => {
                    debug!(ip = address, attempts, "remote shell connected");
                    return Ok(session);
                }
                Ok(Err(err)) => err,
                Err(_) => RemoteError::Connect {
                    address: address.to_owned(),
                    message: String::from("dial did not finish before the connection budget"),
                },
            };
            trace!(ip = address, attempt = attempts, error = %err, "dial failed");

            let now = Instant::now();
            if now >= deadline {
                return Err(exhausted(address, attempts, err));
            }
            let wake = (now + self.timings.connect_interval).min(deadline);
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ConnectError::Cancelled),
                () = sleep_until(wake) => {}
            }
            if wake >= deadline {
                return Err(exhausted(address, attempts, err));
            }
        }
    }
}

fn exhausted(address: &str, attempts: u32, source: RemoteError) -> ConnectError {
    ConnectError::Exhausted {
        address: address.to_owned(),
        attempts,
        source,
    }
}
