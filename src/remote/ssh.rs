//! SSH and SFTP implementation of the remote seam, built on `ssh2`.
//!
//! Host keys are not verified: VMs are freshly deployed and their address comes
//! from an authenticated lifecycle API call.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use ssh2::{Channel, ExtendedData, FileStat, Session, Sftp};
use tracing::trace;

use super::{
    DialFuture, Dialer, OutputSink, RemoteError, RemoteProcess, RemoteSession, Terminate,
};
use crate::spec::Credentials;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(20);
const READ_BUFFER_SIZE: usize = 8192;
const SIGNAL_EXIT_BASE: i32 = 128;

/// Dials VMs over SSH with password authentication.
#[derive(Clone, Debug)]
pub struct SshDialer {
    connect_timeout: Duration,
}

impl SshDialer {
    /// Creates a dialer with the default 30 second connect timeout.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Overrides the TCP connect and handshake timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for SshDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialer for SshDialer {
    type Session = SshSession;

    fn dial<'a>(
        &'a self,
        address: &'a str,
        credentials: &'a Credentials,
    ) -> DialFuture<'a, Self::Session> {
        Box::pin(async move {
            let owned_address = address.to_owned();
            let owned_credentials = credentials.clone();
            let timeout = self.connect_timeout;
            tokio::task::spawn_blocking(move || {
                connect_session(&owned_address, &owned_credentials, timeout)
            })
            .await
            .map_err(|err| RemoteError::Connect {
                address: address.to_owned(),
                message: err.to_string(),
            })?
        })
    }
}

fn connect_session(
    address: &str,
    credentials: &Credentials,
    timeout: Duration,
) -> Result<SshSession, RemoteError> {
    let connect_error = |message: String| RemoteError::Connect {
        address: address.to_owned(),
        message,
    };

    let socket = resolve(address).map_err(connect_error)?;
    let tcp = TcpStream::connect_timeout(&socket, timeout)
        .map_err(|err| connect_error(err.to_string()))?;

    let mut session = Session::new().map_err(|err| connect_error(err.to_string()))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(millis(timeout));
    session
        .handshake()
        .map_err(|err| connect_error(err.to_string()))?;
    session
        .userauth_password(&credentials.username, &credentials.password)
        .map_err(|_| RemoteError::Auth {
            address: address.to_owned(),
            username: credentials.username.clone(),
        })?;
    if !session.authenticated() {
        return Err(RemoteError::Auth {
            address: address.to_owned(),
            username: credentials.username.clone(),
        });
    }
    session.set_timeout(0);

    Ok(SshSession {
        session,
        sftp: None,
    })
}

fn resolve(address: &str) -> Result<SocketAddr, String> {
    address
        .to_socket_addrs()
        .map_err(|err| err.to_string())?
        .next()
        .ok_or_else(|| format!("{address} did not resolve to any socket address"))
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

/// Authenticated SSH session with a lazily opened SFTP channel.
pub struct SshSession {
    session: Session,
    sftp: Option<Sftp>,
}

impl SshSession {
    fn sftp(&mut self, path: &str) -> Result<&Sftp, RemoteError> {
        if self.sftp.is_none() {
            let opened = self
                .session
                .sftp()
                .map_err(|err| transfer_error(path, &err))?;
            self.sftp = Some(opened);
        }
        self.sftp.as_ref().ok_or_else(|| RemoteError::Transfer {
            path: path.to_owned(),
            message: String::from("sftp channel unavailable"),
        })
    }
}

fn transfer_error(path: &str, err: &dyn std::fmt::Display) -> RemoteError {
    RemoteError::Transfer {
        path: path.to_owned(),
        message: err.to_string(),
    }
}

fn channel_error(err: &dyn std::fmt::Display) -> RemoteError {
    RemoteError::Channel {
        message: err.to_string(),
    }
}

fn session_error(err: &dyn std::fmt::Display) -> RemoteError {
    RemoteError::Session {
        message: err.to_string(),
    }
}

impl RemoteSession for SshSession {
    fn create_dir_all(&mut self, path: &str) -> Result<(), RemoteError> {
        let sftp = self.sftp(path)?;
        let mut current = PathBuf::new();
        for component in Path::new(path).components() {
            current.push(component);
            if current.parent().is_none() {
                continue;
            }
            if sftp.stat(&current).is_ok() {
                continue;
            }
            if let Err(err) = sftp.mkdir(&current, 0o755) {
                // tolerate a concurrent creator
                if sftp.stat(&current).is_err() {
                    return Err(transfer_error(path, &err));
                }
            }
        }
        Ok(())
    }

    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), RemoteError> {
        let sftp = self.sftp(path)?;
        let mut file = sftp
            .create(Path::new(path))
            .map_err(|err| transfer_error(path, &err))?;
        file.write_all(data)
            .map_err(|err| transfer_error(path, &err))?;
        Ok(())
    }

    fn chmod(&mut self, path: &str, mode: u32) -> Result<(), RemoteError> {
        let sftp = self.sftp(path)?;
        let stat = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(mode),
            atime: None,
            mtime: None,
        };
        sftp.setstat(Path::new(path), stat)
            .map_err(|err| transfer_error(path, &err))
    }

    fn start(
        &mut self,
        command: &str,
        output: OutputSink,
    ) -> Result<Box<dyn RemoteProcess>, RemoteError> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|err| channel_error(&err))?;
        channel
            .handle_extended_data(ExtendedData::Merge)
            .map_err(|err| channel_error(&err))?;
        channel.exec(command).map_err(|err| session_error(&err))?;
        trace!(command, "remote command started");

        Ok(Box::new(SshProcess {
            session: self.session.clone(),
            channel,
            output,
            terminate: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct SshProcess {
    session: Session,
    channel: Channel,
    output: OutputSink,
    terminate: Arc<AtomicBool>,
}

struct SshTerminator {
    terminate: Arc<AtomicBool>,
}

impl Terminate for SshTerminator {
    fn terminate(&self) -> Result<(), RemoteError> {
        self.terminate.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl RemoteProcess for SshProcess {
    fn terminator(&self) -> Box<dyn Terminate> {
        Box::new(SshTerminator {
            terminate: Arc::clone(&self.terminate),
        })
    }

    fn wait(self: Box<Self>) -> Result<i32, RemoteError> {
        let Self {
            session,
            mut channel,
            mut output,
            terminate,
        } = *self;

        // Non-blocking reads keep the session lock free between polls so the
        // termination flag is observed promptly.
        session.set_blocking(false);
        let pumped = pump_output(&mut channel, &mut output, &terminate);
        if pumped.is_err() {
            // OpenSSH ignores signal requests; closing the channel is the most
            // that can be asked of the server.
            channel.close().ok();
        }
        session.set_blocking(true);
        pumped?;

        output.flush().map_err(|err| session_error(&err))?;
        channel.wait_close().map_err(|err| session_error(&err))?;
        if let Some(signal) = channel
            .exit_signal()
            .ok()
            .and_then(|signal| signal.exit_signal)
        {
            return Ok(SIGNAL_EXIT_BASE + signal_number(&signal));
        }
        channel.exit_status().map_err(|err| session_error(&err))
    }
}

fn pump_output(
    channel: &mut Channel,
    output: &mut OutputSink,
    terminate: &AtomicBool,
) -> Result<(), RemoteError> {
    let mut buf = [0_u8; READ_BUFFER_SIZE];
    loop {
        if terminate.load(Ordering::SeqCst) {
            return Err(RemoteError::Terminated);
        }

        let progressed = match channel.read(&mut buf) {
            Ok(read) => {
                if let Some(chunk) = buf.get(..read) {
                    output
                        .write_all(chunk)
                        .map_err(|err| session_error(&err))?;
                }
                read > 0
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => false,
            Err(err) => return Err(session_error(&err)),
        };

        if !progressed && channel.eof() {
            return Ok(());
        }
        if !progressed {
            thread::sleep(IDLE_POLL_INTERVAL);
        }
    }
}

fn signal_number(name: &str) -> i32 {
    match name.trim_start_matches("SIG") {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "ILL" => 4,
        "TRAP" => 5,
        "ABRT" => 6,
        "BUS" => 7,
        "FPE" => 8,
        "KILL" => 9,
        "USR1" => 10,
        "SEGV" => 11,
        "USR2" => 12,
        "PIPE" => 13,
        "ALRM" => 14,
        "TERM" => 15,
        _ => 0,
    }
}
