//! Remote shell and file transfer seam.
//!
//! The engine talks to VMs through these traits so provisioning, staging and
//! step execution can be exercised against in-memory doubles. [`ssh`] holds
//! the real implementation over SSH and SFTP.
//!
//! Session operations block; callers move sessions onto the blocking thread
//! pool before using them.

pub mod ssh;

use std::future::Future;
use std::io::Write;
use std::pin::Pin;

use thiserror::Error;

use crate::spec::Credentials;

pub use ssh::{SshDialer, SshSession};

/// Destination for the combined stdout and stderr of a remote command.
pub type OutputSink = Box<dyn Write + Send>;

/// Future returned by [`Dialer::dial`].
pub type DialFuture<'a, S> = Pin<Box<dyn Future<Output = Result<S, RemoteError>> + Send + 'a>>;

/// Errors raised by remote sessions.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// The TCP connection or protocol handshake failed.
    #[error("failed to connect to {address}: {message}")]
    Connect {
        /// Address that was dialled.
        address: String,
        /// Underlying error text.
        message: String,
    },
    /// The server rejected the credentials.
    #[error("authentication as {username} on {address} failed")]
    Auth {
        /// Address that was dialled.
        address: String,
        /// User that attempted to log in.
        username: String,
    },
    /// A file transfer operation failed.
    #[error("file transfer failed for {path}: {message}")]
    Transfer {
        /// Remote path being operated on.
        path: String,
        /// Underlying error text.
        message: String,
    },
    /// No command channel could be opened on the session.
    #[error("failed to open command channel: {message}")]
    Channel {
        /// Underlying error text.
        message: String,
    },
    /// The command session failed before the remote process exited cleanly.
    #[error("remote session failed: {message}")]
    Session {
        /// Underlying error text.
        message: String,
    },
    /// The command was abandoned after a termination request.
    #[error("remote command terminated")]
    Terminated,
}

/// Opens remote sessions.
pub trait Dialer: Send + Sync {
    /// Session type produced by this dialer.
    type Session: RemoteSession;

    /// Dials `address` (`host:port`) and authenticates with `credentials`.
    fn dial<'a>(
        &'a self,
        address: &'a str,
        credentials: &'a Credentials,
    ) -> DialFuture<'a, Self::Session>;
}

/// A live, authenticated session bound to one address.
pub trait RemoteSession: Send + 'static {
    /// Creates `path` and any missing parents; succeeds if it already exists.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Transfer`] when a directory cannot be created.
    fn create_dir_all(&mut self, path: &str) -> Result<(), RemoteError>;

    /// Creates or truncates the file at `path` and writes `data`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Transfer`] when the write fails.
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), RemoteError>;

    /// Applies permission bits to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Transfer`] when the change is rejected.
    fn chmod(&mut self, path: &str, mode: u32) -> Result<(), RemoteError>;

    /// Starts `command`, streaming its combined output into `output`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Channel`] when no channel can be opened for the
    /// command and [`RemoteError::Session`] when the command request fails.
    fn start(
        &mut self,
        command: &str,
        output: OutputSink,
    ) -> Result<Box<dyn RemoteProcess>, RemoteError>;
}

/// A command running on the remote side.
pub trait RemoteProcess: Send {
    /// Returns a handle that can ask the process to stop from another thread.
    fn terminator(&self) -> Box<dyn Terminate>;

    /// Blocks until the command finishes and returns its exit status.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Session`] when the session fails before a clean
    /// exit, or [`RemoteError::Terminated`] after a termination request.
    fn wait(self: Box<Self>) -> Result<i32, RemoteError>;
}

/// Best-effort termination of a remote process.
pub trait Terminate: Send {
    /// Requests termination. Delivery to the remote process is not guaranteed.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] when the request could not be issued at all.
    fn terminate(&self) -> Result<(), RemoteError>;
}
