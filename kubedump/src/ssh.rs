//! Remote shell sessions used to capture node logs
//!
//! A [`Dial`] implementation opens a [`RemoteShell`] to a host. Sessions run
//! one command at a time, streaming its output into caller-supplied writers.
//! All operations observe a [`CancellationToken`]: when it fires, the
//! underlying transport is torn down so that blocked I/O unwinds, and
//! [`ShellError::Cancelled`] is returned once the in-flight work has
//! completed.

use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "ssh")]
mod client;

#[cfg(feature = "ssh")]
#[cfg_attr(docsrs, doc(cfg(feature = "ssh")))]
pub use self::client::{SshConfig, SshDialer, SshSession};

/// The port remote shells are dialed on unless configured otherwise
pub const DEFAULT_PORT: u16 = 22;

/// A boxed error returned by a shell implementation
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A writer that receives a command's output
pub type Output<'a> = &'a mut (dyn AsyncWrite + Send + Unpin);

/// Opens remote shell sessions
#[async_trait::async_trait]
pub trait Dial: Send + Sync {
    /// The session type returned by this dialer
    type Session: RemoteShell;

    /// Connects to `host`, returning a session once the connection has been
    /// established and authenticated
    async fn dial(&self, token: &CancellationToken, host: &str)
        -> Result<Self::Session, ShellError>;
}

/// A session on a remote host
#[async_trait::async_trait]
pub trait RemoteShell: Send {
    /// Runs `command`, writing its standard output to `stdout` and its
    /// standard error to `stderr`
    ///
    /// A command that exits with a non-zero status fails with
    /// [`ShellError::ExitStatus`].
    async fn exec_piped(
        &mut self,
        token: &CancellationToken,
        command: &str,
        stdout: Output<'_>,
        stderr: Output<'_>,
    ) -> Result<(), ShellError>;

    /// Releases the session's transport
    ///
    /// Closing a session more than once has no effect.
    async fn close(&mut self) -> Result<(), ShellError>;
}

/// Indicates a remote shell failure
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    /// The caller's cancellation token fired
    #[error("cancelled")]
    Cancelled,

    /// The connection could not be established or authenticated
    #[error("failed to connect: {0}")]
    Connect(#[source] BoxError),

    /// The command could not be run
    #[error("failed to run {command:?}: {source}")]
    Exec {
        /// The command line
        command: String,
        /// The underlying failure
        #[source]
        source: BoxError,
    },

    /// The command exited unsuccessfully
    #[error("{command:?} exited with status {status}")]
    ExitStatus {
        /// The command line
        command: String,
        /// The remote exit status
        status: i32,
    },

    /// The command's output could not be written locally
    #[error("failed to write output of {command:?}: {source}")]
    Output {
        /// The command line
        command: String,
        /// The I/O error
        #[source]
        source: std::io::Error,
    },

    /// The session could not be closed cleanly
    #[error("failed to close session: {0}")]
    Close(#[source] BoxError),
}
