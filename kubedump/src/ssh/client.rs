//! An [`ssh2`]-backed remote shell
//!
//! libssh2 is a blocking library and its handshake cannot be interrupted, so
//! each blocking step runs on the blocking thread pool while the async side
//! watches the cancellation token. On cancellation the TCP socket is shut
//! down, which fails any pending libssh2 I/O, and the blocking task is awaited
//! before [`ShellError::Cancelled`] is returned.

use super::{BoxError, Dial, Output, RemoteShell, ShellError, DEFAULT_PORT};
use std::{
    io::Read,
    net::{Shutdown, TcpStream},
    path::PathBuf,
};
use tokio::{io::AsyncWriteExt, sync::mpsc, task};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Configures how sessions are authenticated
#[derive(Clone, Debug)]
#[cfg_attr(docsrs, doc(cfg(feature = "ssh")))]
pub struct SshConfig {
    /// The remote user
    pub user: String,

    /// A private key used for public-key authentication
    ///
    /// When unset, the local SSH agent is used.
    pub identity: Option<PathBuf>,

    /// The remote port
    pub port: u16,
}

/// Dials SSH sessions with a fixed configuration
#[derive(Clone, Debug)]
#[cfg_attr(docsrs, doc(cfg(feature = "ssh")))]
pub struct SshDialer {
    config: SshConfig,
}

/// An authenticated SSH session
///
/// The session owns its TCP transport, which is shut down when the session is
/// closed or dropped.
///
/// A command's standard error is merged into its standard output on the SSH
/// channel, so all of its output is written to the `stdout` writer in the
/// order the remote produced it.
#[cfg_attr(docsrs, doc(cfg(feature = "ssh")))]
pub struct SshSession {
    session: ssh2::Session,
    transport: Option<TcpStream>,
}

const CHUNK_SIZE: usize = 32 * 1024;

// === impl SshConfig ===

impl SshConfig {
    /// Configures sessions for `user` using agent authentication on the
    /// default port
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            identity: None,
            port: DEFAULT_PORT,
        }
    }
}

// === impl SshDialer ===

impl SshDialer {
    /// Creates a dialer
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl Dial for SshDialer {
    type Session = SshSession;

    async fn dial(&self, token: &CancellationToken, host: &str) -> Result<SshSession, ShellError> {
        if token.is_cancelled() {
            return Err(ShellError::Cancelled);
        }

        let stream = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ShellError::Cancelled),
            res = tokio::net::TcpStream::connect((host, self.config.port)) => {
                res.map_err(|e| ShellError::Connect(e.into()))?
            }
        };

        // We have a TCP connection. A clone of the socket is retained so that
        // it can be force-closed to interrupt the handshake.
        let tcp = stream
            .into_std()
            .and_then(|tcp| tcp.set_nonblocking(false).map(|()| tcp))
            .map_err(|e| ShellError::Connect(e.into()))?;
        let transport = tcp.try_clone().map_err(|e| ShellError::Connect(e.into()))?;

        let config = self.config.clone();
        let mut handshake = task::spawn_blocking(move || handshake(tcp, &config));

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(%host, "Closing SSH connection due to cancellation");
                let _ = transport.shutdown(Shutdown::Both);
                let _ = (&mut handshake).await;
                Err(ShellError::Cancelled)
            }
            res = &mut handshake => {
                let session = res.map_err(|e| ShellError::Connect(e.into()))??;
                debug!(%host, "SSH session established");
                Ok(SshSession {
                    session,
                    transport: Some(transport),
                })
            }
        }
    }
}

fn handshake(tcp: TcpStream, config: &SshConfig) -> Result<ssh2::Session, ShellError> {
    let connect = |e: ssh2::Error| ShellError::Connect(e.into());

    let mut session = ssh2::Session::new().map_err(connect)?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(connect)?;

    match config.identity.as_deref() {
        Some(key) => session
            .userauth_pubkey_file(&config.user, None, key, None)
            .map_err(connect)?,
        None => session.userauth_agent(&config.user).map_err(connect)?,
    }
    if !session.authenticated() {
        let msg = format!("authentication failed for user {}", config.user);
        return Err(ShellError::Connect(msg.into()));
    }

    Ok(session)
}

// === impl SshSession ===

impl SshSession {
    fn shutdown_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            let _ = transport.shutdown(Shutdown::Both);
        }
    }
}

#[async_trait::async_trait]
impl RemoteShell for SshSession {
    async fn exec_piped(
        &mut self,
        token: &CancellationToken,
        command: &str,
        stdout: Output<'_>,
        stderr: Output<'_>,
    ) -> Result<(), ShellError> {
        if token.is_cancelled() {
            return Err(ShellError::Cancelled);
        }
        if self.transport.is_none() {
            return Err(ShellError::Exec {
                command: command.to_string(),
                source: "session is closed".into(),
            });
        }

        debug!(%command, "Running SSH command");
        let (tx, mut rx) = mpsc::channel(16);
        let session = self.session.clone();
        let cmd = command.to_string();
        let exec = task::spawn_blocking(move || run(&session, &cmd, tx));

        let cancelled = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break true,
                chunk = rx.recv() => match chunk {
                    Some(buf) => write_output(stdout, &buf, command).await?,
                    None => break false,
                },
            }
        };

        if cancelled {
            // libssh2 cannot interrupt a single channel, so the whole transport
            // is closed to unblock the command.
            info!(%command, "Closing SSH connection due to cancellation");
            self.shutdown_transport();
            drop(rx);
            let _ = exec.await;
            return Err(ShellError::Cancelled);
        }

        let res = exec.await.map_err(|e| ShellError::Exec {
            command: command.to_string(),
            source: e.into(),
        })?;
        flush_output(stdout, command).await?;
        flush_output(stderr, command).await?;
        res
    }

    async fn close(&mut self) -> Result<(), ShellError> {
        let Some(transport) = self.transport.take() else {
            return Ok(());
        };
        if !self.session.authenticated() {
            let _ = transport.shutdown(Shutdown::Both);
            return Ok(());
        }

        let session = self.session.clone();
        let res = task::spawn_blocking(move || session.disconnect(None, "closing", None)).await;
        let _ = transport.shutdown(Shutdown::Both);
        match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ShellError::Close(e.into())),
            Err(e) => Err(ShellError::Close(e.into())),
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.shutdown_transport();
    }
}

async fn write_output(out: Output<'_>, buf: &[u8], command: &str) -> Result<(), ShellError> {
    out.write_all(buf)
        .await
        .map_err(|source| ShellError::Output {
            command: command.to_string(),
            source,
        })
}

async fn flush_output(out: Output<'_>, command: &str) -> Result<(), ShellError> {
    out.flush().await.map_err(|source| ShellError::Output {
        command: command.to_string(),
        source,
    })
}

/// Runs a command to completion on the blocking pool, forwarding its output
fn run(
    session: &ssh2::Session,
    command: &str,
    tx: mpsc::Sender<Vec<u8>>,
) -> Result<(), ShellError> {
    let exec_error = |source: BoxError| ShellError::Exec {
        command: command.to_string(),
        source,
    };

    let mut channel = session
        .channel_session()
        .map_err(|e| exec_error(e.into()))?;
    channel
        .handle_extended_data(ssh2::ExtendedData::Merge)
        .map_err(|e| exec_error(e.into()))?;
    channel.exec(command).map_err(|e| exec_error(e.into()))?;

    pump(&mut channel, &tx).map_err(|e| exec_error(e.into()))?;

    channel.wait_close().map_err(|e| exec_error(e.into()))?;
    let status = channel.exit_status().map_err(|e| exec_error(e.into()))?;
    if status != 0 {
        return Err(ShellError::ExitStatus {
            command: command.to_string(),
            status,
        });
    }
    Ok(())
}

fn pump<R: Read>(reader: &mut R, tx: &mpsc::Sender<Vec<u8>>) -> std::io::Result<()> {
    let mut buf = vec![0; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        if tx.blocking_send(buf[..n].to_vec()).is_err() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "command output is no longer being read",
            ));
        }
    }
}
