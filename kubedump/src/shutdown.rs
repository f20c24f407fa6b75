//! Converts process signals into cancellation of a run
//!
//! The first `SIGINT` or `SIGTERM` cancels the run's token so that collectors
//! unwind and report what they have written. A second signal aborts.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Drives cancellation by watching signals
#[derive(Debug)]
#[must_use = "call `Shutdown::on_signal` to await a signal"]
pub struct Shutdown {
    signals: Signals,
    token: CancellationToken,
}

#[cfg(unix)]
#[derive(Debug)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(windows)]
#[derive(Debug)]
struct Signals {
    ctrl_c: tokio::signal::windows::CtrlC,
    ctrl_break: tokio::signal::windows::CtrlBreak,
}

/// Indicates whether the run ended on its own or was forced by a second signal
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Completion {
    /// The token was cancelled without a signal being received.
    Terminated,

    /// A second signal was received after the token was cancelled.
    Aborted,
}

/// Indicates an error registering a signal handler
#[derive(Debug, thiserror::Error)]
#[error("failed to register signal handler: {0}")]
pub struct RegisterError(#[from] std::io::Error);

/// Registers signal handlers that cancel `token`
pub fn register(token: CancellationToken) -> Result<Shutdown, RegisterError> {
    let signals = Signals::new()?;
    Ok(Shutdown { signals, token })
}

// === impl Shutdown ===

impl Shutdown {
    /// Watches for signals and cancels the token on the first one
    ///
    /// If the token is cancelled by other means before a signal is received,
    /// [`Completion::Terminated`] is returned. Otherwise, this future
    /// completes when a second signal is received, returning
    /// [`Completion::Aborted`].
    pub async fn on_signal(mut self) -> Completion {
        tokio::select! {
            signal = self.signals.recv() => {
                info!(%signal, "Received shutdown signal; cancelling");
                self.token.cancel();
            }
            _ = self.token.cancelled() => {
                debug!("Cancelled");
                return Completion::Terminated;
            }
        }

        let signal = self.signals.recv().await;
        info!(%signal, "Received second shutdown signal; aborting");
        Completion::Aborted
    }
}

// === impl Signals ===

#[cfg(unix)]
impl Signals {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Waits for a signal, returning its name
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

#[cfg(windows)]
impl Signals {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::windows::{ctrl_break, ctrl_c};
        Ok(Self {
            ctrl_c: ctrl_c()?,
            ctrl_break: ctrl_break()?,
        })
    }

    /// Waits for a signal, returning its name
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.ctrl_c.recv() => "Ctrl-C",
            _ = self.ctrl_break.recv() => "Ctrl-Break",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminates_when_cancelled() {
        let token = CancellationToken::new();
        let shutdown = register(token.clone()).expect("signals must register");
        let mut task = tokio_test::task::spawn(shutdown.on_signal());
        tokio_test::assert_pending!(task.poll());

        token.cancel();
        assert!(task.is_woken());
        assert_eq!(
            tokio_test::assert_ready!(task.poll()),
            Completion::Terminated
        );
    }
}
