use nix::sys::signal::{Signal, raise};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use crate::halt::{Halt, HaltReason};

/// Halt capability that raises a signal on the current process.
///
/// - Callback failure raises `SIGUSR1`
/// - Decode failure raises `SIGUSR2`
///
/// Install a [`Supervisor`] before dispatching anything: without a handler,
/// the default action of both signals terminates the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSignal;

impl ProcessSignal {
    fn signal_for(reason: &HaltReason) -> Signal {
        match reason {
            HaltReason::CallbackFailed { .. } => Signal::SIGUSR1,
            HaltReason::DecodeFailed { .. } => Signal::SIGUSR2,
        }
    }
}

impl Halt for ProcessSignal {
    fn halt(&self, reason: &HaltReason) {
        let sig = Self::signal_for(reason);
        tracing::error!(%reason, signal = sig.as_str(), "Raising halt signal");
        if let Err(errno) = raise(sig) {
            tracing::error!(%errno, signal = sig.as_str(), "Failed to raise halt signal");
        }
    }
}

/// Why the supervisor started the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// `SIGUSR1`: a callback failed under the `halt` policy.
    CallbackFailure,
    /// `SIGUSR2`: a delivery could not be decoded.
    DecodeFailure,
    /// `SIGTERM`.
    Terminate,
    /// `SIGINT` / ctrl-c.
    Interrupt,
    /// The token was cancelled by someone else.
    Cancelled,
}

/// Turns process signals into a graceful consumer shutdown.
///
/// Listens for the halt signals raised by [`ProcessSignal`] as well as
/// `SIGTERM` and ctrl-c, then cancels the token the consumer loops run with,
/// so they finish their in-flight delivery and stop.
pub struct Supervisor {
    token: CancellationToken,
    callback_failure: tokio::signal::unix::Signal,
    decode_failure: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

impl Supervisor {
    /// Register the signal handlers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn install(token: CancellationToken) -> std::io::Result<Self> {
        Ok(Self {
            token,
            callback_failure: signal(SignalKind::user_defined1())?,
            decode_failure: signal(SignalKind::user_defined2())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for a shutdown trigger and cancel the token.
    #[tracing::instrument(skip(self))]
    pub async fn wait(mut self) -> ShutdownCause {
        let cause = tokio::select! {
            biased;
            _ = self.token.cancelled() => ShutdownCause::Cancelled,
            _ = self.callback_failure.recv() => ShutdownCause::CallbackFailure,
            _ = self.decode_failure.recv() => ShutdownCause::DecodeFailure,
            _ = self.terminate.recv() => ShutdownCause::Terminate,
            _ = tokio::signal::ctrl_c() => ShutdownCause::Interrupt,
        };

        match cause {
            ShutdownCause::CallbackFailure | ShutdownCause::DecodeFailure => {
                tracing::error!(?cause, "Halt requested, shutting consumers down");
            }
            _ => tracing::info!(?cause, "Shutting consumers down"),
        }
        self.token.cancel();
        cause
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_map_to_user_signals() {
        assert_eq!(
            ProcessSignal::signal_for(&HaltReason::CallbackFailed { delivery_tag: 1 }),
            Signal::SIGUSR1
        );
        assert_eq!(
            ProcessSignal::signal_for(&HaltReason::DecodeFailed { delivery_tag: 1 }),
            Signal::SIGUSR2
        );
    }

    #[tokio::test]
    async fn raised_halt_cancels_the_token() {
        let token = CancellationToken::new();
        let supervisor = Supervisor::install(token.clone()).unwrap();

        ProcessSignal.halt(&HaltReason::DecodeFailed { delivery_tag: 3 });

        assert_eq!(supervisor.wait().await, ShutdownCause::DecodeFailure);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn external_cancel_ends_the_wait() {
        let token = CancellationToken::new();
        let supervisor = Supervisor::install(token.clone()).unwrap();

        token.cancel();
        assert_eq!(supervisor.wait().await, ShutdownCause::Cancelled);
    }
}
