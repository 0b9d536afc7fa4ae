//! Process halt capability.
//!
//! Halting is the only cancellation primitive of the framework. It does not
//! pre-empt an in-flight callback; it tells the surrounding supervisor to stop
//! pulling deliveries and shut the consumers down. The signal is process-wide:
//! one failing consumer stops all of them.
//!
//! The dispatcher receives the capability by injection, so tests can observe
//! a [`HaltSignal`] while production wiring maps it to an OS signal (see
//! `ProcessSignal` and `Supervisor`, behind the `signal` feature).

#[cfg(all(unix, feature = "signal"))]
mod signal;

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

#[cfg(all(unix, feature = "signal"))]
pub use signal::{ProcessSignal, ShutdownCause, Supervisor};

/// Why a dispatch asked the process to halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// The body could not be decoded; the callback never ran.
    DecodeFailed { delivery_tag: u64 },
    /// The callback failed under the `halt` policy.
    CallbackFailed { delivery_tag: u64 },
}

impl HaltReason {
    /// Delivery that triggered the halt.
    pub fn delivery_tag(&self) -> u64 {
        match self {
            HaltReason::DecodeFailed { delivery_tag }
            | HaltReason::CallbackFailed { delivery_tag } => *delivery_tag,
        }
    }
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::DecodeFailed { delivery_tag } => {
                write!(f, "delivery {delivery_tag} could not be decoded")
            }
            HaltReason::CallbackFailed { delivery_tag } => {
                write!(f, "callback failed on delivery {delivery_tag}")
            }
        }
    }
}

/// Capability used to ask the process to halt.
///
/// Invoked synchronously from the dispatch path; implementations must not
/// block.
pub trait Halt: Send + Sync {
    fn halt(&self, reason: &HaltReason);
}

impl<H: Halt + ?Sized> Halt for Arc<H> {
    fn halt(&self, reason: &HaltReason) {
        (**self).halt(reason)
    }
}

impl Halt for CancellationToken {
    fn halt(&self, _reason: &HaltReason) {
        self.cancel();
    }
}

/// Halt capability backed by a closure. Built with [`halt_fn`].
#[derive(Clone, Copy)]
pub struct HaltFn<F> {
    f: F,
}

/// Build a halt capability from a closure, e.g. a supervisor shutdown hook.
pub fn halt_fn<F>(f: F) -> HaltFn<F>
where
    F: Fn(&HaltReason) + Send + Sync,
{
    HaltFn { f }
}

impl<F> Halt for HaltFn<F>
where
    F: Fn(&HaltReason) + Send + Sync,
{
    fn halt(&self, reason: &HaltReason) {
        (self.f)(reason)
    }
}

/// Process-wide halt signal.
///
/// Clones share state. The first reason is kept; later halts only re-cancel
/// the token. Consumer loops watch [`HaltSignal::halted`] to stop pulling.
#[derive(Clone, Debug, Default)]
pub struct HaltSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<HaltReason>>,
}

impl HaltSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a signal that cancels `token` when halted.
    ///
    /// Lets a halt share the token used for ordinary shutdown.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            reason: Arc::default(),
        }
    }

    /// Token cancelled on halt.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// First reason recorded, if a dispatch halted.
    ///
    /// `None` while running, and also when the shared token was cancelled by
    /// something other than a halt.
    pub fn reason(&self) -> Option<HaltReason> {
        self.reason.get().copied()
    }

    /// Wait until the signal is halted.
    pub async fn halted(&self) {
        self.token.cancelled().await
    }
}

impl Halt for HaltSignal {
    fn halt(&self, reason: &HaltReason) {
        if self.reason.set(*reason).is_err() {
            tracing::debug!(%reason, "Halt already signalled");
        }
        self.token.cancel();
    }
}
