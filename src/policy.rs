//! Acknowledgment policies.
//!
//! Every delivery walks the same two-step state machine:
//!
//! ```text
//! Pending --decode--> Decoded --invoke--> Succeeded
//!    |                   |
//!    +--> DecodeFailed   +--> CallbackFailed
//! ```
//!
//! An [`AckPolicy`] maps the terminal [`Stage`] to exactly one [`Outcome`].
//! Decode failures always halt, whatever the policy: a body that cannot be
//! decoded points at a producer/consumer contract mismatch that needs an
//! operator.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{channel::Settlement, envelope::DeliveryMeta, halt::HaltReason};

/// What to do with a delivery whose callback failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// Send nothing and halt the process.
    #[default]
    Halt,
    /// Reject without requeue.
    Discard,
    /// Reject with requeue, unless the delivery was already redelivered.
    Requeue,
}

/// What to do with a delivery whose callback succeeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnSuccess {
    /// Leave the ack to the callback or to broker auto-ack.
    #[default]
    Delegate,
    /// Ack the delivery, unless the callback already settled it.
    Ack,
}

/// Terminal state of a delivery's dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    DecodeFailed,
    Succeeded,
    CallbackFailed,
}

/// Single terminal outcome of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Delivery acknowledged.
    Ack,
    /// Callback succeeded; acknowledgment left outside the framework.
    Delegated,
    /// Delivery rejected, not requeued.
    NackDiscard,
    /// Delivery rejected and requeued.
    NackRequeue,
    /// Nothing sent; the process was signalled to halt.
    Halt(HaltReason),
}

impl Outcome {
    /// Outcome matching a settlement already made on the delivery.
    pub fn from_settlement(settlement: Settlement) -> Self {
        match settlement {
            Settlement::Acked => Outcome::Ack,
            Settlement::Nacked { requeue: true } => Outcome::NackRequeue,
            Settlement::Nacked { requeue: false } => Outcome::NackDiscard,
        }
    }

    /// Whether the outcome halts the process.
    pub fn is_halt(&self) -> bool {
        matches!(self, Outcome::Halt(_))
    }
}

impl AckPolicy {
    /// Resolve a terminal stage into an outcome.
    ///
    /// Pure: the caller performs the side effect the outcome describes.
    pub fn resolve(self, stage: Stage, meta: &DeliveryMeta, on_success: OnSuccess) -> Outcome {
        let delivery_tag = meta.delivery_tag;
        match (stage, self) {
            (Stage::DecodeFailed, _) => Outcome::Halt(HaltReason::DecodeFailed { delivery_tag }),
            (Stage::Succeeded, _) => match on_success {
                OnSuccess::Delegate => Outcome::Delegated,
                OnSuccess::Ack => Outcome::Ack,
            },
            (Stage::CallbackFailed, AckPolicy::Halt) => {
                Outcome::Halt(HaltReason::CallbackFailed { delivery_tag })
            }
            (Stage::CallbackFailed, AckPolicy::Discard) => Outcome::NackDiscard,
            // A second failure of the same message is likely deterministic.
            (Stage::CallbackFailed, AckPolicy::Requeue) if meta.redelivered => Outcome::NackDiscard,
            (Stage::CallbackFailed, AckPolicy::Requeue) => Outcome::NackRequeue,
        }
    }
}

impl fmt::Display for AckPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AckPolicy::Halt => "halt",
            AckPolicy::Discard => "discard",
            AckPolicy::Requeue => "requeue",
        })
    }
}

impl FromStr for AckPolicy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "halt" => Ok(AckPolicy::Halt),
            "discard" => Ok(AckPolicy::Discard),
            "requeue" => Ok(AckPolicy::Requeue),
            _ => Err(ParseError::new("ack policy", s)),
        }
    }
}

impl fmt::Display for OnSuccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OnSuccess::Delegate => "delegate",
            OnSuccess::Ack => "ack",
        })
    }
}

impl FromStr for OnSuccess {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delegate" => Ok(OnSuccess::Delegate),
            "ack" => Ok(OnSuccess::Ack),
            _ => Err(ParseError::new("success mode", s)),
        }
    }
}

/// Error returned when parsing a policy or success mode from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    what: &'static str,
    value: String,
}

impl ParseError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.what, self.value)
    }
}

impl std::error::Error for ParseError {}
