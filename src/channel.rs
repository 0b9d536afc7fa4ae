//! Acknowledgment channel abstractions and backends.
//!
//! The dispatch pipeline only needs a narrow view of the broker channel:
//! acknowledge a delivery, or reject it with or without requeue. Everything
//! else (connection pooling, reconnection, retries) belongs to the broker
//! client.
//!
//! ## Key components
//!
//! - [`AckChannel`]: Trait implemented by channel backends
//! - [`DeliveryHandle`]: Per-delivery handle enforcing at most one settlement
//! - [`InMemory`]: Recording backend for tests and local pipelines
//! - [`AckError`]: Error returned when an acknowledgment cannot be sent

mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::sync::{Arc, Mutex, PoisonError};

use tracing_error::SpanTrace;

pub use inmemory::{AckCall, InMemory};

/// Trait implemented by broker channel backends.
///
/// Implementations must serialize access to the underlying channel if it is
/// not safe to use concurrently.
#[async_trait::async_trait]
pub trait AckChannel: Send + Sync {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Acknowledge a delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), Self::Error>;

    /// Reject a delivery, asking the broker to requeue it or not.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), Self::Error>;
}

#[async_trait::async_trait]
impl<C: AckChannel + ?Sized> AckChannel for Arc<C> {
    type Error = C::Error;

    async fn ack(&self, delivery_tag: u64) -> Result<(), Self::Error> {
        (**self).ack(delivery_tag).await
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), Self::Error> {
        (**self).nack(delivery_tag, requeue).await
    }
}

/// How a delivery was settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Nacked { requeue: bool },
}

/// Handle used to settle one delivery.
///
/// Shared between the callback and the dispatcher. The first `ack` or `nack`
/// is forwarded to the channel; any later call is dropped, so a delivery tag
/// is never settled twice. A settlement the channel rejected is kept as a
/// [`SettlementFailed`], so the dispatcher can surface it.
pub struct DeliveryHandle<C> {
    channel: Arc<C>,
    delivery_tag: u64,
    settled: Arc<Mutex<Option<Slot>>>,
}

#[derive(Debug, Clone)]
struct Slot {
    settlement: Settlement,
    failure: Option<String>,
}

impl<C> Clone for DeliveryHandle<C> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            delivery_tag: self.delivery_tag,
            settled: Arc::clone(&self.settled),
        }
    }
}

impl<C> std::fmt::Debug for DeliveryHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryHandle")
            .field("delivery_tag", &self.delivery_tag)
            .field("settled", &self.settlement())
            .finish()
    }
}

impl<C> DeliveryHandle<C> {
    /// Create an unsettled handle for a delivery received on `channel`.
    pub fn new(channel: Arc<C>, delivery_tag: u64) -> Self {
        Self {
            channel,
            delivery_tag,
            settled: Arc::new(Mutex::new(None)),
        }
    }

    /// Delivery tag this handle settles.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Settlement attempted so far, if any, whether or not the channel took it.
    pub fn settlement(&self) -> Option<Settlement> {
        self.slot().map(|slot| slot.settlement)
    }

    /// Settlement the channel rejected, if any.
    ///
    /// The delivery is still unsettled on the broker side.
    pub fn failure(&self) -> Option<SettlementFailed> {
        let slot = self.slot()?;
        slot.failure.map(|reason| SettlementFailed {
            delivery_tag: self.delivery_tag,
            settlement: slot.settlement,
            reason,
        })
    }

    fn slot(&self) -> Option<Slot> {
        self.settled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record a settlement. Returns `false` if the delivery was already settled.
    fn claim(&self, settlement: Settlement) -> bool {
        let mut settled = self.settled.lock().unwrap_or_else(PoisonError::into_inner);
        if settled.is_some() {
            return false;
        }
        *settled = Some(Slot {
            settlement,
            failure: None,
        });
        true
    }

    fn fail(&self, error: &AckError) {
        let mut settled = self.settled.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = settled.as_mut() {
            slot.failure = Some(error.source.to_string());
        }
    }
}

impl<C: AckChannel> DeliveryHandle<C> {
    /// Acknowledge the delivery.
    ///
    /// Returns `Ok(false)` without contacting the broker if the delivery was
    /// already settled.
    #[tracing::instrument(skip(self), fields(delivery_tag = self.delivery_tag))]
    pub async fn ack(&self) -> Result<bool, AckError> {
        if !self.claim(Settlement::Acked) {
            tracing::warn!(settled = ?self.settlement(), "Delivery already settled, ack dropped");
            return Ok(false);
        }
        if let Err(e) = self.channel.ack(self.delivery_tag).await {
            let error = AckError::channel(e.into());
            self.fail(&error);
            return Err(error);
        }
        Ok(true)
    }

    /// Reject the delivery.
    ///
    /// Returns `Ok(false)` without contacting the broker if the delivery was
    /// already settled.
    #[tracing::instrument(skip(self), fields(delivery_tag = self.delivery_tag))]
    pub async fn nack(&self, requeue: bool) -> Result<bool, AckError> {
        if !self.claim(Settlement::Nacked { requeue }) {
            tracing::warn!(settled = ?self.settlement(), "Delivery already settled, nack dropped");
            return Ok(false);
        }
        if let Err(e) = self.channel.nack(self.delivery_tag, requeue).await {
            let error = AckError::channel(e.into());
            self.fail(&error);
            return Err(error);
        }
        Ok(true)
    }
}

/// A settlement the channel did not accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementFailed {
    pub delivery_tag: u64,
    pub settlement: Settlement,
    pub reason: String,
}

impl std::fmt::Display for SettlementFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} of delivery {} failed: {}",
            self.settlement, self.delivery_tag, self.reason
        )
    }
}

impl std::error::Error for SettlementFailed {}

/// Error returned when an acknowledgment cannot be sent.
///
/// Fatal for the consumer: no further progress can be made on the channel.
#[derive(Debug)]
pub struct AckError {
    context: SpanTrace,
    source: tower::BoxError,
}

impl AckError {
    /// Create a channel-related acknowledgment error.
    pub fn channel(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err,
        }
    }
}

impl std::fmt::Display for AckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Acknowledgment error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for AckError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_settlement_wins() {
        let channel = Arc::new(InMemory::default());
        let handle = DeliveryHandle::new(Arc::clone(&channel), 5);

        assert!(handle.nack(true).await.unwrap());
        assert!(!handle.ack().await.unwrap());
        assert!(!handle.nack(false).await.unwrap());

        assert_eq!(handle.settlement(), Some(Settlement::Nacked { requeue: true }));
        assert_eq!(
            channel.calls().await,
            vec![AckCall::Nack {
                delivery_tag: 5,
                requeue: true
            }]
        );
    }

    #[tokio::test]
    async fn clones_share_settlement() {
        let channel = Arc::new(InMemory::default());
        let handle = DeliveryHandle::new(Arc::clone(&channel), 1);
        let clone = handle.clone();

        assert!(clone.ack().await.unwrap());
        assert!(!handle.ack().await.unwrap());
        assert_eq!(handle.settlement(), Some(Settlement::Acked));
        assert_eq!(channel.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn channel_failure_surfaces_as_ack_error() {
        let channel = Arc::new(InMemory::failing());
        let handle = DeliveryHandle::new(channel, 3);

        let err = handle.ack().await.unwrap_err();
        assert!(err.to_string().starts_with("Acknowledgment error:"));
    }

    #[tokio::test]
    async fn rejected_settlement_is_remembered() {
        let handle = DeliveryHandle::new(Arc::new(InMemory::failing()), 4);
        assert_eq!(handle.failure(), None);

        handle.nack(false).await.unwrap_err();
        assert!(!handle.ack().await.unwrap());

        let failure = handle.failure().unwrap();
        assert_eq!(failure.delivery_tag, 4);
        assert_eq!(failure.settlement, Settlement::Nacked { requeue: false });
        assert!(failure.reason.contains("closed"));
    }

    #[tokio::test]
    async fn accepted_settlement_has_no_failure() {
        let handle = DeliveryHandle::new(Arc::new(InMemory::default()), 5);
        assert!(handle.ack().await.unwrap());
        assert_eq!(handle.failure(), None);
    }
}
