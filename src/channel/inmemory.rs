use std::sync::Arc;

use tokio::sync::Mutex;

use crate::channel::AckChannel;

/// Acknowledgment call recorded by the [`InMemory`] channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCall {
    Ack { delivery_tag: u64 },
    Nack { delivery_tag: u64, requeue: bool },
}

/// In-memory acknowledgment channel for testing or local pipelines.
///
/// Records every ack and nack in order instead of talking to a broker. It is
/// useful for:
/// - Unit and integration testing
/// - Simulating a consumer without a real broker
/// - Debugging acknowledgment flows
///
/// A channel built with [`InMemory::failing`] rejects every call, as a closed
/// broker channel would.
#[derive(Clone, Default)]
pub struct InMemory {
    /// Recorded calls, in the order they were made
    calls: Arc<Mutex<Vec<AckCall>>>,
    /// Whether every call fails
    closed: bool,
}

impl InMemory {
    /// Create a channel whose acknowledgments always fail.
    pub fn failing() -> Self {
        Self {
            calls: Arc::default(),
            closed: true,
        }
    }

    /// Return a copy of all recorded calls.
    pub async fn calls(&self) -> Vec<AckCall> {
        self.calls.lock().await.clone()
    }

    /// Return all recorded calls and clear the internal log.
    pub async fn take_calls(&self) -> Vec<AckCall> {
        let mut calls = self.calls.lock().await;
        std::mem::take(&mut *calls)
    }

    async fn record(&self, call: AckCall) -> Result<(), std::io::Error> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "in-memory channel is closed",
            ));
        }
        self.calls.lock().await.push(call);
        tracing::debug!(?call, "Acknowledgment recorded by in-memory channel");
        Ok(())
    }
}

#[async_trait::async_trait]
impl AckChannel for InMemory {
    type Error = std::io::Error;

    #[tracing::instrument(skip(self))]
    async fn ack(&self, delivery_tag: u64) -> Result<(), Self::Error> {
        self.record(AckCall::Ack { delivery_tag }).await
    }

    #[tracing::instrument(skip(self))]
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), Self::Error> {
        self.record(AckCall::Nack {
            delivery_tag,
            requeue,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn calls_are_recorded_in_order() {
        let channel = InMemory::default();
        channel.ack(1).await.unwrap();
        channel.nack(2, false).await.unwrap();

        assert_eq!(
            channel.take_calls().await,
            vec![
                AckCall::Ack { delivery_tag: 1 },
                AckCall::Nack {
                    delivery_tag: 2,
                    requeue: false
                },
            ]
        );
        assert!(channel.calls().await.is_empty());
    }

    #[tokio::test]
    async fn failing_channel_records_nothing() {
        let channel = InMemory::failing();
        let err = channel.nack(1, true).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
        assert!(channel.calls().await.is_empty());
    }
}
