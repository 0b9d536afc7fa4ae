use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_core::stream::BoxStream;
use tokio::sync::{Mutex, mpsc};

use crate::{
    channel::AckChannel,
    envelope::{Envelope, Properties},
};

/// In-memory queue for testing or local pipelines.
///
/// Behaves like a single broker queue with one consumer:
/// - [`publish`](Self::publish) assigns a fresh delivery tag and enqueues
/// - [`deliveries`](Self::deliveries) streams enqueued envelopes
/// - Acks forget a delivery; nacks with requeue enqueue it again, flagged as
///   redelivered, under a new tag
///
/// Settling an unknown or already settled tag fails, as it would close a real
/// broker channel.
#[derive(Clone)]
pub struct InMemoryQueue {
    inner: Arc<Inner>,
}

struct Inner {
    sender: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    unacked: Mutex<HashMap<u64, Envelope>>,
    next_tag: AtomicU64,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                sender: Mutex::new(Some(sender)),
                receiver: Mutex::new(Some(receiver)),
                unacked: Mutex::default(),
                next_tag: AtomicU64::new(1),
            }),
        }
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message and return its delivery tag.
    ///
    /// Messages published after [`close`](Self::close) are dropped; `None` is
    /// returned.
    pub async fn publish(&self, properties: Properties, body: impl Into<Vec<u8>>) -> Option<u64> {
        let mut envelope = Envelope::new(0, body);
        envelope.properties = properties;
        self.enqueue(envelope).await
    }

    /// Stop accepting messages. The delivery stream ends once drained.
    pub async fn close(&self) {
        self.inner.sender.lock().await.take();
    }

    /// Delivery tags handed out but not yet settled.
    pub async fn unacked(&self) -> Vec<u64> {
        let mut tags: Vec<u64> = self.inner.unacked.lock().await.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    /// Take the delivery stream.
    ///
    /// The queue has a single consumer: only the first call returns a stream.
    pub async fn deliveries(&self) -> Option<BoxStream<'static, Result<Envelope, Infallible>>> {
        let mut receiver = self.inner.receiver.lock().await.take()?;
        Some(Box::pin(async_stream::stream! {
            while let Some(envelope) = receiver.recv().await {
                yield Ok::<_, Infallible>(envelope);
            }
        }))
    }

    async fn enqueue(&self, mut envelope: Envelope) -> Option<u64> {
        let sender = self.inner.sender.lock().await;
        let sender = sender.as_ref()?;

        let delivery_tag = self.inner.next_tag.fetch_add(1, Ordering::Relaxed);
        envelope.meta.delivery_tag = delivery_tag;
        self.inner
            .unacked
            .lock()
            .await
            .insert(delivery_tag, envelope.clone());

        if sender.send(envelope).is_err() {
            self.inner.unacked.lock().await.remove(&delivery_tag);
            return None;
        }
        Some(delivery_tag)
    }

    async fn settle(&self, delivery_tag: u64) -> Result<Envelope, std::io::Error> {
        self.inner
            .unacked
            .lock()
            .await
            .remove(&delivery_tag)
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("unknown delivery tag {delivery_tag}"),
                )
            })
    }
}

#[async_trait::async_trait]
impl AckChannel for InMemoryQueue {
    type Error = std::io::Error;

    #[tracing::instrument(skip(self))]
    async fn ack(&self, delivery_tag: u64) -> Result<(), Self::Error> {
        self.settle(delivery_tag).await?;
        tracing::debug!("Delivery acknowledged by in-memory queue");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), Self::Error> {
        let mut envelope = self.settle(delivery_tag).await?;
        if !requeue {
            tracing::debug!("Delivery dropped by in-memory queue");
            return Ok(());
        }

        envelope.meta.redelivered = true;
        match self.enqueue(envelope).await {
            Some(redelivery_tag) => tracing::debug!(redelivery_tag, "Delivery requeued"),
            None => tracing::warn!("In-memory queue closed, requeued delivery dropped"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt as _;

    #[tokio::test]
    async fn published_messages_are_streamed_in_order() {
        let queue = InMemoryQueue::new();
        assert_eq!(queue.publish(Properties::default(), "a").await, Some(1));
        assert_eq!(queue.publish(Properties::default(), "b").await, Some(2));
        queue.close().await;

        let deliveries: Vec<_> = queue
            .deliveries()
            .await
            .unwrap()
            .map(|d| d.unwrap().body)
            .collect()
            .await;

        assert_eq!(deliveries, vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(queue.deliveries().await.is_none());
    }

    #[tokio::test]
    async fn requeued_delivery_comes_back_redelivered() {
        let queue = InMemoryQueue::new();
        let mut deliveries = queue.deliveries().await.unwrap();
        queue.publish(Properties::default(), "a").await;

        let first = deliveries.next().await.unwrap().unwrap();
        assert!(!first.meta.redelivered);
        queue.nack(first.meta.delivery_tag, true).await.unwrap();

        let second = deliveries.next().await.unwrap().unwrap();
        assert!(second.meta.redelivered);
        assert_ne!(second.meta.delivery_tag, first.meta.delivery_tag);
        assert_eq!(queue.unacked().await, vec![second.meta.delivery_tag]);

        queue.ack(second.meta.delivery_tag).await.unwrap();
        assert!(queue.unacked().await.is_empty());
    }

    #[tokio::test]
    async fn settling_twice_fails() {
        let queue = InMemoryQueue::new();
        let tag = queue.publish(Properties::default(), "a").await.unwrap();

        queue.nack(tag, false).await.unwrap();
        let err = queue.ack(tag).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
