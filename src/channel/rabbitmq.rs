use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use tokio::sync::Mutex;

use crate::channel::AckChannel;

/// RabbitMQ acknowledgment channel.
///
/// Settles deliveries on a `lapin::Channel` with `basic.ack` and
/// `basic.nack`, always for a single delivery tag (`multiple = false`).
///
/// The channel is wrapped in `Arc<Mutex<_>>` so that several consumer tasks
/// sharing it never interleave acknowledgment frames.
#[derive(Clone)]
pub struct RabbitMq {
    /// Shared AMQP channel the deliveries were received on.
    channel: Arc<Mutex<lapin::Channel>>,
}

impl RabbitMq {
    /// Wrap the channel the consumer was declared on.
    pub fn new(channel: lapin::Channel) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
        }
    }
}

#[async_trait]
impl AckChannel for RabbitMq {
    type Error = lapin::Error;

    #[tracing::instrument(skip(self))]
    async fn ack(&self, delivery_tag: u64) -> Result<(), Self::Error> {
        let channel = self.channel.lock().await;
        channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
    }

    #[tracing::instrument(skip(self))]
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), Self::Error> {
        let channel = self.channel.lock().await;
        channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
    }
}
