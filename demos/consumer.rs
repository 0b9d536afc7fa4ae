use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use letterbox::consumer::InMemoryQueue;
use letterbox::{
    Consumer, ConsumerConfig, ContentTypeDecoder, Decoded, Dispatcher, HaltSignal, Incoming,
    Properties,
};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Default)]
struct Stats {
    processed: AtomicUsize,
}

async fn handle(incoming: Incoming<Stats, InMemoryQueue>, message: Decoded) -> Result<(), std::io::Error> {
    let Some(order) = message.as_json() else {
        return Err(std::io::Error::other("expected a JSON order"));
    };
    if order["amount"].as_i64().unwrap_or_default() < 0 {
        return Err(std::io::Error::other("negative amount"));
    }

    incoming.state.processed.fetch_add(1, Ordering::Relaxed);
    tracing::info!(delivery_tag = incoming.meta.delivery_tag, %order, "Order processed");
    incoming
        .delivery
        .ack()
        .await
        .map_err(std::io::Error::other)?;
    Ok(())
}

fn json() -> Properties {
    Properties {
        content_type: Some("application/json".to_owned()),
        ..Properties::default()
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    // LETTERBOX_ACK_POLICY=requeue shows a retry before the discard
    let config = ConsumerConfig::from_env().expect("invalid consumer configuration");

    let cancel = CancellationToken::new();
    let halt = HaltSignal::from_token(cancel.clone());
    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => cancel_signal.cancel(),
            _ = cancel_signal.cancelled() => {}
        }
    });

    let queue = Arc::new(InMemoryQueue::new());
    let deliveries = queue.deliveries().await.expect("queue already consumed");

    let publisher = Arc::clone(&queue);
    let publish_handle = tokio::spawn(async move {
        for body in [
            r#"{"id":1,"amount":10}"#,
            r#"{"id":2,"amount":-5}"#,
            r#"{"id":3,"amount":7}"#,
            r#"{"id":4,"amount":"#,
            r#"{"id":5,"amount":1}"#,
        ] {
            publisher.publish(json(), body).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });

    let stats = Arc::new(Stats::default());
    let service = Dispatcher::new(ContentTypeDecoder, handle, halt.clone())
        .with_config(&config)
        .into_service(Arc::clone(&stats), Arc::clone(&queue));

    let mut consumer = Consumer::new(deliveries, service);
    if let Some(tag) = &config.consumer_tag {
        consumer = consumer.with_consumer_tag(tag);
    }
    let consumer_handle = tokio::spawn(consumer.run(cancel));

    let (cancel_res, publish_res, consumer_res) =
        tokio::join!(cancel_handle, publish_handle, consumer_handle);
    cancel_res.unwrap();
    publish_res.unwrap();
    consumer_res.unwrap().unwrap();

    tracing::info!(
        processed = stats.processed.load(Ordering::Relaxed),
        unacked = ?queue.unacked().await,
        halt = ?halt.reason(),
        "Consumer stopped"
    );
}
