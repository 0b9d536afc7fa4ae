//! Consumer loop driving deliveries through a dispatcher.
//!
//! This module implements a generic *consumer* that:
//!
//! - Pulls envelopes from a delivery stream, one at a time
//! - Dispatches each through a `tower::Service<Envelope>` (normally a
//!   [`DispatchService`](crate::dispatcher::DispatchService))
//! - Stops pulling as soon as a dispatch halts
//! - Exposes lifecycle hooks for observability and customization
//!
//! The consumer runs until:
//! - The delivery stream ends
//! - A dispatch halts
//! - A fatal error occurs (receive failure, acknowledgment failure)
//! - A [`CancellationToken`] is triggered
//!
//! An in-flight dispatch is never interrupted: cancellation is only observed
//! between deliveries.

mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use tokio_stream::{Stream, StreamExt as _};
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::{
    envelope::{DeliveryMeta, Envelope},
    halt::HaltReason,
    policy::Outcome,
};

pub use inmemory::InMemoryQueue;

/// Delivery consumer.
///
/// Generic parameters:
/// - `St`: Delivery stream
/// - `T`: Dispatch service
/// - `HK`: Hook implementation for lifecycle events
pub struct Consumer<St, T, HK = DefaultConsumerHook> {
    deliveries: St,
    service: T,
    hook: HK,
    consumer_tag: Option<String>,
}

impl<St, T> Consumer<St, T, DefaultConsumerHook> {
    /// Create a new consumer with the default hook implementation.
    pub fn new(deliveries: St, service: T) -> Self {
        Self {
            deliveries,
            service,
            hook: DefaultConsumerHook,
            consumer_tag: None,
        }
    }
}

impl<St, T, HK> Consumer<St, T, HK> {
    /// Replace the consumer hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: ConsumerHook>(self, hook: HK2) -> Consumer<St, T, HK2> {
        Consumer {
            deliveries: self.deliveries,
            service: self.service,
            hook,
            consumer_tag: self.consumer_tag,
        }
    }

    /// Tag recorded on the consumer's tracing span.
    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(consumer_tag.into());
        self
    }

    /// Apply a Tower layer to the dispatch service.
    pub fn layer<L>(self, layer: L) -> Consumer<St, L::Service, HK>
    where
        L: tower::Layer<T>,
    {
        Consumer {
            deliveries: self.deliveries,
            service: layer.layer(self.service),
            hook: self.hook,
            consumer_tag: self.consumer_tag,
        }
    }
}

impl<St, E, T, HK> Consumer<St, T, HK>
where
    St: Stream<Item = Result<Envelope, E>> + Unpin + Send,
    E: Into<tower::BoxError>,
    T: Service<Envelope, Response = Outcome>,
    T::Error: Into<tower::BoxError>,
    HK: ConsumerHook,
{
    /// Run the consumer loop.
    ///
    /// The consumer:
    /// - Waits for the next delivery or cancellation
    /// - Dispatches the delivery to completion
    /// - Stops after a halt outcome, on stream end, or on cancellation
    /// - Returns an error when a delivery cannot be received or settled
    #[tracing::instrument(skip_all, fields(consumer_tag = self.consumer_tag.as_deref()))]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ConsumerRunError> {
        self.hook.on_startup();

        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.hook.on_shutdown();
                    return Ok(());
                }
                delivery = self.deliveries.next() => delivery,
            };

            match delivery {
                Some(Ok(envelope)) => {
                    let meta = envelope.meta.clone();
                    self.hook.on_next_delivery(&meta);

                    let outcome = match dispatch(&mut self.service, envelope).await {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            self.hook.on_dispatch_error(&meta, err.as_ref());
                            return Err(ConsumerRunError::dispatch(err));
                        }
                    };
                    self.hook.on_outcome(&meta, &outcome);

                    if let Outcome::Halt(reason) = outcome {
                        self.hook.on_halt(&reason);
                        return Ok(());
                    }
                }
                Some(Err(err)) => {
                    let err = err.into();
                    self.hook.on_receive_error(err.as_ref());
                    return Err(ConsumerRunError::receive(err));
                }
                None => {
                    self.hook.on_stream_end();
                    return Ok(());
                }
            }
        }
    }
}

async fn dispatch<T>(service: &mut T, envelope: Envelope) -> Result<Outcome, tower::BoxError>
where
    T: Service<Envelope, Response = Outcome>,
    T::Error: Into<tower::BoxError>,
{
    std::future::poll_fn(|cx| service.poll_ready(cx))
        .await
        .map_err(Into::into)?;
    service.call(envelope).await.map_err(Into::into)
}

/// Error returned when the consumer loop fails.
#[derive(Debug)]
pub struct ConsumerRunError {
    context: tracing_error::SpanTrace,
    kind: ConsumerRunErrorKind,
}

impl ConsumerRunError {
    fn receive(error: tower::BoxError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: ConsumerRunErrorKind::Receive(error),
        }
    }

    fn dispatch(error: tower::BoxError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: ConsumerRunErrorKind::Dispatch(error),
        }
    }

    pub fn kind(&self) -> &ConsumerRunErrorKind {
        &self.kind
    }
}

/// Classification of consumer runtime errors.
#[derive(Debug)]
pub enum ConsumerRunErrorKind {
    /// Errors originating from the delivery stream.
    Receive(tower::BoxError),
    /// Errors originating from the dispatch service, e.g. a failed ack.
    Dispatch(tower::BoxError),
}

impl std::fmt::Display for ConsumerRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConsumerRunErrorKind::Receive(err) => writeln!(f, "Receive error: {}", err),
            ConsumerRunErrorKind::Dispatch(err) => writeln!(f, "Dispatch error: {}", err),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConsumerRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConsumerRunErrorKind::Receive(err) => Some(err.as_ref()),
            ConsumerRunErrorKind::Dispatch(err) => Some(err.as_ref()),
        }
    }
}

/// Hook trait for observing consumer lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
pub trait ConsumerHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_next_delivery(&self, meta: &DeliveryMeta);
    fn on_outcome(&self, meta: &DeliveryMeta, outcome: &Outcome);
    fn on_halt(&self, reason: &HaltReason);
    fn on_receive_error(&self, error: &(dyn std::error::Error + 'static));
    fn on_dispatch_error(&self, meta: &DeliveryMeta, error: &(dyn std::error::Error + 'static));
    fn on_stream_end(&self);
}

/// Default consumer hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultConsumerHook;

impl ConsumerHook for DefaultConsumerHook {
    fn on_startup(&self) {
        tracing::info!("Consumer is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Consumer is shutting down");
    }

    fn on_next_delivery(&self, meta: &DeliveryMeta) {
        tracing::debug!(delivery_tag = meta.delivery_tag, "Delivery received");
    }

    fn on_outcome(&self, meta: &DeliveryMeta, outcome: &Outcome) {
        tracing::debug!(delivery_tag = meta.delivery_tag, ?outcome, "Delivery dispatched");
    }

    fn on_halt(&self, reason: &HaltReason) {
        tracing::error!(%reason, "Consumer halted, no further deliveries will be dispatched");
    }

    fn on_receive_error(&self, error: &(dyn std::error::Error + 'static)) {
        tracing::error!(?error, "Error receiving delivery");
    }

    fn on_dispatch_error(&self, meta: &DeliveryMeta, error: &(dyn std::error::Error + 'static)) {
        tracing::error!(delivery_tag = meta.delivery_tag, ?error, "Error settling delivery");
    }

    fn on_stream_end(&self) {
        tracing::info!("Delivery stream ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AckPolicy, Dispatcher,
        channel::{AckCall, InMemory},
        decode::{ContentTypeDecoder, Decoded},
        dispatcher::Incoming,
        halt::HaltSignal,
    };
    use std::{
        convert::Infallible,
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    fn stream_of(
        envelopes: Vec<Envelope>,
    ) -> futures_core::stream::BoxStream<'static, Result<Envelope, Infallible>> {
        Box::pin(tokio_stream::iter(envelopes.into_iter().map(Ok)))
    }

    #[derive(Default)]
    struct Tags(Mutex<Vec<u64>>);

    async fn note(incoming: Incoming<Tags, InMemory>, _: Decoded) -> Result<(), Infallible> {
        incoming.state.0.lock().unwrap().push(incoming.meta.delivery_tag);
        Ok(())
    }

    #[tokio::test]
    async fn dispatches_every_delivery_until_stream_end() {
        let state = Arc::new(Tags::default());
        let service = Dispatcher::new(ContentTypeDecoder, note, HaltSignal::new())
            .into_service(Arc::clone(&state), Arc::new(InMemory::default()));
        let deliveries = stream_of((1..=3).map(|t| Envelope::new(t, b"x".to_vec())).collect());

        Consumer::new(deliveries, service)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*state.0.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn halt_stops_later_deliveries() {
        let state = Arc::new(Tags::default());
        let cancel = CancellationToken::new();
        let halt = HaltSignal::from_token(cancel.clone());
        let service = Dispatcher::new(ContentTypeDecoder, note, halt.clone())
            .into_service(Arc::clone(&state), Arc::new(InMemory::default()));
        let deliveries = stream_of(vec![
            Envelope::new(1, b"x".to_vec()),
            Envelope::new(2, b"{".to_vec()).with_content_type("application/json"),
            Envelope::new(3, b"x".to_vec()),
        ]);

        Consumer::new(deliveries, service).run(cancel.clone()).await.unwrap();

        assert_eq!(*state.0.lock().unwrap(), vec![1]);
        assert_eq!(halt.reason(), Some(HaltReason::DecodeFailed { delivery_tag: 2 }));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_consumer_dispatches_nothing() {
        let state = Arc::new(Tags::default());
        let service = Dispatcher::new(ContentTypeDecoder, note, HaltSignal::new())
            .into_service(Arc::clone(&state), Arc::new(InMemory::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        Consumer::new(stream_of(vec![Envelope::new(1, b"x".to_vec())]), service)
            .run(cancel)
            .await
            .unwrap();

        assert!(state.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ack_failure_ends_the_loop_with_an_error() {
        let fail = |_: Incoming<(), InMemory>, _: Decoded| async {
            Err::<(), _>(std::io::Error::other("boom"))
        };
        let service = Dispatcher::new(ContentTypeDecoder, fail, HaltSignal::new())
            .with_policy(AckPolicy::Discard)
            .into_service(Arc::new(()), Arc::new(InMemory::failing()));

        let err = Consumer::new(stream_of(vec![Envelope::new(1, b"x".to_vec())]), service)
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), ConsumerRunErrorKind::Dispatch(_)));
    }

    #[tokio::test]
    async fn receive_errors_end_the_loop() {
        let service = Dispatcher::new(ContentTypeDecoder, note, HaltSignal::new())
            .into_service(Arc::new(Tags::default()), Arc::new(InMemory::default()));
        let deliveries = tokio_stream::iter(vec![Err::<Envelope, _>(std::io::Error::other(
            "connection reset",
        ))]);

        let err = Consumer::new(deliveries, service)
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), ConsumerRunErrorKind::Receive(_)));
    }

    #[tokio::test]
    async fn requeue_policy_retries_once_then_discards() {
        struct Attempts {
            redelivered: Mutex<Vec<bool>>,
            done: CancellationToken,
        }

        let cancel = CancellationToken::new();
        let state = Arc::new(Attempts {
            redelivered: Mutex::default(),
            done: cancel.clone(),
        });
        let queue = Arc::new(InMemoryQueue::new());
        let deliveries = queue.deliveries().await.unwrap();
        queue
            .publish(crate::envelope::Properties::default(), "poison")
            .await
            .unwrap();

        let fail = |incoming: Incoming<Attempts, InMemoryQueue>, _: Decoded| async move {
            incoming
                .state
                .redelivered
                .lock()
                .unwrap()
                .push(incoming.meta.redelivered);
            if incoming.meta.redelivered {
                incoming.state.done.cancel();
            }
            Err::<(), _>(std::io::Error::other("boom"))
        };
        let service = Dispatcher::new(ContentTypeDecoder, fail, HaltSignal::new())
            .with_policy(AckPolicy::Requeue)
            .into_service(Arc::clone(&state), Arc::clone(&queue));

        Consumer::new(deliveries, service).run(cancel).await.unwrap();

        assert_eq!(*state.redelivered.lock().unwrap(), vec![false, true]);
        assert!(queue.unacked().await.is_empty());
    }

    #[derive(Clone)]
    struct CountLayer(Arc<AtomicUsize>);

    impl<S> tower::Layer<S> for CountLayer {
        type Service = Counted<S>;

        fn layer(&self, inner: S) -> Self::Service {
            Counted {
                inner,
                count: Arc::clone(&self.0),
            }
        }
    }

    struct Counted<S> {
        inner: S,
        count: Arc<AtomicUsize>,
    }

    impl<S: Service<Envelope>> Service<Envelope> for Counted<S> {
        type Response = S::Response;
        type Error = S::Error;
        type Future = S::Future;

        fn poll_ready(
            &mut self,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            self.inner.poll_ready(cx)
        }

        fn call(&mut self, req: Envelope) -> Self::Future {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.inner.call(req)
        }
    }

    #[tokio::test]
    async fn layers_wrap_the_dispatch_service() {
        let count = Arc::new(AtomicUsize::new(0));
        let channel = Arc::new(InMemory::default());
        let service = Dispatcher::new(ContentTypeDecoder, note, HaltSignal::new())
            .with_on_success(crate::OnSuccess::Ack)
            .into_service(Arc::new(Tags::default()), Arc::clone(&channel));

        Consumer::new(
            stream_of(vec![Envelope::new(1, b"a".to_vec()), Envelope::new(2, b"b".to_vec())]),
            service,
        )
        .layer(CountLayer(Arc::clone(&count)))
        .with_consumer_tag("test-consumer")
        .run(CancellationToken::new())
        .await
        .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(
            channel.calls().await,
            vec![AckCall::Ack { delivery_tag: 1 }, AckCall::Ack { delivery_tag: 2 }]
        );
    }
}
