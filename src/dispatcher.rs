//! Per-delivery dispatch: decode, invoke, resolve, settle.
//!
//! The [`Dispatcher`] composes a [`Decode`] implementation, a user
//! [`Callback`], an [`AckPolicy`] and a [`Halt`] capability. For every
//! [`Envelope`] it:
//!
//! - Decodes the body; a failure halts without invoking the callback
//! - Invokes the callback with the decoded message and the delivery context
//! - Catches callback errors and panics
//! - Resolves the terminal stage into exactly one [`Outcome`]
//! - Performs that outcome once: ack, nack, halt, or nothing (delegated)
//!
//! Decode and callback failures never escape `dispatch`. Only failures to
//! talk to the broker do, as [`DispatchError`]: they are fatal for the
//! channel.

use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_util::FutureExt as _;
use tower::Service;
use tracing_error::SpanTrace;

use crate::{
    channel::{AckChannel, AckError, DeliveryHandle, Settlement},
    config::ConsumerConfig,
    decode::{Decode, DecodeError},
    envelope::{DeliveryMeta, Envelope, Properties},
    halt::{Halt, HaltReason},
    policy::{AckPolicy, OnSuccess, Outcome, Stage},
};

/// Everything a callback gets besides the decoded message.
pub struct Incoming<S, C> {
    /// Consumer state shared by every dispatch of this consumer.
    pub state: Arc<S>,
    /// Handle to settle the delivery from inside the callback.
    ///
    /// Settling here suppresses the framework's own ack or nack.
    pub delivery: DeliveryHandle<C>,
    /// Delivery method data.
    pub meta: DeliveryMeta,
    /// Message properties.
    pub properties: Properties,
}

/// User business logic invoked for every decoded message.
///
/// Implemented for async closures taking `(Incoming<S, C>, M)` and returning
/// `Result<(), E>` where `E: Into<BoxError>`. The success value is ignored.
#[async_trait::async_trait]
pub trait Callback<S, C, M>: Send + Sync {
    async fn call(&self, incoming: Incoming<S, C>, message: M) -> Result<(), tower::BoxError>;
}

#[async_trait::async_trait]
impl<S, C, M, F, Fut, E> Callback<S, C, M> for F
where
    S: Send + Sync + 'static,
    C: Send + Sync + 'static,
    M: Send + 'static,
    F: Fn(Incoming<S, C>, M) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), E>> + Send,
    E: Into<tower::BoxError>,
{
    async fn call(&self, incoming: Incoming<S, C>, message: M) -> Result<(), tower::BoxError> {
        (self)(incoming, message).await.map_err(Into::into)
    }
}

/// Consumer callback dispatcher.
///
/// Generic parameters:
/// - `D`: Decoder
/// - `F`: Callback
/// - `H`: Halt capability
/// - `HK`: Hook implementation for dispatch events
pub struct Dispatcher<D, F, H, HK = DefaultDispatchHook> {
    decoder: D,
    callback: F,
    halt: H,
    hook: HK,
    policy: AckPolicy,
    on_success: OnSuccess,
}

impl<D, F, H> Dispatcher<D, F, H, DefaultDispatchHook> {
    /// Create a dispatcher with the `halt` policy, delegated success
    /// acknowledgment and the default hook.
    pub fn new(decoder: D, callback: F, halt: H) -> Self {
        Self {
            decoder,
            callback,
            halt,
            hook: DefaultDispatchHook,
            policy: AckPolicy::default(),
            on_success: OnSuccess::default(),
        }
    }
}

impl<D, F, H, HK> Dispatcher<D, F, H, HK> {
    /// Set the policy applied when the callback fails.
    pub fn with_policy(mut self, policy: AckPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set what happens when the callback succeeds.
    pub fn with_on_success(mut self, on_success: OnSuccess) -> Self {
        self.on_success = on_success;
        self
    }

    /// Apply the acknowledgment settings of a consumer configuration.
    pub fn with_config(self, config: &ConsumerConfig) -> Self {
        self.with_policy(config.policy)
            .with_on_success(config.on_success)
    }

    /// Replace the dispatch hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: DispatchHook>(self, hook: HK2) -> Dispatcher<D, F, H, HK2> {
        Dispatcher {
            decoder: self.decoder,
            callback: self.callback,
            halt: self.halt,
            hook,
            policy: self.policy,
            on_success: self.on_success,
        }
    }

    /// Policy applied when the callback fails.
    pub fn policy(&self) -> AckPolicy {
        self.policy
    }

    /// What happens when the callback succeeds.
    pub fn on_success(&self) -> OnSuccess {
        self.on_success
    }

    /// Bind the dispatcher to a consumer's state and channel, producing a
    /// Tower service over [`Envelope`]s.
    pub fn into_service<S, C>(self, state: Arc<S>, channel: Arc<C>) -> DispatchService<Self, S, C> {
        DispatchService {
            dispatcher: Arc::new(self),
            state,
            channel,
        }
    }
}

impl<D, F, H, HK> Dispatcher<D, F, H, HK>
where
    D: Decode,
    D::Output: Send + 'static,
    H: Halt,
    HK: DispatchHook,
{
    /// Dispatch one delivery.
    ///
    /// Returns the single outcome applied to the delivery. Errors only when an
    /// ack or nack could not be sent.
    #[tracing::instrument(
        skip_all,
        fields(
            delivery_tag = envelope.meta.delivery_tag,
            redelivered = envelope.meta.redelivered,
            consumer_tag = envelope.meta.consumer_tag.as_deref(),
            policy = %self.policy,
        )
    )]
    pub async fn dispatch<S, C>(
        &self,
        state: Arc<S>,
        channel: Arc<C>,
        envelope: Envelope,
    ) -> Result<Outcome, DispatchError>
    where
        C: AckChannel,
        F: Callback<S, C, D::Output>,
    {
        let Envelope {
            meta,
            properties,
            body,
        } = envelope;
        let delivery = DeliveryHandle::new(channel, meta.delivery_tag);

        let message = match self.decoder.decode(&body, &properties) {
            Ok(message) => message,
            Err(error) => {
                self.hook.on_decode_error(&meta, &body, &error);
                let outcome = self
                    .policy
                    .resolve(Stage::DecodeFailed, &meta, self.on_success);
                return self.settle(&meta, &delivery, outcome).await;
            }
        };

        let incoming = Incoming {
            state,
            delivery: delivery.clone(),
            meta: meta.clone(),
            properties,
        };

        let result = AssertUnwindSafe(self.callback.call(incoming, message))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(CallbackPanic::from_payload(payload).into()));

        let stage = match result {
            Ok(()) => Stage::Succeeded,
            Err(error) => {
                self.hook.on_callback_error(&meta, &body, error.as_ref());
                Stage::CallbackFailed
            }
        };

        let outcome = self.policy.resolve(stage, &meta, self.on_success);
        self.settle(&meta, &delivery, outcome).await
    }

    /// Perform an outcome, unless the callback already settled the delivery.
    ///
    /// A settlement the callback attempted but the channel rejected is an
    /// acknowledgment error, whatever the outcome.
    async fn settle<C: AckChannel>(
        &self,
        meta: &DeliveryMeta,
        delivery: &DeliveryHandle<C>,
        outcome: Outcome,
    ) -> Result<Outcome, DispatchError> {
        if let Some(error) = self.failed_settlement(meta, delivery) {
            return Err(error);
        }
        if let Some(settlement) = delivery.settlement() {
            if outcome != Outcome::Delegated {
                self.hook.on_already_settled(meta, settlement, &outcome);
            }
            return Ok(Outcome::from_settlement(settlement));
        }

        let sent = match outcome {
            Outcome::Delegated => {
                self.hook.on_delegated(meta);
                return Ok(outcome);
            }
            Outcome::Halt(reason) => {
                self.hook.on_halt(meta, &reason);
                self.halt.halt(&reason);
                return Ok(outcome);
            }
            Outcome::Ack => {
                self.hook.on_ack(meta);
                delivery.ack().await
            }
            Outcome::NackDiscard => {
                self.hook.on_nack(meta, false);
                delivery.nack(false).await
            }
            Outcome::NackRequeue => {
                self.hook.on_nack(meta, true);
                delivery.nack(true).await
            }
        };

        match sent {
            Ok(true) => Ok(outcome),
            // Settled concurrently by a task the callback spawned.
            Ok(false) => match self.failed_settlement(meta, delivery) {
                Some(error) => Err(error),
                None => Ok(delivery
                    .settlement()
                    .map(Outcome::from_settlement)
                    .unwrap_or(outcome)),
            },
            Err(error) => {
                self.hook.on_ack_error(meta, &error);
                Err(DispatchError::ack(error))
            }
        }
    }

    fn failed_settlement<C>(&self, meta: &DeliveryMeta, delivery: &DeliveryHandle<C>) -> Option<DispatchError> {
        let failure = delivery.failure()?;
        let error = AckError::channel(Box::new(failure));
        self.hook.on_ack_error(meta, &error);
        Some(DispatchError::ack(error))
    }
}

/// A [`Dispatcher`] bound to one consumer's state and channel.
///
/// Implements `tower::Service<Envelope>`, so the consumer loop can be wrapped
/// in Tower middleware (concurrency limits, tracing, etc.).
pub struct DispatchService<T, S, C> {
    dispatcher: Arc<T>,
    state: Arc<S>,
    channel: Arc<C>,
}

impl<T, S, C> Clone for DispatchService<T, S, C> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            state: Arc::clone(&self.state),
            channel: Arc::clone(&self.channel),
        }
    }
}

impl<D, F, H, HK, S, C> Service<Envelope> for DispatchService<Dispatcher<D, F, H, HK>, S, C>
where
    D: Decode + Send + Sync + 'static,
    D::Output: Send + 'static,
    F: Callback<S, C, D::Output> + 'static,
    H: Halt + 'static,
    HK: DispatchHook + 'static,
    S: Send + Sync + 'static,
    C: AckChannel + 'static,
{
    type Response = Outcome;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Outcome, DispatchError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, envelope: Envelope) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            this.dispatcher
                .dispatch(this.state, this.channel, envelope)
                .await
        })
    }
}

/// Error returned when a dispatch could not settle its delivery.
#[derive(Debug)]
pub struct DispatchError {
    context: SpanTrace,
    kind: DispatchErrorKind,
}

/// Dispatch error kinds.
#[derive(Debug)]
pub enum DispatchErrorKind {
    /// The ack or nack could not be sent.
    Ack(AckError),
}

impl DispatchError {
    fn ack(error: AckError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: DispatchErrorKind::Ack(error),
        }
    }

    pub fn kind(&self) -> &DispatchErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DispatchErrorKind::Ack(err) => writeln!(f, "Dispatch error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            DispatchErrorKind::Ack(err) => Some(err),
        }
    }
}

/// Error standing in for a callback that panicked.
#[derive(Debug)]
pub struct CallbackPanic {
    message: String,
}

impl CallbackPanic {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        Self { message }
    }
}

impl std::fmt::Display for CallbackPanic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "callback panicked: {}", self.message)
    }
}

impl std::error::Error for CallbackPanic {}

/// Hook trait for observing dispatch events.
///
/// This is the logger of the dispatcher: every failure is reported here
/// before the corrective action is taken. Hooks run synchronously on the
/// dispatch path and should avoid heavy or blocking work.
pub trait DispatchHook: Send + Sync {
    fn on_decode_error(&self, meta: &DeliveryMeta, body: &[u8], error: &DecodeError);
    fn on_callback_error(&self, meta: &DeliveryMeta, body: &[u8], error: &(dyn std::error::Error + 'static));
    fn on_halt(&self, meta: &DeliveryMeta, reason: &HaltReason);
    fn on_nack(&self, meta: &DeliveryMeta, requeue: bool);
    fn on_ack(&self, meta: &DeliveryMeta);
    fn on_delegated(&self, meta: &DeliveryMeta);
    fn on_already_settled(&self, meta: &DeliveryMeta, settlement: Settlement, skipped: &Outcome);
    fn on_ack_error(&self, meta: &DeliveryMeta, error: &AckError);
}

/// Default dispatch hook implementation.
///
/// Logs with `tracing`. Halts are logged at `ERROR` since they need an
/// operator; discards and requeues are recoverable and logged at `WARN`.
pub struct DefaultDispatchHook;

/// Longest body prefix included in log events.
const BODY_PREVIEW_LEN: usize = 256;

fn preview(body: &[u8]) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(&body[..body.len().min(BODY_PREVIEW_LEN)])
}

impl DispatchHook for DefaultDispatchHook {
    fn on_decode_error(&self, meta: &DeliveryMeta, body: &[u8], error: &DecodeError) {
        tracing::error!(
            delivery_tag = meta.delivery_tag,
            body = %preview(body),
            %error,
            "Message can't be decoded"
        );
    }

    fn on_callback_error(&self, meta: &DeliveryMeta, body: &[u8], error: &(dyn std::error::Error + 'static)) {
        tracing::warn!(
            delivery_tag = meta.delivery_tag,
            body = %preview(body),
            error,
            "Unhandled exception when consuming message"
        );
    }

    fn on_halt(&self, meta: &DeliveryMeta, reason: &HaltReason) {
        tracing::error!(delivery_tag = meta.delivery_tag, %reason, "Halting consumer");
    }

    fn on_nack(&self, meta: &DeliveryMeta, requeue: bool) {
        if requeue {
            tracing::warn!(delivery_tag = meta.delivery_tag, "Requeueing message");
        } else {
            tracing::warn!(
                delivery_tag = meta.delivery_tag,
                redelivered = meta.redelivered,
                "Discarding message"
            );
        }
    }

    fn on_ack(&self, meta: &DeliveryMeta) {
        tracing::debug!(delivery_tag = meta.delivery_tag, "Message acknowledged");
    }

    fn on_delegated(&self, meta: &DeliveryMeta) {
        tracing::debug!(delivery_tag = meta.delivery_tag, "Message consumed");
    }

    fn on_already_settled(&self, meta: &DeliveryMeta, settlement: Settlement, skipped: &Outcome) {
        tracing::warn!(
            delivery_tag = meta.delivery_tag,
            ?settlement,
            ?skipped,
            "Callback already settled the delivery, framework action skipped"
        );
    }

    fn on_ack_error(&self, meta: &DeliveryMeta, error: &AckError) {
        tracing::error!(delivery_tag = meta.delivery_tag, ?error, "Failed to settle delivery");
    }
}
