#![doc = include_str!("../README.md")]

pub mod channel;
pub mod config;
pub mod consumer;
pub mod decode;
pub mod dispatcher;
pub mod envelope;
pub mod halt;
pub mod policy;

#[doc(inline)]
pub use envelope::{DeliveryMeta, Envelope, Properties};

#[doc(inline)]
pub use channel::{AckChannel, AckError, DeliveryHandle, Settlement, SettlementFailed};

#[doc(inline)]
pub use config::{ConfigError, ConsumerConfig};

#[doc(inline)]
pub use decode::{ContentTypeDecoder, Decode, DecodeError, DecodeErrorKind, Decoded, JsonDecoder};

#[doc(inline)]
pub use dispatcher::{
    Callback, DefaultDispatchHook, DispatchError, DispatchErrorKind, DispatchHook, DispatchService,
    Dispatcher, Incoming,
};

#[doc(inline)]
pub use halt::{Halt, HaltReason, HaltSignal};

#[doc(inline)]
pub use policy::{AckPolicy, OnSuccess, Outcome};

#[doc(inline)]
pub use consumer::{
    Consumer, ConsumerHook, ConsumerRunError, ConsumerRunErrorKind, DefaultConsumerHook,
};
