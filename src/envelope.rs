use std::collections::BTreeMap;

/// One delivery received from the broker.
///
/// `Envelope` bundles the raw payload with the delivery method (tag,
/// redelivered flag, routing data) and the message properties (content type,
/// content encoding, headers). It is transport-agnostic: broker adapters build
/// it, and the [`Dispatcher`](crate::Dispatcher) consumes it exactly once.
///
/// ## Lifecycle
///
/// - Created by the broker client when a message arrives
/// - Moved into a single dispatch call
/// - Invalid once the delivery tag has been acked or nacked
///
/// ## Example
///
/// ```rust
/// use letterbox::Envelope;
///
/// let envelope = Envelope::new(7, br#"{"a":1}"#.to_vec())
///     .with_content_type("application/json")
///     .redelivered(true);
///
/// assert_eq!(envelope.meta.delivery_tag, 7);
/// assert!(envelope.meta.redelivered);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Delivery method data assigned by the broker.
    pub meta: DeliveryMeta,
    /// Message properties set by the publisher.
    pub properties: Properties,
    /// Raw message payload.
    pub body: Vec<u8>,
}

impl Envelope {
    /// Create an envelope with default properties and a fresh (not redelivered)
    /// delivery.
    pub fn new(delivery_tag: u64, body: impl Into<Vec<u8>>) -> Self {
        Self {
            meta: DeliveryMeta {
                delivery_tag,
                ..DeliveryMeta::default()
            },
            properties: Properties::default(),
            body: body.into(),
        }
    }

    /// Set the content type hint used to select decoding.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    /// Set the content encoding of the body.
    pub fn with_content_encoding(mut self, content_encoding: impl Into<String>) -> Self {
        self.properties.content_encoding = Some(content_encoding.into());
        self
    }

    /// Attach an application header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.headers.insert(key.into(), value.into());
        self
    }

    /// Mark the delivery as redelivered by the broker.
    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.meta.redelivered = redelivered;
        self
    }

    /// Set the consumer tag the delivery was received on.
    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.meta.consumer_tag = Some(consumer_tag.into());
        self
    }
}

impl From<(DeliveryMeta, Properties, Vec<u8>)> for Envelope {
    fn from(value: (DeliveryMeta, Properties, Vec<u8>)) -> Self {
        Envelope {
            meta: value.0,
            properties: value.1,
            body: value.2,
        }
    }
}

/// Delivery method data.
///
/// Read-only to the consumer: the broker sets every field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryMeta {
    /// Broker-assigned identifier, unique per channel session.
    pub delivery_tag: u64,
    /// Whether the broker attempted this delivery before.
    pub redelivered: bool,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Consumer the delivery was dispatched to, if known.
    pub consumer_tag: Option<String>,
}

/// Message properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    /// MIME type of the body, e.g. `application/json`.
    pub content_type: Option<String>,
    /// Encoding applied to the body, e.g. `zstd`.
    pub content_encoding: Option<String>,
    /// Application headers, stringified.
    pub headers: BTreeMap<String, String>,
}

impl Properties {
    /// Look up an application header.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}
