use futures_core::stream::BoxStream;
use lapin::{message::Delivery, types::AMQPValue};
use tokio_stream::StreamExt as _;

use crate::envelope::{DeliveryMeta, Envelope, Properties};

/// Turn a `lapin::Consumer` into a stream of [`Envelope`]s.
///
/// Deliveries keep the consumer tag they were received on. Settle them with
/// [`channel::rabbitmq::RabbitMq`](crate::channel::rabbitmq::RabbitMq) built
/// on the same AMQP channel; the `Acker` carried by each delivery is dropped.
///
/// The consumer must be declared with `no_ack = false`, otherwise the broker
/// considers every delivery settled on send.
pub fn deliveries(consumer: lapin::Consumer) -> BoxStream<'static, Result<Envelope, lapin::Error>> {
    let consumer_tag = consumer.tag().as_str().to_owned();
    Box::pin(consumer.map(move |delivery| {
        delivery.map(|delivery| Envelope::from(delivery).with_consumer_tag(consumer_tag.as_str()))
    }))
}

impl From<Delivery> for Envelope {
    /// Map an AMQP delivery.
    ///
    /// Headers are stringified; nested tables, arrays and byte arrays are
    /// skipped.
    fn from(delivery: Delivery) -> Self {
        let props = &delivery.properties;
        let properties = Properties {
            content_type: props.content_type().as_ref().map(|v| v.as_str().to_owned()),
            content_encoding: props
                .content_encoding()
                .as_ref()
                .map(|v| v.as_str().to_owned()),
            headers: props
                .headers()
                .as_ref()
                .map(|table| {
                    table
                        .inner()
                        .iter()
                        .filter_map(|(k, v)| header_value(v).map(|v| (k.as_str().to_owned(), v)))
                        .collect()
                })
                .unwrap_or_default(),
        };

        let meta = DeliveryMeta {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            consumer_tag: None,
        };

        Envelope::from((meta, properties, delivery.data))
    }
}

fn header_value(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_owned()),
        AMQPValue::Boolean(b) => Some(b.to_string()),
        AMQPValue::ShortShortInt(i) => Some(i.to_string()),
        AMQPValue::ShortShortUInt(i) => Some(i.to_string()),
        AMQPValue::ShortInt(i) => Some(i.to_string()),
        AMQPValue::ShortUInt(i) => Some(i.to_string()),
        AMQPValue::LongInt(i) => Some(i.to_string()),
        AMQPValue::LongUInt(i) => Some(i.to_string()),
        AMQPValue::LongLongInt(i) => Some(i.to_string()),
        AMQPValue::Timestamp(t) => Some(t.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_headers_are_stringified() {
        assert_eq!(
            header_value(&AMQPValue::LongString("zstd".into())).as_deref(),
            Some("zstd")
        );
        assert_eq!(
            header_value(&AMQPValue::LongInt(-3)).as_deref(),
            Some("-3")
        );
        assert_eq!(
            header_value(&AMQPValue::Boolean(true)).as_deref(),
            Some("true")
        );
        assert_eq!(header_value(&AMQPValue::Void), None);
    }
}
