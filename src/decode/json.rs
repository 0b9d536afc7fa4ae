use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use crate::{
    decode::{Decode, DecodeError, decode_body},
    envelope::Properties,
};

/// Value produced by the [`ContentTypeDecoder`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Body declared as JSON and parsed.
    Json(serde_json::Value),
    /// Body passed through unchanged for the callback to interpret.
    Raw(Vec<u8>),
}

impl Decoded {
    /// Return the JSON value, if the body was parsed as JSON.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Decoded::Json(value) => Some(value),
            Decoded::Raw(_) => None,
        }
    }

    /// Return the raw bytes, if the body was passed through.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Decoded::Json(_) => None,
            Decoded::Raw(bytes) => Some(bytes),
        }
    }
}

/// Default decoder: content-type aware JSON or passthrough.
///
/// - `application/json` and any `+json` structured suffix (for example
///   `application/cloudevents+json`) are parsed into [`Decoded::Json`]
/// - Media type parameters such as `; charset=utf-8` are ignored
/// - Any other or absent content type yields [`Decoded::Raw`] with the body
///   unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentTypeDecoder;

impl Decode for ContentTypeDecoder {
    type Output = Decoded;

    fn decode(&self, body: &[u8], properties: &Properties) -> Result<Decoded, DecodeError> {
        let body = decode_body(body, properties)?;

        if properties.content_type.as_deref().is_some_and(is_json) {
            let value = serde_json::from_slice(&body)?;
            Ok(Decoded::Json(value))
        } else {
            Ok(Decoded::Raw(body.into_owned()))
        }
    }
}

/// Typed JSON decoder.
///
/// Parses every body as JSON into `T`, whatever the declared content type.
pub struct JsonDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDecoder<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonDecoder<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decode for JsonDecoder<T> {
    type Output = T;

    fn decode(&self, body: &[u8], properties: &Properties) -> Result<T, DecodeError> {
        let body = decode_body(body, properties)?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Whether a content type denotes a JSON document.
pub(crate) fn is_json(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    essence == "application/json" || essence.ends_with("+json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;
    use serde_json::json;

    fn typed(content_type: Option<&str>) -> Properties {
        Properties {
            content_type: content_type.map(str::to_owned),
            ..Properties::default()
        }
    }

    #[test]
    fn json_content_type_is_parsed() {
        let decoded = ContentTypeDecoder
            .decode(br#"{"a":1}"#, &typed(Some("application/json")))
            .unwrap();
        assert_eq!(decoded, Decoded::Json(json!({"a": 1})));
    }

    #[test]
    fn json_variants_are_recognized() {
        assert!(is_json("application/json; charset=utf-8"));
        assert!(is_json("Application/JSON"));
        assert!(is_json("application/cloudevents+json"));
        assert!(!is_json("text/plain"));
        assert!(!is_json("application/jsonl"));
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        let err = ContentTypeDecoder
            .decode(b"not json", &typed(Some("application/json")))
            .unwrap_err();
        assert!(matches!(err.kind(), crate::decode::DecodeErrorKind::Json(_)));
    }

    #[test]
    fn missing_content_type_passes_bytes_through() {
        let decoded = ContentTypeDecoder.decode(b"hello", &typed(None)).unwrap();
        assert_eq!(decoded.as_bytes(), Some(&b"hello"[..]));
        assert_eq!(decoded.as_json(), None);
    }

    #[test]
    fn typed_decoder_deserializes_into_target() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Order {
            id: u32,
        }

        let order = JsonDecoder::<Order>::new()
            .decode(br#"{"id":9}"#, &typed(None))
            .unwrap();
        assert_eq!(order, Order { id: 9 });

        assert!(
            JsonDecoder::<Order>::new()
                .decode(br#"{"name":"x"}"#, &typed(None))
                .is_err()
        );
    }

    fn json_value() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            "[a-zA-Z0-9 ]{0,12}".prop_map(serde_json::Value::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::from),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn json_bodies_round_trip(value in json_value()) {
            let body = serde_json::to_vec(&value).unwrap();
            let decoded = ContentTypeDecoder
                .decode(&body, &typed(Some("application/json")))
                .unwrap();
            prop_assert_eq!(decoded, Decoded::Json(value));
        }

        #[test]
        fn non_json_bodies_are_returned_unchanged(
            body in prop::collection::vec(any::<u8>(), 0..64),
            content_type in prop::option::of("(text/plain|application/octet-stream|image/png)"),
        ) {
            let decoded = ContentTypeDecoder
                .decode(&body, &typed(content_type.as_deref()))
                .unwrap();
            prop_assert_eq!(decoded, Decoded::Raw(body));
        }
    }
}
