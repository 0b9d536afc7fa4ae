use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::{Deserialize, de::DeserializeOwned};

use crate::{
    decode::{Decode, DecodeError, decode_body},
    envelope::Properties,
};

const SUPPORTED_SPEC_VERSION: &str = "1.0";

/// Decoder for structured-mode JSON CloudEvents.
///
/// Expects a body of the form published as `application/cloudevents+json`:
/// the context attributes alongside a `data` member holding the payload. The
/// payload is deserialized into `T`.
pub struct CloudEventsDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> CloudEventsDecoder<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for CloudEventsDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CloudEventsDecoder<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decode for CloudEventsDecoder<T> {
    type Output = CloudEvent<T>;

    fn decode(&self, body: &[u8], properties: &Properties) -> Result<CloudEvent<T>, DecodeError> {
        let body = decode_body(body, properties)?;
        let raw: RawCloudEvent = serde_json::from_slice(&body)?;

        if raw.specversion != SUPPORTED_SPEC_VERSION {
            return Err(DecodeError::cloud_events(format!(
                "unsupported specversion {}",
                raw.specversion
            )));
        }

        let time = raw
            .time
            .map(|t| {
                DateTime::parse_from_rfc3339(&t)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| DecodeError::cloud_events(format!("invalid time {t}: {e}")))
            })
            .transpose()?;

        let data = serde_json::from_value(raw.data)?;

        Ok(CloudEvent {
            headers: CloudEventsHeaders {
                spec_version: raw.specversion,
                source: raw.source,
                subject: raw.subject,
                id: raw.id,
                r#type: raw.r#type,
                data_content_type: raw.datacontenttype,
                time,
            },
            data,
        })
    }
}

/// Decoded CloudEvent: context attributes plus typed payload.
#[derive(Clone, Debug, PartialEq)]
pub struct CloudEvent<T> {
    pub headers: CloudEventsHeaders,
    pub data: T,
}

/// CloudEvents context attributes.
#[derive(Clone, Debug, PartialEq)]
pub struct CloudEventsHeaders {
    pub spec_version: String,
    pub source: String,
    pub subject: Option<String>,
    pub id: String,
    pub r#type: String,
    pub data_content_type: Option<String>,
    pub time: Option<DateTime<Utc>>,
}

/// Wire shape of a structured-mode JSON CloudEvent.
#[derive(Deserialize)]
struct RawCloudEvent {
    specversion: String,
    source: String,
    #[serde(default)]
    subject: Option<String>,
    id: String,
    r#type: String,
    #[serde(default)]
    datacontenttype: Option<String>,
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DecodeErrorKind;

    #[derive(Debug, Deserialize, PartialEq)]
    struct UserCreated {
        name: String,
    }

    fn props() -> Properties {
        Properties {
            content_type: Some("application/cloudevents+json".to_owned()),
            ..Properties::default()
        }
    }

    #[test]
    fn structured_event_is_decoded() {
        let body = br#"{
            "specversion": "1.0",
            "source": "users",
            "subject": "user.created",
            "id": "42",
            "type": "created",
            "datacontenttype": "application/json",
            "time": "2024-01-02T03:04:05Z",
            "data": {"name": "ada"}
        }"#;

        let event = CloudEventsDecoder::<UserCreated>::new()
            .decode(body, &props())
            .unwrap();

        assert_eq!(event.data, UserCreated { name: "ada".into() });
        assert_eq!(event.headers.id, "42");
        assert_eq!(event.headers.subject.as_deref(), Some("user.created"));
        assert_eq!(
            event.headers.time.map(|t| t.to_rfc3339()),
            Some("2024-01-02T03:04:05+00:00".to_owned())
        );
    }

    #[test]
    fn unknown_spec_version_is_rejected() {
        let body = br#"{"specversion":"0.3","source":"s","id":"1","type":"t","data":{"name":"x"}}"#;
        let err = CloudEventsDecoder::<UserCreated>::new()
            .decode(body, &props())
            .unwrap_err();
        assert!(matches!(err.kind(), DecodeErrorKind::CloudEvents(_)));
    }

    #[test]
    fn invalid_time_is_rejected() {
        let body = br#"{"specversion":"1.0","source":"s","id":"1","type":"t","time":"yesterday","data":{"name":"x"}}"#;
        let err = CloudEventsDecoder::<UserCreated>::new()
            .decode(body, &props())
            .unwrap_err();
        assert!(matches!(err.kind(), DecodeErrorKind::CloudEvents(_)));
    }

    #[test]
    fn missing_attributes_are_json_errors() {
        let err = CloudEventsDecoder::<UserCreated>::new()
            .decode(br#"{"data":{"name":"x"}}"#, &props())
            .unwrap_err();
        assert!(matches!(err.kind(), DecodeErrorKind::Json(_)));
    }
}
