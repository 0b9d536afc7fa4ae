//! Payload decoding.
//!
//! A decoder turns the raw body of an [`Envelope`](crate::Envelope) plus its
//! [`Properties`] into the value handed to the consumer callback. Decoding is
//! the first step of every dispatch and runs before any business logic, so a
//! [`DecodeError`] always means the callback never ran.
//!
//! ## Key components
//!
//! - [`Decode`]: Trait implemented by every decoder
//! - [`ContentTypeDecoder`]: Default decoder, JSON when the content type says
//!   so, raw bytes otherwise
//! - [`JsonDecoder`]: Typed JSON decoder
//! - [`decode_fn`]: Adapter turning a closure into a decoder
//!
//! Content encoding is resolved before content-type decoding. See
//! [`decode_body`].

mod json;

#[cfg(feature = "cloud-events")]
mod cloud_events;

use std::borrow::Cow;

use tracing_error::SpanTrace;

use crate::envelope::Properties;

pub use json::{ContentTypeDecoder, Decoded, JsonDecoder};

#[cfg(feature = "cloud-events")]
pub use cloud_events::{CloudEvent, CloudEventsDecoder, CloudEventsHeaders};

/// Header consulted when `content_encoding` is not set.
pub const COMPRESSION_HEADER: &str = "compression";

/// Trait implemented by payload decoders.
///
/// Decoders must be pure: no side effects beyond computing the output.
pub trait Decode {
    /// Value produced for the callback.
    type Output;

    /// Decode a message body according to its properties.
    fn decode(&self, body: &[u8], properties: &Properties) -> Result<Self::Output, DecodeError>;
}

impl<D: Decode + ?Sized> Decode for &D {
    type Output = D::Output;

    fn decode(&self, body: &[u8], properties: &Properties) -> Result<Self::Output, DecodeError> {
        (**self).decode(body, properties)
    }
}

/// Decoder backed by a closure. Built with [`decode_fn`].
#[derive(Clone, Copy)]
pub struct DecodeFn<F> {
    f: F,
}

/// Build a decoder from a closure.
///
/// ```rust
/// use letterbox::decode::{Decode, DecodeError, decode_fn};
/// use letterbox::envelope::Properties;
///
/// let utf8 = decode_fn(|body: &[u8], _: &Properties| {
///     String::from_utf8(body.to_vec()).map_err(DecodeError::custom)
/// });
///
/// assert_eq!(utf8.decode(b"hi", &Properties::default()).unwrap(), "hi");
/// ```
pub fn decode_fn<F>(f: F) -> DecodeFn<F> {
    DecodeFn { f }
}

impl<F, T> Decode for DecodeFn<F>
where
    F: Fn(&[u8], &Properties) -> Result<T, DecodeError>,
{
    type Output = T;

    fn decode(&self, body: &[u8], properties: &Properties) -> Result<T, DecodeError> {
        (self.f)(body, properties)
    }
}

/// Undo the content encoding of a body.
///
/// The encoding is read from `content_encoding`, falling back to the
/// [`COMPRESSION_HEADER`] header. `identity` and charset-like values
/// (`utf-8`) leave the body untouched and borrowed.
pub fn decode_body<'a>(body: &'a [u8], properties: &Properties) -> Result<Cow<'a, [u8]>, DecodeError> {
    let encoding = properties
        .content_encoding
        .as_deref()
        .or_else(|| properties.header(COMPRESSION_HEADER))
        .map(|e| e.trim().to_ascii_lowercase());

    match encoding.as_deref() {
        None | Some("") | Some("identity") | Some("utf-8") | Some("utf8") => {
            Ok(Cow::Borrowed(body))
        }
        #[cfg(feature = "compression")]
        Some("zstd") => zstd::decode_all(body)
            .map(Cow::Owned)
            .map_err(DecodeError::encoding),
        Some(other) => Err(DecodeError::unsupported_encoding(other)),
    }
}

/// Error returned when a body cannot be decoded.
///
/// Distinct from callback errors: a decode failure means the producer and
/// consumer disagree on the payload format, or the payload is corrupt.
#[derive(Debug)]
pub struct DecodeError {
    context: SpanTrace,
    kind: DecodeErrorKind,
}

/// Decode error kinds.
#[derive(Debug)]
pub enum DecodeErrorKind {
    /// Body is not valid JSON, or does not match the target type.
    Json(serde_json::Error),
    /// Body could not be decompressed.
    Encoding(std::io::Error),
    /// Content encoding is not supported.
    UnsupportedEncoding(String),
    /// Body is JSON but not a valid CloudEvents document.
    CloudEvents(String),
    /// Error raised by a user-supplied decoder.
    Custom(tower::BoxError),
}

impl DecodeError {
    /// Create a JSON decode error.
    pub fn json(err: serde_json::Error) -> Self {
        Self::new(DecodeErrorKind::Json(err))
    }

    /// Create an error for a body that could not be decompressed.
    pub fn encoding(err: std::io::Error) -> Self {
        Self::new(DecodeErrorKind::Encoding(err))
    }

    /// Create an error for an unknown content encoding.
    pub fn unsupported_encoding(encoding: impl ToString) -> Self {
        Self::new(DecodeErrorKind::UnsupportedEncoding(encoding.to_string()))
    }

    /// Create an error for an invalid CloudEvents document.
    pub fn cloud_events(reason: impl ToString) -> Self {
        Self::new(DecodeErrorKind::CloudEvents(reason.to_string()))
    }

    /// Wrap an error raised by a custom decoder.
    pub fn custom(err: impl Into<tower::BoxError>) -> Self {
        Self::new(DecodeErrorKind::Custom(err.into()))
    }

    /// Return the error kind.
    pub fn kind(&self) -> &DecodeErrorKind {
        &self.kind
    }

    fn new(kind: DecodeErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        Self::json(err)
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DecodeErrorKind::Json(err) => writeln!(f, "JSON decode error: {err}"),
            DecodeErrorKind::Encoding(err) => writeln!(f, "Content encoding error: {err}"),
            DecodeErrorKind::UnsupportedEncoding(enc) => {
                writeln!(f, "Unsupported content encoding: {enc}")
            }
            DecodeErrorKind::CloudEvents(reason) => writeln!(f, "Invalid CloudEvent: {reason}"),
            DecodeErrorKind::Custom(err) => writeln!(f, "Decode error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            DecodeErrorKind::Json(err) => Some(err),
            DecodeErrorKind::Encoding(err) => Some(err),
            DecodeErrorKind::Custom(err) => Some(err.as_ref()),
            DecodeErrorKind::UnsupportedEncoding(_) | DecodeErrorKind::CloudEvents(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(encoding: Option<&str>) -> Properties {
        Properties {
            content_encoding: encoding.map(str::to_owned),
            ..Properties::default()
        }
    }

    #[test]
    fn identity_encodings_borrow_the_body() {
        for enc in [None, Some("identity"), Some("UTF-8"), Some("")] {
            let body = decode_body(b"abc", &props(enc)).unwrap();
            assert!(matches!(body, Cow::Borrowed(b"abc")), "encoding {enc:?}");
        }
    }

    #[test]
    fn unknown_encoding_is_rejected() {
        let err = decode_body(b"abc", &props(Some("brotli"))).unwrap_err();
        assert!(matches!(
            err.kind(),
            DecodeErrorKind::UnsupportedEncoding(enc) if enc == "brotli"
        ));
    }

    #[test]
    fn compression_header_is_used_as_fallback() {
        let mut properties = Properties::default();
        properties
            .headers
            .insert(COMPRESSION_HEADER.to_owned(), "lzma".to_owned());

        let err = decode_body(b"abc", &properties).unwrap_err();
        assert!(matches!(err.kind(), DecodeErrorKind::UnsupportedEncoding(_)));
    }

    #[cfg(feature = "compression")]
    #[test]
    fn zstd_bodies_are_decompressed() {
        let compressed = zstd::encode_all(&b"{\"a\":1}"[..], 0).unwrap();
        let body = decode_body(&compressed, &props(Some("zstd"))).unwrap();
        assert_eq!(body.as_ref(), b"{\"a\":1}");
    }

    #[cfg(feature = "compression")]
    #[test]
    fn corrupt_zstd_body_is_an_encoding_error() {
        let err = decode_body(b"definitely not zstd", &props(Some("zstd"))).unwrap_err();
        assert!(matches!(err.kind(), DecodeErrorKind::Encoding(_)));
    }

    #[test]
    fn closures_decode_through_decode_fn() {
        let len = decode_fn(|body: &[u8], _: &Properties| Ok::<_, DecodeError>(body.len()));
        assert_eq!(len.decode(b"four", &Properties::default()).unwrap(), 4);
    }

    #[test]
    fn display_names_the_failure() {
        let err = DecodeError::unsupported_encoding("br");
        assert!(err.to_string().starts_with("Unsupported content encoding: br"));
    }
}
