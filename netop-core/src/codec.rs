//! Body codec capabilities.
//!
//! The engine treats codecs as opaque: a [`Decoder`] answers whether it
//! understands a media type and turns bytes into a value, an [`Encoder`]
//! turns a value into bytes plus the media type describing them.

use crate::error::BoxError;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;

/// `application/json`
pub const MEDIA_TYPE_JSON: &str = "application/json";
/// `text/plain`
pub const MEDIA_TYPE_TEXT: &str = "text/plain";

/// Decodes response bodies into `T`.
pub trait Decoder<T>: Send + Sync {
    /// Whether this decoder understands `media_type` (lower-cased, no parameters).
    fn can_decode(&self, media_type: &str) -> bool;

    /// Decodes `body`.
    fn decode(&self, body: &[u8], media_type: &str) -> Result<T, BoxError>;
}

/// Encodes request bodies from `T`.
pub trait Encoder<T>: Send + Sync {
    /// Returns the encoded body and its media type.
    fn encode(&self, value: &T) -> Result<(Bytes, String), BoxError>;
}

/// Whether `media_type` is JSON, including `+json` structured suffixes.
pub fn is_json_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_JSON
        || (media_type.starts_with("application/") && media_type.ends_with("+json"))
}

/// JSON decoder backed by `serde_json`.
pub struct JsonDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDecoder<T> {
    /// Creates a JSON decoder.
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

impl<T> fmt::Debug for JsonDecoder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonDecoder")
    }
}

impl<T: DeserializeOwned> Decoder<T> for JsonDecoder<T> {
    fn can_decode(&self, media_type: &str) -> bool {
        is_json_media_type(media_type)
    }

    fn decode(&self, body: &[u8], _media_type: &str) -> Result<T, BoxError> {
        serde_json::from_slice(body).map_err(Into::into)
    }
}

/// UTF-8 text decoder for `text/*` bodies.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextDecoder;

impl Decoder<String> for TextDecoder {
    fn can_decode(&self, media_type: &str) -> bool {
        media_type.starts_with("text/")
    }

    fn decode(&self, body: &[u8], _media_type: &str) -> Result<String, BoxError> {
        String::from_utf8(body.to_vec()).map_err(Into::into)
    }
}

/// JSON encoder backed by `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEncoder;

impl<T: Serialize> Encoder<T> for JsonEncoder {
    fn encode(&self, value: &T) -> Result<(Bytes, String), BoxError> {
        let body = serde_json::to_vec(value)?;
        Ok((Bytes::from(body), MEDIA_TYPE_JSON.to_string()))
    }
}
