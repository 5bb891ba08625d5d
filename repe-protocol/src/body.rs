//! Format-tagged body conversion.
//!
//! JSON and BEVE are external collaborators consumed through the
//! [`ValueCodec`] seam; UTF-8 and raw-binary bodies are handled inline.
//! Formats at or above the custom base pass through as opaque bytes.

use crate::error::ProtocolError;
use crate::header::BodyFormat;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Encoder/decoder for a self-describing value format.
pub trait ValueCodec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, ProtocolError>;
    fn decode(&self, bytes: &[u8]) -> Result<Value, ProtocolError>;
}

/// JSON codec backed by serde_json.
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A body decoded according to its declared format.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedBody {
    /// JSON or BEVE value.
    Value(Value),
    /// UTF-8 text.
    Text(String),
    /// Raw-binary or custom-format bytes, passed through opaque.
    Raw(Bytes),
}

impl DecodedBody {
    /// Converts into a JSON value; raw bodies do not convert.
    pub fn into_value(self) -> Result<Value, ProtocolError> {
        match self {
            DecodedBody::Value(value) => Ok(value),
            DecodedBody::Text(text) => Ok(Value::String(text)),
            DecodedBody::Raw(_) => Err(ProtocolError::InvalidBody(
                "raw body has no value representation".into(),
            )),
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            DecodedBody::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// Configured codec set for the enumerated body formats.
///
/// JSON is wired by default; a BEVE codec is injected by the embedder.
#[derive(Clone)]
pub struct BodyCodecs {
    json: Arc<dyn ValueCodec>,
    beve: Option<Arc<dyn ValueCodec>>,
}

impl Default for BodyCodecs {
    fn default() -> Self {
        Self {
            json: Arc::new(JsonCodec),
            beve: None,
        }
    }
}

impl BodyCodecs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_json(mut self, codec: Arc<dyn ValueCodec>) -> Self {
        self.json = codec;
        self
    }

    pub fn with_beve(mut self, codec: Arc<dyn ValueCodec>) -> Self {
        self.beve = Some(codec);
        self
    }

    fn beve(&self) -> Result<&Arc<dyn ValueCodec>, ProtocolError> {
        self.beve
            .as_ref()
            .ok_or_else(|| ProtocolError::InvalidBody("BEVE codec not configured".into()))
    }

    /// Encodes a value under the given format.
    ///
    /// Raw-binary bodies must be supplied as bytes directly (see
    /// [`crate::Message::with_body`]); encoding an arbitrary value under
    /// raw or custom formats fails.
    pub fn encode(&self, value: &Value, format: BodyFormat) -> Result<Bytes, ProtocolError> {
        match format {
            BodyFormat::Json => Ok(Bytes::from(self.json.encode(value)?)),
            BodyFormat::Beve => Ok(Bytes::from(self.beve()?.encode(value)?)),
            BodyFormat::Utf8 => match value {
                Value::String(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
                _ => Err(ProtocolError::InvalidBody(
                    "UTF-8 body requires a string value".into(),
                )),
            },
            BodyFormat::RawBinary => Err(ProtocolError::InvalidBody(
                "raw body must be supplied as a byte sequence".into(),
            )),
            BodyFormat::Custom(code) => Err(ProtocolError::InvalidBody(format!(
                "cannot encode a value under custom format {code}"
            ))),
        }
    }

    /// Decodes body bytes according to the declared format.
    ///
    /// Empty JSON/BEVE bodies decode to null.
    pub fn decode(&self, bytes: &[u8], format: BodyFormat) -> Result<DecodedBody, ProtocolError> {
        match format {
            BodyFormat::Json => {
                if bytes.is_empty() {
                    return Ok(DecodedBody::Value(Value::Null));
                }
                Ok(DecodedBody::Value(self.json.decode(bytes)?))
            }
            BodyFormat::Beve => {
                if bytes.is_empty() {
                    return Ok(DecodedBody::Value(Value::Null));
                }
                Ok(DecodedBody::Value(self.beve()?.decode(bytes)?))
            }
            BodyFormat::Utf8 => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| ProtocolError::InvalidBody("body is not valid UTF-8".into()))?;
                Ok(DecodedBody::Text(text.to_owned()))
            }
            BodyFormat::RawBinary | BodyFormat::Custom(_) => {
                Ok(DecodedBody::Raw(Bytes::copy_from_slice(bytes)))
            }
        }
    }

    /// Decodes body bytes into a named shape. JSON and BEVE only.
    pub fn decode_as<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        format: BodyFormat,
    ) -> Result<T, ProtocolError> {
        match format {
            BodyFormat::Json | BodyFormat::Beve => {
                let value = match self.decode(bytes, format)? {
                    DecodedBody::Value(value) => value,
                    _ => unreachable!("JSON/BEVE decode to values"),
                };
                Ok(serde_json::from_value(value)?)
            }
            other => Err(ProtocolError::InvalidBody(format!(
                "typed decode unsupported for format {}",
                other.as_u16()
            ))),
        }
    }
}
