//! REPE message framing: header + query section + body section.

use crate::body::{BodyCodecs, DecodedBody};
use crate::error::{ErrorCode, ProtocolError};
use crate::header::{BodyFormat, Header, QueryFormat, HEADER_SIZE};
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A complete REPE message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub query: Bytes,
    pub body: Bytes,
}

impl Message {
    /// Assembles a message from pre-built parts, refusing section-length
    /// mismatches against the header.
    pub fn from_parts(header: Header, query: Bytes, body: Bytes) -> Result<Self, ProtocolError> {
        if header.query_length != query.len() as u64 || header.body_length != body.len() as u64 {
            return Err(ProtocolError::LengthMismatch {
                declared: header.query_length + header.body_length,
                actual: (query.len() + body.len()) as u64,
            });
        }
        let expected = HEADER_SIZE as u64 + header.query_length + header.body_length;
        if header.length != expected {
            return Err(ProtocolError::LengthMismatch {
                declared: header.length,
                actual: expected,
            });
        }
        Ok(Self { header, query, body })
    }

    /// Creates a request with an empty body.
    pub fn request(id: u64, query: impl Into<Bytes>) -> Self {
        let query = query.into();
        let mut msg = Self {
            header: Header::new(id),
            query,
            body: Bytes::new(),
        };
        msg.refresh_lengths();
        msg
    }

    /// Creates a notification: a request for which no response is sent.
    pub fn notify(id: u64, query: impl Into<Bytes>) -> Self {
        let mut msg = Self::request(id, query);
        msg.header.notify = 1;
        msg
    }

    /// Creates an empty OK response correlated to `request`, echoing its
    /// id and query.
    pub fn response_to(request: &Message) -> Self {
        let mut msg = Self {
            header: Header {
                id: request.header.id,
                query_format: request.header.query_format,
                ..Default::default()
            },
            query: request.query.clone(),
            body: Bytes::new(),
        };
        msg.refresh_lengths();
        msg
    }

    /// Creates an error response carrying the message text as UTF-8 body.
    pub fn error_response_to(request: &Message, ec: ErrorCode, text: impl Into<String>) -> Self {
        let mut msg = Self::response_to(request);
        msg.header.ec = ec;
        msg.body = Bytes::from(text.into().into_bytes());
        msg.header.body_format = BodyFormat::Utf8;
        msg.refresh_lengths();
        msg
    }

    /// Replaces the body with already-encoded bytes.
    pub fn with_body(mut self, body: impl Into<Bytes>, format: BodyFormat) -> Self {
        self.body = body.into();
        self.header.body_format = format;
        self.refresh_lengths();
        self
    }

    /// Encodes `value` under `format` and installs it as the body.
    pub fn with_value(
        self,
        value: &Value,
        format: BodyFormat,
        codecs: &BodyCodecs,
    ) -> Result<Self, ProtocolError> {
        let body = codecs.encode(value, format)?;
        Ok(self.with_body(body, format))
    }

    /// Replaces the query section, refreshing the header lengths.
    pub fn with_query(mut self, query: impl Into<Bytes>) -> Self {
        self.query = query.into();
        self.refresh_lengths();
        self
    }

    pub fn with_query_format(mut self, format: QueryFormat) -> Self {
        self.header.query_format = format;
        self
    }

    pub fn with_error_code(mut self, ec: ErrorCode) -> Self {
        self.header.ec = ec;
        self
    }

    fn refresh_lengths(&mut self) {
        self.header.query_length = self.query.len() as u64;
        self.header.body_length = self.body.len() as u64;
        self.header.length =
            HEADER_SIZE as u64 + self.header.query_length + self.header.body_length;
    }

    /// Serializes header, query, and body into one buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.header.length as usize);
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.query);
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Deserializes a message from a single buffer.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let header = Header::decode(buf)?;
        let total = header.length as usize;
        if buf.len() < total {
            return Err(ProtocolError::Truncated {
                needed: total,
                have: buf.len(),
            });
        }
        let query_end = HEADER_SIZE + header.query_length as usize;
        let query = Bytes::copy_from_slice(&buf[HEADER_SIZE..query_end]);
        let body = Bytes::copy_from_slice(&buf[query_end..total]);
        Ok(Self { header, query, body })
    }

    /// Returns the query decoded as UTF-8 (the method for pointer queries).
    pub fn parse_query(&self) -> Result<&str, ProtocolError> {
        std::str::from_utf8(&self.query)
            .map_err(|_| ProtocolError::InvalidQuery("query is not valid UTF-8".into()))
    }

    /// Decodes the body per its declared format.
    pub fn parse_body(&self, codecs: &BodyCodecs) -> Result<DecodedBody, ProtocolError> {
        codecs.decode(&self.body, self.header.body_format)
    }

    /// Decodes the body into a named shape. JSON and BEVE only.
    pub fn parse_body_as<T: DeserializeOwned>(
        &self,
        codecs: &BodyCodecs,
    ) -> Result<T, ProtocolError> {
        codecs.decode_as(&self.body, self.header.body_format)
    }

    pub fn is_notify(&self) -> bool {
        self.header.is_notify()
    }

    pub fn is_error(&self) -> bool {
        !self.header.ec.is_ok()
    }
}
