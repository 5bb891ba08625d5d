//! REPE header codec.
//!
//! Header layout (fixed 48 bytes, all fields little-endian):
//!
//! ```text
//! +--------+------+---------+--------+----------+------+
//! | length | spec | version | notify | reserved | id   |
//! | 8      | 2    | 1       | 1      | 4        | 8    |
//! +--------+------+---------+--------+----------+------+
//! | query_length | body_length | query_fmt | body_fmt | ec |
//! | 8            | 8           | 2         | 2        | 4  |
//! +--------------+-------------+-----------+----------+----+
//! ```
//!
//! Invariant: `length == 48 + query_length + body_length`.

use crate::error::{ErrorCode, ProtocolError};
use bytes::{Buf, BufMut};

/// Magic value identifying REPE headers.
pub const SPEC_MAGIC: u16 = 0x1507;

/// Protocol version supported by this implementation.
pub const VERSION: u8 = 1;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 48;

/// First query format value available for custom formats.
pub const QUERY_CUSTOM_BASE: u16 = 4096;

/// First body format value available for custom formats.
pub const BODY_CUSTOM_BASE: u16 = 4096;

/// Interpretation of the query section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryFormat {
    RawBinary,
    JsonPointer,
    Custom(u16),
}

impl QueryFormat {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => QueryFormat::RawBinary,
            1 => QueryFormat::JsonPointer,
            other => QueryFormat::Custom(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            QueryFormat::RawBinary => 0,
            QueryFormat::JsonPointer => 1,
            QueryFormat::Custom(value) => *value,
        }
    }
}

/// Interpretation of the body section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyFormat {
    RawBinary,
    Beve,
    Json,
    Utf8,
    Custom(u16),
}

impl BodyFormat {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => BodyFormat::RawBinary,
            1 => BodyFormat::Beve,
            2 => BodyFormat::Json,
            3 => BodyFormat::Utf8,
            other => BodyFormat::Custom(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            BodyFormat::RawBinary => 0,
            BodyFormat::Beve => 1,
            BodyFormat::Json => 2,
            BodyFormat::Utf8 => 3,
            BodyFormat::Custom(value) => *value,
        }
    }
}

/// A parsed REPE header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Total message length: `48 + query_length + body_length`.
    pub length: u64,
    /// Magic, always [`SPEC_MAGIC`].
    pub spec: u16,
    /// Protocol version, always [`VERSION`].
    pub version: u8,
    /// Nonzero when the sender expects no response.
    pub notify: u8,
    /// Must be zero.
    pub reserved: u32,
    /// Request correlation id.
    pub id: u64,
    pub query_length: u64,
    pub body_length: u64,
    pub query_format: QueryFormat,
    pub body_format: BodyFormat,
    /// Error code; `Ok` on requests and successful responses.
    pub ec: ErrorCode,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            length: HEADER_SIZE as u64,
            spec: SPEC_MAGIC,
            version: VERSION,
            notify: 0,
            reserved: 0,
            id: 0,
            query_length: 0,
            body_length: 0,
            query_format: QueryFormat::JsonPointer,
            body_format: BodyFormat::Json,
            ec: ErrorCode::Ok,
        }
    }
}

impl Header {
    /// Creates a request header with the given id and empty sections.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Encodes the header in declared field order.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.length);
        buf.put_u16_le(self.spec);
        buf.put_u8(self.version);
        buf.put_u8(self.notify);
        buf.put_u32_le(self.reserved);
        buf.put_u64_le(self.id);
        buf.put_u64_le(self.query_length);
        buf.put_u64_le(self.body_length);
        buf.put_u16_le(self.query_format.as_u16());
        buf.put_u16_le(self.body_format.as_u16());
        buf.put_u32_le(self.ec.as_u32());
    }

    /// Decodes and validates a header from the start of `buf`.
    ///
    /// Fails with an invalid-header error when the buffer is short, the
    /// magic or version mismatch, or the length invariant does not hold.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidHeader(format!(
                "short header: {} bytes",
                buf.len()
            )));
        }

        let mut b = buf;
        let length = b.get_u64_le();
        let spec = b.get_u16_le();
        let version = b.get_u8();
        let notify = b.get_u8();
        let reserved = b.get_u32_le();
        let id = b.get_u64_le();
        let query_length = b.get_u64_le();
        let body_length = b.get_u64_le();
        let query_format = QueryFormat::from_u16(b.get_u16_le());
        let body_format = BodyFormat::from_u16(b.get_u16_le());
        let ec = ErrorCode::from_u32(b.get_u32_le());

        if spec != SPEC_MAGIC {
            return Err(ProtocolError::InvalidHeader(format!(
                "bad spec {spec:#06x}"
            )));
        }
        if version != VERSION {
            return Err(ProtocolError::InvalidHeader(format!(
                "unsupported version {version}"
            )));
        }
        let expected = HEADER_SIZE as u64 + query_length + body_length;
        if length != expected {
            return Err(ProtocolError::InvalidHeader(format!(
                "length {length} != {HEADER_SIZE} + {query_length} + {body_length}"
            )));
        }

        Ok(Self {
            length,
            spec,
            version,
            notify,
            reserved,
            id,
            query_length,
            body_length,
            query_format,
            body_format,
            ec,
        })
    }

    /// Full validity check, including the reserved bytes.
    pub fn validate(&self) -> bool {
        self.spec == SPEC_MAGIC
            && self.version == VERSION
            && self.reserved == 0
            && self.length == HEADER_SIZE as u64 + self.query_length + self.body_length
    }

    pub fn is_notify(&self) -> bool {
        self.notify != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn encode(header: &Header) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);
        buf
    }

    #[test]
    fn test_header_roundtrip() {
        let header = Header {
            length: HEADER_SIZE as u64 + 4 + 10,
            notify: 1,
            id: 777,
            query_length: 4,
            body_length: 10,
            query_format: QueryFormat::JsonPointer,
            body_format: BodyFormat::Beve,
            ec: ErrorCode::MethodNotFound,
            ..Default::default()
        };

        let buf = encode(&header);
        assert_eq!(buf.len(), HEADER_SIZE);
        let decoded = Header::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_field_offsets() {
        let header = Header {
            length: HEADER_SIZE as u64 + 3 + 5,
            id: 0x0102030405060708,
            query_length: 3,
            body_length: 5,
            ..Default::default()
        };
        let buf = encode(&header);

        // length at offset 0, little-endian
        assert_eq!(buf[0], 56);
        // spec at offset 8
        assert_eq!(&buf[8..10], &[0x07, 0x15]);
        // version / notify at 10 / 11
        assert_eq!(buf[10], 1);
        assert_eq!(buf[11], 0);
        // reserved at 12..16
        assert_eq!(&buf[12..16], &[0, 0, 0, 0]);
        // id at 16, little-endian
        assert_eq!(&buf[16..24], &[8, 7, 6, 5, 4, 3, 2, 1]);
        // query_format at 40, body_format at 42
        assert_eq!(&buf[40..42], &[1, 0]);
        assert_eq!(&buf[42..44], &[2, 0]);
    }

    #[test]
    fn test_short_header_rejected() {
        let header = Header::default();
        let buf = encode(&header);
        let err = Header::decode(&buf[..HEADER_SIZE - 1]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidHeader);
    }

    #[test]
    fn test_bad_spec_rejected() {
        let mut buf = encode(&Header::default());
        buf[8] = 0xFF;
        assert!(Header::decode(&buf).is_err());
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut buf = encode(&Header::default());
        buf[10] = 9;
        assert!(Header::decode(&buf).is_err());
    }

    #[test]
    fn test_length_invariant_rejected() {
        let mut header = Header::default();
        header.query_length = 10; // length still claims 48
        let buf = encode(&header);
        assert!(Header::decode(&buf).is_err());
    }

    #[test]
    fn test_validate_reserved() {
        let mut header = Header::default();
        assert!(header.validate());
        header.reserved = 1;
        assert!(!header.validate());
    }

    #[test]
    fn test_format_passthrough() {
        assert_eq!(QueryFormat::from_u16(4096), QueryFormat::Custom(4096));
        assert_eq!(QueryFormat::Custom(4097).as_u16(), 4097);
        assert_eq!(BodyFormat::from_u16(4200), BodyFormat::Custom(4200));
        assert_eq!(BodyFormat::Utf8.as_u16(), 3);
    }
}
