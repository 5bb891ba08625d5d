//! UniUDP packet codec.
//!
//! Packet layout (30-byte header, all fields big-endian, followed by
//! `payload_len` payload bytes):
//!
//! ```text
//! +------------+-------------+--------------+----------------+
//! | message_id | chunk_index | total_chunks | message_length |
//! | 8          | 4           | 4            | 4              |
//! +------------+-------------+--------------+----------------+
//! | chunk_size | payload_len | redundancy | attempt | fec    |
//! | 2          | 2           | 2          | 2       | 2      |
//! +------------+-------------+------------+---------+--------+
//! ```
//!
//! The `fec` field packs `(group_size << 1) | parity_flag`; a group size
//! of 1 disables FEC. A zero field or zero group size is invalid.

use crate::error::UniUdpError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the packet header in bytes.
pub const HEADER_LENGTH: usize = 30;

/// Largest UDP payload that avoids IP fragmentation on common paths.
pub const SAFE_UDP_PAYLOAD: usize = 1452;

/// Largest representable FEC group size (15 bits next to the parity flag).
pub const MAX_FEC_GROUP_SIZE: u16 = 0x7FFF;

/// A parsed UniUDP packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub message_id: u64,
    /// Chunk position for data packets; group start for parity packets.
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub message_length: u32,
    pub chunk_size: u16,
    pub payload_len: u16,
    /// How many times each packet is transmitted.
    pub redundancy: u16,
    /// 1-based transmission attempt.
    pub attempt: u16,
    /// FEC group size; 1 disables FEC.
    pub fec_group_size: u16,
    pub parity: bool,
}

impl PacketHeader {
    /// The wire encoding of the FEC field.
    pub fn fec_field(&self) -> u16 {
        (self.fec_group_size << 1) | self.parity as u16
    }

    /// Serializes the header followed by the payload.
    pub fn pack(&self, payload: &[u8]) -> BytesMut {
        debug_assert_eq!(payload.len(), self.payload_len as usize);
        let mut buf = BytesMut::with_capacity(HEADER_LENGTH + payload.len());
        buf.put_u64(self.message_id);
        buf.put_u32(self.chunk_index);
        buf.put_u32(self.total_chunks);
        buf.put_u32(self.message_length);
        buf.put_u16(self.chunk_size);
        buf.put_u16(self.payload_len);
        buf.put_u16(self.redundancy);
        buf.put_u16(self.attempt);
        buf.put_u16(self.fec_field());
        buf.extend_from_slice(payload);
        buf
    }

    /// Parses a datagram into a header and its payload bytes.
    pub fn parse(buf: &[u8]) -> Result<(Self, Bytes), UniUdpError> {
        if buf.len() < HEADER_LENGTH {
            return Err(UniUdpError::InvalidPacket(format!(
                "short packet: {} bytes",
                buf.len()
            )));
        }

        let mut b = buf;
        let message_id = b.get_u64();
        let chunk_index = b.get_u32();
        let total_chunks = b.get_u32();
        let message_length = b.get_u32();
        let chunk_size = b.get_u16();
        let payload_len = b.get_u16();
        let redundancy = b.get_u16();
        let attempt = b.get_u16();
        let fec_field = b.get_u16();

        if fec_field == 0 {
            return Err(UniUdpError::InvalidPacket("zero FEC field".into()));
        }
        let parity = fec_field & 1 != 0;
        let fec_group_size = fec_field >> 1;
        if fec_group_size == 0 {
            return Err(UniUdpError::InvalidPacket("zero FEC group size".into()));
        }
        if payload_len > chunk_size {
            return Err(UniUdpError::InvalidPacket(format!(
                "payload_len {payload_len} exceeds chunk_size {chunk_size}"
            )));
        }
        let total = HEADER_LENGTH + payload_len as usize;
        if buf.len() < total {
            return Err(UniUdpError::InvalidPacket(format!(
                "truncated payload: need {total} bytes, have {}",
                buf.len()
            )));
        }

        let header = Self {
            message_id,
            chunk_index,
            total_chunks,
            message_length,
            chunk_size,
            payload_len,
            redundancy,
            attempt,
            fec_group_size,
            parity,
        };
        let payload = Bytes::copy_from_slice(&buf[HEADER_LENGTH..total]);
        Ok((header, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> PacketHeader {
        PacketHeader {
            message_id: 0xA1B2C3D4E5F60718,
            chunk_index: 3,
            total_chunks: 7,
            message_length: 6500,
            chunk_size: 1024,
            payload_len: 5,
            redundancy: 2,
            attempt: 1,
            fec_group_size: 4,
            parity: false,
        }
    }

    #[test]
    fn test_pack_parse_roundtrip() {
        let header = sample_header();
        let buf = header.pack(b"hello");
        assert_eq!(buf.len(), HEADER_LENGTH + 5);

        let (parsed, payload) = PacketHeader::parse(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(&payload[..], b"hello");
    }

    #[test]
    fn test_big_endian_layout() {
        let mut header = sample_header();
        header.payload_len = 0;
        let buf = header.pack(b"");

        // message_id at offset 0, big-endian.
        assert_eq!(
            &buf[..8],
            &[0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6, 0x07, 0x18]
        );
        // chunk_index at offset 8.
        assert_eq!(&buf[8..12], &[0, 0, 0, 3]);
        // chunk_size at offset 20.
        assert_eq!(&buf[20..22], &[0x04, 0x00]);
        // fec field at offset 28: group 4 << 1, data packet.
        assert_eq!(&buf[28..30], &[0, 8]);
    }

    #[test]
    fn test_parity_flag_in_fec_field() {
        let mut header = sample_header();
        header.parity = true;
        assert_eq!(header.fec_field(), (4 << 1) | 1);

        header.payload_len = 0;
        let buf = header.pack(b"");
        let (parsed, _) = PacketHeader::parse(&buf).unwrap();
        assert!(parsed.parity);
        assert_eq!(parsed.fec_group_size, 4);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let buf = [0u8; HEADER_LENGTH - 1];
        assert!(PacketHeader::parse(&buf).is_err());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let header = sample_header();
        let buf = header.pack(b"hello");
        assert!(PacketHeader::parse(&buf[..buf.len() - 1]).is_err());
    }

    #[test]
    fn test_payload_len_bound() {
        let mut header = sample_header();
        header.chunk_size = 4;
        header.payload_len = 5;
        let buf = header.pack(b"hello");
        assert!(PacketHeader::parse(&buf).is_err());
    }

    #[test]
    fn test_zero_fec_field_rejected() {
        let header = sample_header();
        let mut buf = header.pack(b"hello");
        buf[28] = 0;
        buf[29] = 0;
        assert!(PacketHeader::parse(&buf).is_err());

        // Parity flag alone still leaves a zero group size.
        buf[29] = 1;
        assert!(PacketHeader::parse(&buf).is_err());
    }
}
