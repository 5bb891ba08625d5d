//! # repe-protocol
//!
//! Wire protocol implementation for the REPE RPC stack.
//!
//! This crate provides:
//! - The fixed 48-byte little-endian REPE header
//! - Message framing (header + query + body sections)
//! - Format-tagged body encoding/decoding behind the [`ValueCodec`] seam
//! - Wire error codes and protocol error types

pub mod body;
pub mod error;
pub mod header;
pub mod message;

pub use body::{BodyCodecs, DecodedBody, JsonCodec, ValueCodec};
pub use error::{ErrorCode, ProtocolError, APPLICATION_ERROR_BASE};
pub use header::{BodyFormat, Header, QueryFormat, HEADER_SIZE, SPEC_MAGIC, VERSION};
pub use message::Message;

/// Default port for REPE servers.
pub const DEFAULT_PORT: u16 = 8081;
