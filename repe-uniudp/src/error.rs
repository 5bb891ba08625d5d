//! UniUDP error types.

use repe_protocol::ProtocolError;
use thiserror::Error;

/// UniUDP errors.
#[derive(Debug, Error)]
pub enum UniUdpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("message needs {chunks} chunks, above the u32 chunk-count limit")]
    TooManyChunks { chunks: u64 },

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("receive timeout")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("handler failed: {0}")]
    Handler(String),
}
