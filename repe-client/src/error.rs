//! Client error types.

use repe_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    /// Error response from the peer, carrying its wire code and the
    /// UTF-8 body text.
    #[error("RPC Error ({}): {message}", .code.as_u32())]
    Rpc { code: ErrorCode, message: String },
}

impl ClientError {
    /// Wire code of a peer-reported error, if this is one.
    pub fn rpc_code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_display() {
        let err = ClientError::Rpc {
            code: ErrorCode::MethodNotFound,
            message: "Method not found".into(),
        };
        assert_eq!(err.to_string(), "RPC Error (6): Method not found");
        assert_eq!(err.rpc_code(), Some(ErrorCode::MethodNotFound));
    }
}
