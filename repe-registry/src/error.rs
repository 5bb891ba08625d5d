//! Registry error types.

use repe_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid JSON pointer: {0:?}")]
    InvalidPointer(String),

    #[error("empty path not allowed here")]
    EmptyPath,

    #[error("path not found: {0}")]
    NotFound(String),

    #[error("segment {0:?} is not a valid index")]
    InvalidIndex(String),

    #[error("index {0} out of range")]
    IndexOutOfRange(usize),

    #[error("segment {0:?} does not address a container")]
    NotTraversable(String),

    #[error("root write requires a mapping body")]
    RootWriteRequiresMapping,

    #[error("call failed: {0}")]
    Call(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl RegistryError {
    /// Maps this error onto the wire error code it should surface as.
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::InvalidPointer(_)
            | RegistryError::EmptyPath
            | RegistryError::InvalidIndex(_)
            | RegistryError::IndexOutOfRange(_)
            | RegistryError::NotTraversable(_) => ErrorCode::InvalidQuery,
            RegistryError::NotFound(_) => ErrorCode::MethodNotFound,
            RegistryError::RootWriteRequiresMapping => ErrorCode::InvalidBody,
            RegistryError::Call(_) => ErrorCode::ParseError,
            RegistryError::Protocol(e) => e.code(),
        }
    }
}
