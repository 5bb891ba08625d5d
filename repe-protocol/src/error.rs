//! Protocol error types and wire error codes.

use std::fmt;
use thiserror::Error;

/// First error code available for application-defined errors.
pub const APPLICATION_ERROR_BASE: u32 = 4096;

/// Stable error codes carried in the `ec` header field.
///
/// These codes are part of the wire contract and must remain stable
/// across versions. Codes at or above [`APPLICATION_ERROR_BASE`] are
/// user-defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok,
    VersionMismatch,
    InvalidHeader,
    InvalidQuery,
    InvalidBody,
    ParseError,
    MethodNotFound,
    Timeout,
    /// Application-defined code (`APPLICATION_ERROR_BASE` and above).
    Application(u32),
}

impl ErrorCode {
    /// Decodes a wire value. Unassigned values are passed through as
    /// application codes rather than rejected.
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => ErrorCode::Ok,
            1 => ErrorCode::VersionMismatch,
            2 => ErrorCode::InvalidHeader,
            3 => ErrorCode::InvalidQuery,
            4 => ErrorCode::InvalidBody,
            5 => ErrorCode::ParseError,
            6 => ErrorCode::MethodNotFound,
            7 => ErrorCode::Timeout,
            other => ErrorCode::Application(other),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::VersionMismatch => 1,
            ErrorCode::InvalidHeader => 2,
            ErrorCode::InvalidQuery => 3,
            ErrorCode::InvalidBody => 4,
            ErrorCode::ParseError => 5,
            ErrorCode::MethodNotFound => 6,
            ErrorCode::Timeout => 7,
            ErrorCode::Application(code) => *code,
        }
    }

    /// Canonical human-readable message for this code.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "OK",
            ErrorCode::VersionMismatch => "Version mismatch",
            ErrorCode::InvalidHeader => "Invalid header",
            ErrorCode::InvalidQuery => "Invalid query",
            ErrorCode::InvalidBody => "Invalid body",
            ErrorCode::ParseError => "Parse error",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::Application(_) => "Application error",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ErrorCode::Ok)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Protocol-level errors raised during framing or body conversion.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid body: {0}")]
    InvalidBody(String),

    #[error("length mismatch: header declares {declared} bytes, message carries {actual}")]
    LengthMismatch { declared: u64, actual: u64 },

    #[error("truncated message: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Maps this error onto the wire error code it should surface as.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::InvalidHeader(_)
            | ProtocolError::LengthMismatch { .. }
            | ProtocolError::Truncated { .. } => ErrorCode::InvalidHeader,
            ProtocolError::InvalidQuery(_) => ErrorCode::InvalidQuery,
            ProtocolError::InvalidBody(_) => ErrorCode::InvalidBody,
            ProtocolError::Json(_) => ErrorCode::ParseError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        for value in [0u32, 1, 2, 3, 4, 5, 6, 7, 4096, 5000] {
            assert_eq!(ErrorCode::from_u32(value).as_u32(), value);
        }
    }

    #[test]
    fn test_canonical_messages() {
        assert_eq!(ErrorCode::Ok.message(), "OK");
        assert_eq!(ErrorCode::VersionMismatch.message(), "Version mismatch");
        assert_eq!(ErrorCode::InvalidHeader.message(), "Invalid header");
        assert_eq!(ErrorCode::InvalidQuery.message(), "Invalid query");
        assert_eq!(ErrorCode::InvalidBody.message(), "Invalid body");
        assert_eq!(ErrorCode::ParseError.message(), "Parse error");
        assert_eq!(ErrorCode::MethodNotFound.message(), "Method not found");
        assert_eq!(ErrorCode::Timeout.message(), "Timeout");
    }

    #[test]
    fn test_application_codes() {
        let code = ErrorCode::from_u32(APPLICATION_ERROR_BASE + 7);
        assert_eq!(code, ErrorCode::Application(4103));
        assert!(!code.is_ok());
    }

    #[test]
    fn test_protocol_error_code_mapping() {
        assert_eq!(
            ProtocolError::InvalidHeader("x".into()).code(),
            ErrorCode::InvalidHeader
        );
        assert_eq!(
            ProtocolError::Truncated { needed: 48, have: 47 }.code(),
            ErrorCode::InvalidHeader
        );
        assert_eq!(
            ProtocolError::InvalidQuery("x".into()).code(),
            ErrorCode::InvalidQuery
        );
        assert_eq!(
            ProtocolError::InvalidBody("x".into()).code(),
            ErrorCode::InvalidBody
        );
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(ProtocolError::Json(json_err).code(), ErrorCode::ParseError);
    }
}
