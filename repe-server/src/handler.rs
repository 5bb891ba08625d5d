//! Handler and middleware contracts.

use repe_protocol::{DecodedBody, ErrorCode, Message, ProtocolError};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// What a handler produced: either a naked value to be wrapped into a
/// response, or a fully framed response message used as-is.
#[derive(Debug, Clone)]
pub enum HandlerReply {
    Value(Value),
    Raw(Message),
}

impl From<Value> for HandlerReply {
    fn from(value: Value) -> Self {
        HandlerReply::Value(value)
    }
}

impl From<Message> for HandlerReply {
    fn from(msg: Message) -> Self {
        HandlerReply::Raw(msg)
    }
}

/// A handler failure, converted into an error response carrying the
/// message text as UTF-8 body.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub code: ErrorCode,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// A parse-level failure, the catch-all for handler errors.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    /// An application-defined failure with a code at or above the
    /// application base.
    pub fn application(code: u32, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Application(code), message)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<ProtocolError> for HandlerError {
    fn from(e: ProtocolError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::parse(e.to_string())
    }
}

/// A method handler: `(decoded_body, raw_message) -> reply`.
pub type Handler =
    Arc<dyn Fn(DecodedBody, &Message) -> Result<HandlerReply, HandlerError> + Send + Sync>;

/// What a middleware decided for a request.
pub enum MiddlewareAction {
    /// Proceed to the next middleware or to dispatch.
    Continue,
    /// Short-circuit with a fully formed response.
    Respond(Message),
    /// Short-circuit with an error response carrying this code.
    Reject(ErrorCode),
}

/// A pre-dispatch hook, run in registration order.
pub type Middleware = Arc<dyn Fn(&Message) -> MiddlewareAction + Send + Sync>;
