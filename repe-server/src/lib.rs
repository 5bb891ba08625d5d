//! # repe-server
//!
//! TCP server for the REPE protocol.
//!
//! This crate provides:
//! - An accept loop spawning one task per connection
//! - Exact-framing reads of the 48-byte header plus sections
//! - An ordered middleware chain with short-circuit responses
//! - Handler dispatch keyed by the decoded query string

pub mod error;
pub mod handler;
pub mod server;

pub use error::ServerError;
pub use handler::{Handler, HandlerError, HandlerReply, Middleware, MiddlewareAction};
pub use server::{Server, ServerConfig, ServerStats};
