//! # repe-client
//!
//! Multiplexing TCP client for the REPE protocol.
//!
//! This crate provides:
//! - Connection lifecycle with address resolution and TCP_NODELAY
//! - Correlated request/response over a shared connection, matched by id
//! - A background reader task that dispatches responses to waiting callers
//! - Per-request timeouts, notifications, and batched async requests

pub mod client;
pub mod error;

pub use client::{Client, ClientConfig, RequestOptions};
pub use error::ClientError;
