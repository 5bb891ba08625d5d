//! # repe-fleet
//!
//! A named collection of REPE clients with parallel, tag-filtered
//! broadcast semantics.
//!
//! This crate provides:
//! - Per-node clients with shared or per-node timeouts
//! - Parallel connect/disconnect/reconnect
//! - Broadcast with tag filtering and per-node retry
//! - Structured per-node results and health checks

pub mod error;
pub mod fleet;

pub use error::FleetError;
pub use fleet::{
    ConnectReport, Fleet, FleetOptions, NodeConfig, NodeHealth, RemoteResult, RetryPolicy,
};
