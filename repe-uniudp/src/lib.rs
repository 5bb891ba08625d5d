//! # repe-uniudp
//!
//! UniUDP: a one-way, reliable-ish datagram transport for REPE traffic.
//!
//! This crate provides:
//! - The 30-byte big-endian packet header codec
//! - A concurrent reassembly engine with per-chunk redundancy tracking,
//!   single-loss XOR forward error correction, and a deduplication window
//! - A chunking sender with per-chunk replication and per-group parity
//! - A fire-and-forget UniUDP server, client, and fan-out fleet

pub mod client;
pub mod error;
pub mod fleet;
pub mod packet;
pub mod reassembly;
pub mod sender;
pub mod server;

pub use client::{UniUdpClient, UniUdpClientConfig};
pub use error::UniUdpError;
pub use fleet::{SendResult, UniUdpFleet, UniUdpNodeConfig};
pub use packet::{PacketHeader, HEADER_LENGTH, MAX_FEC_GROUP_SIZE, SAFE_UDP_PAYLOAD};
pub use reassembly::{
    CompletionReason, MessageReport, Reassembler, ReceiveOptions, DEDUP_WINDOW,
    MAX_PENDING_MESSAGES, PENDING_EVICTION,
};
pub use sender::{next_message_id, send_message, SendOptions};
pub use server::{ResponseCallback, UdpHandler, UniUdpServer, UniUdpServerConfig};
