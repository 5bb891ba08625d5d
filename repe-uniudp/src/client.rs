//! Fire-and-forget UniUDP client.

use crate::error::UniUdpError;
use crate::sender::{send_message, SendOptions};
use repe_protocol::{BodyCodecs, BodyFormat, Message};
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};

/// UniUDP client configuration.
#[derive(Debug, Clone)]
pub struct UniUdpClientConfig {
    pub host: String,
    pub port: u16,
    pub redundancy: u16,
    pub chunk_size: u16,
    pub fec_group_size: u16,
    pub delay: Duration,
}

impl UniUdpClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            redundancy: 1,
            chunk_size: 1024,
            fec_group_size: 1,
            delay: Duration::ZERO,
        }
    }

    pub fn with_redundancy(mut self, redundancy: u16) -> Self {
        self.redundancy = redundancy;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u16) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_fec_group_size(mut self, fec_group_size: u16) -> Self {
        self.fec_group_size = fec_group_size;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Sends REPE messages over UniUDP. One-way: methods return the REPE
/// message id, and "success" means the send syscalls returned, not that
/// anything was delivered.
pub struct UniUdpClient {
    socket: UdpSocket,
    dest: SocketAddr,
    config: UniUdpClientConfig,
    codecs: BodyCodecs,
    /// REPE request id source, starts at 1.
    next_id: AtomicU64,
}

impl UniUdpClient {
    /// Resolves the destination and binds a local socket of the matching
    /// address family.
    pub async fn connect(config: UniUdpClientConfig) -> Result<Self, UniUdpError> {
        let dest = lookup_host((config.host.as_str(), config.port))
            .await
            .map_err(|_| UniUdpError::Resolve(config.host.clone()))?
            .next()
            .ok_or_else(|| UniUdpError::Resolve(config.host.clone()))?;

        let bind_addr: SocketAddr = match dest.ip() {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr).await?;

        Ok(Self {
            socket,
            dest,
            config,
            codecs: BodyCodecs::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    /// Sends a request message; returns its REPE id.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<u64, UniUdpError> {
        self.send(method, params, false).await
    }

    /// Sends a notification message; returns its REPE id.
    pub async fn send_notify(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<u64, UniUdpError> {
        self.send(method, params, true).await
    }

    async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        notify: bool,
    ) -> Result<u64, UniUdpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut msg = if notify {
            Message::notify(id, method.to_owned())
        } else {
            Message::request(id, method.to_owned())
        };
        if let Some(params) = params {
            msg = msg.with_value(&params, BodyFormat::Json, &self.codecs)?;
        }

        let data = msg.encode();
        let options = SendOptions::default()
            .with_redundancy(self.config.redundancy)
            .with_chunk_size(self.config.chunk_size)
            .with_fec_group_size(self.config.fec_group_size)
            .with_delay(self.config.delay);
        send_message(&self.socket, self.dest, &data, &options).await?;
        Ok(id)
    }
}
