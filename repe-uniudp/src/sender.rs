//! Chunking sender: replicate data chunks, accumulate and emit per-group
//! XOR parity.

use crate::error::UniUdpError;
use crate::packet::{PacketHeader, HEADER_LENGTH, MAX_FEC_GROUP_SIZE, SAFE_UDP_PAYLOAD};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::net::UdpSocket;

static MESSAGE_COUNTER: OnceLock<AtomicU64> = OnceLock::new();

/// Returns the next process-wide message id: an atomic counter seeded
/// with a random value, returning the pre-increment value.
pub fn next_message_id() -> u64 {
    MESSAGE_COUNTER
        .get_or_init(|| AtomicU64::new(rand::random::<u64>()))
        .fetch_add(1, Ordering::Relaxed)
}

/// Send parameters.
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Times each data/parity chunk is transmitted.
    pub redundancy: u16,
    /// Payload bytes per chunk.
    pub chunk_size: u16,
    /// Chunks covered by one parity packet; 1 disables FEC.
    pub fec_group_size: u16,
    /// Pause between consecutive packets.
    pub delay: Duration,
    /// Explicit message id; a fresh one is drawn when absent.
    pub message_id: Option<u64>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            redundancy: 1,
            chunk_size: 1024,
            fec_group_size: 1,
            delay: Duration::ZERO,
            message_id: None,
        }
    }
}

impl SendOptions {
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

    pub fn with_message_id(mut self, message_id: u64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    fn validate(&self) -> Result<(), UniUdpError> {
        if self.redundancy == 0 {
            return Err(UniUdpError::InvalidArgument(
                "redundancy must be at least 1".into(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(UniUdpError::InvalidArgument(
                "chunk_size must be at least 1".into(),
            ));
        }
        if self.fec_group_size == 0 || self.fec_group_size > MAX_FEC_GROUP_SIZE {
            return Err(UniUdpError::InvalidArgument(format!(
                "fec_group_size must be in [1, {MAX_FEC_GROUP_SIZE}]"
            )));
        }
        Ok(())
    }
}

/// Chunks `data` and emits it to `dest`: each data chunk `redundancy`
/// times with incrementing attempt numbers, then per-group parity when
/// FEC is enabled. Returns the message id used.
pub async fn send_message(
    socket: &UdpSocket,
    dest: SocketAddr,
    data: &[u8],
    options: &SendOptions,
) -> Result<u64, UniUdpError> {
    options.validate()?;

    if data.len() as u64 > u32::MAX as u64 {
        return Err(UniUdpError::InvalidArgument(
            "message length exceeds the u32 limit".into(),
        ));
    }
    let chunk_size = options.chunk_size as usize;
    let total_chunks_wide =
        ((data.len() as u64 + chunk_size as u64 - 1) / chunk_size as u64).max(1);
    if total_chunks_wide > u32::MAX as u64 {
        return Err(UniUdpError::TooManyChunks {
            chunks: total_chunks_wide,
        });
    }
    let total_chunks = total_chunks_wide as u32;

    if HEADER_LENGTH + chunk_size > SAFE_UDP_PAYLOAD {
        tracing::warn!(
            chunk_size,
            "packets exceed the safe UDP payload of {SAFE_UDP_PAYLOAD} bytes; \
             IP fragmentation is likely"
        );
    }

    let message_id = options.message_id.unwrap_or_else(next_message_id);
    let template = PacketHeader {
        message_id,
        chunk_index: 0,
        total_chunks,
        message_length: data.len() as u32,
        chunk_size: options.chunk_size,
        payload_len: 0,
        redundancy: options.redundancy,
        attempt: 1,
        fec_group_size: options.fec_group_size,
        parity: false,
    };

    let group_size = options.fec_group_size as u32;
    let fec = group_size > 1;
    let mut parity_buf = vec![0u8; chunk_size];

    for index in 0..total_chunks {
        let start = index as usize * chunk_size;
        let end = (start + chunk_size).min(data.len());
        let payload = &data[start..end];

        let mut header = template;
        header.chunk_index = index;
        header.payload_len = payload.len() as u16;
        for attempt in 1..=options.redundancy {
            header.attempt = attempt;
            socket.send_to(&header.pack(payload), dest).await?;
            pause(options.delay).await;
        }

        if fec {
            // Accumulate into the group parity; the short final chunk is
            // implicitly zero-padded.
            for (acc, byte) in parity_buf.iter_mut().zip(payload.iter()) {
                *acc ^= byte;
            }
            let group_offset = index % group_size;
            if group_offset == group_size - 1 || index + 1 == total_chunks {
                let mut parity_header = template;
                parity_header.chunk_index = index - group_offset;
                parity_header.payload_len = options.chunk_size;
                parity_header.parity = true;
                for attempt in 1..=options.redundancy {
                    parity_header.attempt = attempt;
                    socket.send_to(&parity_header.pack(&parity_buf), dest).await?;
                    pause(options.delay).await;
                }
                parity_buf.fill(0);
            }
        }
    }

    tracing::debug!(
        message_id,
        total_chunks,
        redundancy = options.redundancy,
        fec_group_size = options.fec_group_size,
        "message sent"
    );
    Ok(message_id)
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembly::{CompletionReason, Reassembler, ReceiveOptions};
    use std::collections::HashSet;

    #[test]
    fn test_message_ids_unique() {
        // The counter is process-wide and other tests draw from it
        // concurrently, so only uniqueness is asserted here.
        let ids: Vec<u64> = (0..64).map(|_| next_message_id()).collect();
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn test_option_validation() {
        assert!(SendOptions::default().validate().is_ok());
        assert!(SendOptions::default().with_redundancy(0).validate().is_err());
        assert!(SendOptions::default().with_chunk_size(0).validate().is_err());
        assert!(SendOptions::default()
            .with_fec_group_size(0)
            .validate()
            .is_err());
        assert!(SendOptions::default()
            .with_fec_group_size(MAX_FEC_GROUP_SIZE + 1)
            .validate()
            .is_err());
    }

    async fn socket_pair() -> (UdpSocket, UdpSocket, SocketAddr) {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = receiver.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (sender, receiver, dest)
    }

    #[tokio::test]
    async fn test_send_receive_roundtrip_with_redundancy_and_fec() {
        let (sender, receiver, dest) = socket_pair().await;
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

        let options = SendOptions::default()
            .with_chunk_size(1024)
            .with_redundancy(2)
            .with_fec_group_size(4);
        let message_id = send_message(&sender, dest, &data, &options).await.unwrap();

        let engine = Reassembler::new();
        let report = engine
            .receive_message(
                &receiver,
                &ReceiveOptions::for_message(message_id)
                    .with_inactivity_timeout(Duration::from_millis(200))
                    .with_overall_timeout(Duration::from_secs(5)),
            )
            .await
            .unwrap();

        assert_eq!(report.completion_reason, CompletionReason::Completed);
        assert_eq!(report.chunks_expected, 5);
        assert!(report.lost_chunks.is_empty());
        assert_eq!(report.payload.len(), 5000);
        assert_eq!(report.payload, data);
    }

    #[tokio::test]
    async fn test_send_empty_message() {
        let (sender, receiver, dest) = socket_pair().await;

        let options = SendOptions::default().with_chunk_size(64);
        let message_id = send_message(&sender, dest, b"", &options).await.unwrap();

        let engine = Reassembler::new();
        let report = engine
            .receive_message(
                &receiver,
                &ReceiveOptions::for_message(message_id)
                    .with_inactivity_timeout(Duration::from_millis(200))
                    .with_overall_timeout(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(report.chunks_expected, 1);
        assert!(report.payload.is_empty());
        assert_eq!(report.completion_reason, CompletionReason::Completed);
    }

    #[tokio::test]
    async fn test_explicit_message_id() {
        let (sender, _receiver, dest) = socket_pair().await;
        let options = SendOptions::default().with_message_id(424242);
        let id = send_message(&sender, dest, b"x", &options).await.unwrap();
        assert_eq!(id, 424242);
    }
}
