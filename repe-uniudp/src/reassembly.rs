//! Concurrent multi-message reassembly with redundancy tracking and
//! single-loss XOR FEC recovery.
//!
//! Two shared structures, each behind its own lock and never held during
//! socket I/O: the pending-message arena and the completed/dedup map.
//! Inconsistent packets are logged and dropped; they never corrupt state.

use crate::error::UniUdpError;
use crate::packet::PacketHeader;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

/// Cap on concurrently reassembling messages.
pub const MAX_PENDING_MESSAGES: usize = 100;

/// Age after which an incomplete message is evicted.
pub const PENDING_EVICTION: Duration = Duration::from_secs(30);

/// Window during which a delivered message id deduplicates late packets.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(10);

/// Why a receive returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// Every chunk slot filled, possibly via FEC.
    Completed,
    /// The per-packet wait elapsed while a filtered message was partial.
    InactivityTimeout,
    /// The overall deadline elapsed while a filtered message was partial.
    OverallTimeout,
}

/// The structured outcome of a UniUDP receive.
#[derive(Debug, Clone)]
pub struct MessageReport {
    pub message_id: u64,
    /// Received chunks concatenated in index order.
    pub payload: Vec<u8>,
    pub chunks_expected: u32,
    pub chunks_received: u32,
    /// Sorted indices of chunks never filled; empty for completed
    /// messages.
    pub lost_chunks: Vec<u32>,
    /// Highest attempt number any chunk needed, or `redundancy + 1` when
    /// chunks were lost or only recovered via FEC.
    pub redundancy_required: u16,
    pub fec_group_size: u16,
    /// Chunk indices reconstructed from parity.
    pub fec_recovered_chunks: Vec<u32>,
    pub source: SocketAddr,
    pub completion_reason: CompletionReason,
}

/// Per-message reassembly state.
struct MessageState {
    total_chunks: u32,
    chunk_size: u16,
    message_length: u32,
    redundancy: u16,
    fec_group_size: u16,
    chunks: Vec<Option<Vec<u8>>>,
    /// Expected payload length per chunk position.
    chunk_lens: Vec<u16>,
    /// Lowest observed attempt per chunk; `redundancy + 1` means not yet
    /// received directly.
    min_attempt: Vec<u16>,
    parity: Vec<Option<Vec<u8>>>,
    parity_min_attempt: Vec<u16>,
    fec_recovered: Vec<u32>,
    source: SocketAddr,
    created_at: Instant,
}

impl MessageState {
    fn new(header: &PacketHeader, source: SocketAddr) -> Self {
        let total = header.total_chunks as usize;
        let groups = if header.fec_group_size > 1 {
            (total + header.fec_group_size as usize - 1) / header.fec_group_size as usize
        } else {
            0
        };
        let sentinel = header.redundancy + 1;

        let chunk_lens = (0..header.total_chunks)
            .map(|index| expected_chunk_len(header, index))
            .collect();

        Self {
            total_chunks: header.total_chunks,
            chunk_size: header.chunk_size,
            message_length: header.message_length,
            redundancy: header.redundancy,
            fec_group_size: header.fec_group_size,
            chunks: vec![None; total],
            chunk_lens,
            min_attempt: vec![sentinel; total],
            parity: vec![None; groups],
            parity_min_attempt: vec![sentinel; groups],
            fec_recovered: Vec::new(),
            source,
            created_at: Instant::now(),
        }
    }

    /// Every field of a later packet must match the stored state.
    fn matches(&self, header: &PacketHeader) -> bool {
        self.total_chunks == header.total_chunks
            && self.chunk_size == header.chunk_size
            && self.message_length == header.message_length
            && self.redundancy == header.redundancy
            && self.fec_group_size == header.fec_group_size
    }

    fn is_complete(&self) -> bool {
        self.chunks.iter().all(Option::is_some)
    }

    /// Attempts single-loss recovery for one FEC group: if exactly one
    /// chunk is missing and parity is present, the missing chunk is the
    /// XOR of parity with every present chunk (each over its own length;
    /// the sender zero-padded the short final chunk into the parity).
    fn try_fec_recover(&mut self, group: usize) {
        if self.fec_group_size <= 1 {
            return;
        }
        let Some(parity_buf) = self.parity.get(group).cloned().flatten() else {
            return;
        };

        let group_size = self.fec_group_size as u32;
        let start = group as u32 * group_size;
        let end = (start + group_size).min(self.total_chunks);

        let mut missing = None;
        for index in start..end {
            if self.chunks[index as usize].is_none() {
                if missing.is_some() {
                    return;
                }
                missing = Some(index);
            }
        }
        let Some(missing) = missing else { return };

        let mut recovered = parity_buf;
        for index in start..end {
            if index == missing {
                continue;
            }
            let chunk = self.chunks[index as usize]
                .as_ref()
                .expect("present chunk in group");
            for (acc, byte) in recovered.iter_mut().zip(chunk.iter()) {
                *acc ^= byte;
            }
        }
        recovered.truncate(self.chunk_lens[missing as usize] as usize);

        tracing::debug!(
            chunk_index = missing,
            group,
            "recovered chunk via FEC parity"
        );
        self.chunks[missing as usize] = Some(recovered);
        self.fec_recovered.push(missing);
        // min_attempt keeps the not-received sentinel: the chunk was
        // never delivered directly.
    }

    fn into_report(self, completion_reason: CompletionReason) -> MessageReport {
        let mut lost_chunks = Vec::new();
        let mut chunks_received = 0u32;
        for (index, chunk) in self.chunks.iter().enumerate() {
            if chunk.is_some() {
                chunks_received += 1;
            } else {
                lost_chunks.push(index as u32);
            }
        }
        let redundancy_required = if lost_chunks.is_empty() {
            self.min_attempt.iter().copied().max().unwrap_or(1)
        } else {
            self.redundancy + 1
        };

        let mut payload = Vec::with_capacity(self.message_length as usize);
        for chunk in self.chunks.iter().flatten() {
            payload.extend_from_slice(chunk);
        }

        MessageReport {
            message_id: 0, // filled by the caller, which owns the key
            payload,
            chunks_expected: self.total_chunks,
            chunks_received,
            lost_chunks,
            redundancy_required,
            fec_group_size: self.fec_group_size,
            fec_recovered_chunks: self.fec_recovered,
            source: self.source,
            completion_reason,
        }
    }
}

fn expected_chunk_len(header: &PacketHeader, index: u32) -> u16 {
    if index + 1 == header.total_chunks {
        let full = (header.total_chunks as u64 - 1) * header.chunk_size as u64;
        let tail = (header.message_length as u64).saturating_sub(full);
        tail.min(header.chunk_size as u64) as u16
    } else {
        header.chunk_size
    }
}

struct CompletedEntry {
    completed_at: Instant,
    /// Present until the report is handed to a caller; the id then stays
    /// for the dedup window.
    report: Option<MessageReport>,
}

/// Per-message receive parameters.
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    /// Restrict delivery to one message id; partial delivery on timeout
    /// is only available when filtering.
    pub message_id: Option<u64>,
    /// Bound on each packet wait.
    pub inactivity_timeout: Duration,
    /// Bound on the whole receive call.
    pub overall_timeout: Duration,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            message_id: None,
            inactivity_timeout: Duration::from_secs(2),
            overall_timeout: Duration::from_secs(30),
        }
    }
}

impl ReceiveOptions {
    pub fn for_message(message_id: u64) -> Self {
        Self {
            message_id: Some(message_id),
            ..Default::default()
        }
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = timeout;
        self
    }
}

/// The reassembly engine: an arena of per-message states plus a
/// completed/dedup map.
#[derive(Default)]
pub struct Reassembler {
    pending: Mutex<HashMap<u64, MessageState>>,
    completed: Mutex<HashMap<u64, CompletedEntry>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all pending and completed state. Test support.
    pub fn clear(&self) {
        let mut pending = self.pending.lock().unwrap();
        let mut completed = self.completed.lock().unwrap();
        pending.clear();
        completed.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Ages out stale pending messages and expired dedup entries.
    fn evict(&self) {
        let now = Instant::now();
        {
            let mut pending = self.pending.lock().unwrap();
            pending.retain(|id, state| {
                let keep = now.duration_since(state.created_at) <= PENDING_EVICTION;
                if !keep {
                    tracing::warn!(message_id = *id, "evicting stale partial message");
                }
                keep
            });
        }
        {
            let mut completed = self.completed.lock().unwrap();
            completed.retain(|_, entry| now.duration_since(entry.completed_at) <= DEDUP_WINDOW);
        }
    }

    /// Feeds one packet into the engine. Invalid or inconsistent packets
    /// are dropped with a warning.
    pub fn ingest(&self, header: &PacketHeader, payload: &[u8], source: SocketAddr) {
        self.evict();

        if self.completed.lock().unwrap().contains_key(&header.message_id) {
            tracing::debug!(message_id = header.message_id, "duplicate message, dropping");
            return;
        }

        let mut pending = self.pending.lock().unwrap();

        if !pending.contains_key(&header.message_id) && pending.len() >= MAX_PENDING_MESSAGES {
            if let Some(oldest) = pending
                .iter()
                .min_by_key(|(_, state)| state.created_at)
                .map(|(id, _)| *id)
            {
                tracing::warn!(message_id = oldest, "pending cap reached, evicting oldest");
                pending.remove(&oldest);
            }
        }

        let state = pending
            .entry(header.message_id)
            .or_insert_with(|| MessageState::new(header, source));

        if !state.matches(header) {
            tracing::warn!(
                message_id = header.message_id,
                "packet fields disagree with reassembly state, dropping"
            );
            return;
        }
        if header.attempt == 0 || header.attempt > state.redundancy {
            tracing::warn!(
                message_id = header.message_id,
                attempt = header.attempt,
                "attempt outside [1, redundancy], dropping"
            );
            return;
        }

        if header.parity {
            let group_size = state.fec_group_size as u32;
            if group_size <= 1 {
                tracing::warn!(message_id = header.message_id, "parity with FEC disabled");
                return;
            }
            if header.chunk_index >= state.total_chunks
                || header.chunk_index % group_size != 0
            {
                tracing::warn!(
                    message_id = header.message_id,
                    chunk_index = header.chunk_index,
                    "parity index not group-aligned, dropping"
                );
                return;
            }
            if payload.len() != state.chunk_size as usize {
                tracing::warn!(
                    message_id = header.message_id,
                    "parity payload must span chunk_size, dropping"
                );
                return;
            }
            let group = (header.chunk_index / group_size) as usize;
            if header.attempt < state.parity_min_attempt[group] {
                state.parity[group] = Some(payload.to_vec());
                state.parity_min_attempt[group] = header.attempt;
            }
            state.try_fec_recover(group);
        } else {
            if header.chunk_index >= state.total_chunks {
                tracing::warn!(
                    message_id = header.message_id,
                    chunk_index = header.chunk_index,
                    "chunk index out of range, dropping"
                );
                return;
            }
            let index = header.chunk_index as usize;
            let expected = state.chunk_lens[index];
            if header.payload_len != expected || payload.len() != expected as usize {
                tracing::warn!(
                    message_id = header.message_id,
                    chunk_index = header.chunk_index,
                    payload_len = header.payload_len,
                    expected,
                    "unexpected chunk length, dropping"
                );
                return;
            }
            // First observation wins for content; any observation can
            // lower min_attempt.
            if state.chunks[index].is_none() {
                state.chunks[index] = Some(payload.to_vec());
            }
            state.min_attempt[index] = state.min_attempt[index].min(header.attempt);
            if state.fec_group_size > 1 {
                let group = (header.chunk_index / state.fec_group_size as u32) as usize;
                state.try_fec_recover(group);
            }
        }

        if state.is_complete() {
            let state = pending
                .remove(&header.message_id)
                .expect("state present at completion");
            drop(pending);

            let mut report = state.into_report(CompletionReason::Completed);
            report.message_id = header.message_id;
            tracing::debug!(
                message_id = header.message_id,
                chunks = report.chunks_expected,
                fec_recovered = report.fec_recovered_chunks.len(),
                "message complete"
            );
            self.completed.lock().unwrap().insert(
                header.message_id,
                CompletedEntry {
                    completed_at: Instant::now(),
                    report: Some(report),
                },
            );
        }
    }

    /// Takes a buffered completed report, optionally for one message id.
    /// The id stays in the dedup map after the take.
    pub fn take_completed(&self, filter: Option<u64>) -> Option<MessageReport> {
        let mut completed = self.completed.lock().unwrap();
        match filter {
            Some(id) => completed.get_mut(&id).and_then(|entry| entry.report.take()),
            None => completed
                .values_mut()
                .find_map(|entry| entry.report.take()),
        }
    }

    fn has_pending(&self, message_id: u64) -> bool {
        self.pending.lock().unwrap().contains_key(&message_id)
    }

    /// Removes a partial message and reports it with the given reason,
    /// inserting its id into the dedup map.
    fn take_partial(&self, message_id: u64, reason: CompletionReason) -> Option<MessageReport> {
        let state = self.pending.lock().unwrap().remove(&message_id)?;
        let mut report = state.into_report(reason);
        report.message_id = message_id;
        self.completed.lock().unwrap().insert(
            message_id,
            CompletedEntry {
                completed_at: Instant::now(),
                report: None,
            },
        );
        Some(report)
    }

    /// Receives packets from `socket` until a message can be delivered.
    ///
    /// Buffered completed messages are delivered first. Each packet wait
    /// is bounded by `min(inactivity_timeout, remaining_overall)`. When a
    /// wait elapses with a filtered partial message present, that partial
    /// is delivered with an inactivity reason; when the overall deadline
    /// passes, a filtered partial is delivered with an overall-timeout
    /// reason, and an unfiltered call fails with a timeout error.
    pub async fn receive_message(
        &self,
        socket: &UdpSocket,
        options: &ReceiveOptions,
    ) -> Result<MessageReport, UniUdpError> {
        let start = Instant::now();
        let mut buf = vec![0u8; 65536];

        loop {
            if let Some(report) = self.take_completed(options.message_id) {
                return Ok(report);
            }

            let remaining = options
                .overall_timeout
                .saturating_sub(start.elapsed());
            if remaining.is_zero() {
                if let Some(id) = options.message_id {
                    if let Some(report) =
                        self.take_partial(id, CompletionReason::OverallTimeout)
                    {
                        return Ok(report);
                    }
                }
                return Err(UniUdpError::Timeout);
            }

            let wait = remaining.min(options.inactivity_timeout);
            match tokio::time::timeout(wait, socket.recv_from(&mut buf)).await {
                Err(_) => {
                    if let Some(id) = options.message_id {
                        if self.has_pending(id) {
                            if let Some(report) =
                                self.take_partial(id, CompletionReason::InactivityTimeout)
                            {
                                return Ok(report);
                            }
                        }
                    }
                }
                Ok(Ok((len, source))) => match PacketHeader::parse(&buf[..len]) {
                    Ok((header, payload)) => self.ingest(&header, &payload, source),
                    Err(e) => {
                        tracing::warn!(%source, error = %e, "dropping malformed packet");
                    }
                },
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}
