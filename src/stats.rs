//! Runtime counters for one pipeline lifetime
//!
//! Workers bump these lock-free; observers read a `StatsSnapshot`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineStats {
    chunks_encoded: AtomicU64,
    frames_decoded: AtomicU64,
    frames_forwarded: AtomicU64,
    decode_faults: AtomicU64,
    empty_decodes: AtomicU64,
    underruns: AtomicU64,
    dropped_samples: AtomicU64,
}

/// Point-in-time copy of `PipelineStats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Encoded chunks handed to the outbound transport
    pub chunks_encoded: u64,
    /// Inbound packets that decoded successfully
    pub frames_decoded: u64,
    /// Decoded frames delivered to the playback worklet
    pub frames_forwarded: u64,
    /// Inbound packets dropped as malformed
    pub decode_faults: u64,
    /// Inbound packets that decoded to nothing
    pub empty_decodes: u64,
    /// Times the jitter buffer ran dry during playout
    pub underruns: u64,
    /// Samples discarded because the jitter buffer was full
    pub dropped_samples: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_chunk_encoded(&self) -> u64 {
        self.chunks_encoded.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_frame_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_forwarded(&self) {
        self.frames_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_fault(&self) {
        self.decode_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_empty_decode(&self) {
        self.empty_decodes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_samples(&self, count: usize) {
        self.dropped_samples
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            chunks_encoded: self.chunks_encoded.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            decode_faults: self.decode_faults.load(Ordering::Relaxed),
            empty_decodes: self.empty_decodes.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            dropped_samples: self.dropped_samples.load(Ordering::Relaxed),
        }
    }
}
