//! Output worklet: jitter buffer and sample-accurate playout
//!
//! Decoded frames arrive on the worklet's message port; the render thread
//! drains the port at the start of each quantum and plays queued audio.
//!
//! Buffering policy:
//! - Nothing plays until `initial_buffer` samples are queued.
//! - Running dry mid-quantum is an underrun: the rest of the quantum is
//!   silence and the worklet goes back to prebuffering.
//! - Queued audio beyond `max_buffer` samples is dropped oldest-first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::stats::PipelineStats;

/// Frames buffered in the port between decoder and render thread
const PORT_CAPACITY: usize = 512;

/// A processing unit attached to the playback graph.
pub trait AudioUnit: Send {
    /// Fill `output` with the next `output.len()` samples.
    fn process(&mut self, output: &mut [f32]);
}

/// Messages accepted on a worklet's port.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkletMessage {
    /// A decoded frame tagged with the capture clock at decode time.
    Audio { frame: Vec<f32>, mic_duration: f64 },
}

/// Sending half of a worklet's message port.
#[derive(Debug, Clone)]
pub struct WorkletPort {
    tx: mpsc::Sender<WorkletMessage>,
}

/// The port's peer was dropped or is not keeping up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostError {
    Full,
    Closed,
}

impl WorkletPort {
    /// Post without blocking.
    pub fn post(&self, message: WorkletMessage) -> Result<(), PostError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PostError::Full,
            mpsc::error::TrySendError::Closed(_) => PostError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a connected port pair.
pub fn port_channel() -> (WorkletPort, mpsc::Receiver<WorkletMessage>) {
    let (tx, rx) = mpsc::channel(PORT_CAPACITY);
    (WorkletPort { tx }, rx)
}

/// Observable playout state, shared with the pipeline handle.
#[derive(Debug, Default)]
pub struct PlayoutStatus {
    buffered_samples: AtomicUsize,
    /// f64 bits of the mic duration attached to the frame being played
    playing_mic_duration: AtomicU64,
}

impl PlayoutStatus {
    pub fn buffered_samples(&self) -> usize {
        self.buffered_samples.load(Ordering::Relaxed)
    }

    /// Capture clock of the audio currently being played, in seconds.
    pub fn playing_mic_duration(&self) -> f64 {
        f64::from_bits(self.playing_mic_duration.load(Ordering::Relaxed))
    }
}

struct QueuedFrame {
    samples: Vec<f32>,
    offset: usize,
    mic_duration: f64,
}

impl QueuedFrame {
    fn remaining(&self) -> usize {
        self.samples.len() - self.offset
    }
}

pub struct OutputWorklet {
    port: mpsc::Receiver<WorkletMessage>,
    queue: VecDeque<QueuedFrame>,
    buffered: usize,
    initial_buffer: usize,
    max_buffer: usize,
    prebuffering: bool,
    stats: Arc<PipelineStats>,
    status: Arc<PlayoutStatus>,
}

impl OutputWorklet {
    pub fn new(
        port: mpsc::Receiver<WorkletMessage>,
        sample_rate: u32,
        initial_buffer_ms: u32,
        max_buffer_ms: u32,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let initial_buffer = (sample_rate as u64 * initial_buffer_ms as u64 / 1000) as usize;
        let max_buffer = (sample_rate as u64 * max_buffer_ms as u64 / 1000) as usize;

        Self {
            port,
            queue: VecDeque::new(),
            buffered: 0,
            initial_buffer,
            max_buffer: max_buffer.max(initial_buffer),
            prebuffering: true,
            stats,
            status: Arc::new(PlayoutStatus::default()),
        }
    }

    pub fn status(&self) -> Arc<PlayoutStatus> {
        Arc::clone(&self.status)
    }

    fn drain_port(&mut self) {
        while let Ok(message) = self.port.try_recv() {
            match message {
                WorkletMessage::Audio {
                    frame,
                    mic_duration,
                } => {
                    if frame.is_empty() {
                        continue;
                    }
                    self.buffered += frame.len();
                    self.queue.push_back(QueuedFrame {
                        samples: frame,
                        offset: 0,
                        mic_duration,
                    });
                }
            }
        }

        while self.buffered > self.max_buffer {
            let Some(oldest) = self.queue.pop_front() else {
                break;
            };
            let dropped = oldest.remaining();
            self.buffered -= dropped;
            self.stats.record_dropped_samples(dropped);
        }
    }
}

impl AudioUnit for OutputWorklet {
    fn process(&mut self, output: &mut [f32]) {
        self.drain_port();

        if self.prebuffering {
            if self.buffered < self.initial_buffer || self.buffered == 0 {
                output.fill(0.0);
                self.status
                    .buffered_samples
                    .store(self.buffered, Ordering::Relaxed);
                return;
            }
            self.prebuffering = false;
        }

        let mut written = 0;
        while written < output.len() {
            let Some(front) = self.queue.front_mut() else {
                break;
            };
            let take = front.remaining().min(output.len() - written);
            output[written..written + take]
                .copy_from_slice(&front.samples[front.offset..front.offset + take]);
            front.offset += take;
            written += take;
            self.buffered -= take;
            self.status
                .playing_mic_duration
                .store(front.mic_duration.to_bits(), Ordering::Relaxed);

            if front.remaining() == 0 {
                self.queue.pop_front();
            }
        }

        if written < output.len() {
            output[written..].fill(0.0);
            self.prebuffering = true;
            self.stats.record_underrun();
            log::trace!("OutputWorklet: underrun after {} samples", written);
        }

        self.status
            .buffered_samples
            .store(self.buffered, Ordering::Relaxed);
    }
}
