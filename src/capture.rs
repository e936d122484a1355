//! Capture encoder: microphone blocks to fixed-size encoded chunks
//!
//! Mic audio at the device rate is resampled to 24 kHz, cut into 20 ms
//! mono frames and encoded one frame per chunk. Each chunk carries the
//! cumulative duration of audio encoded so far (`mic_duration`), derived
//! from the encoder's sample position in 48 kHz granule units.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot, watch};

use crate::audio::resample::StreamingResampler;
use crate::codec::{CodecKind, EncodeEngine};
use crate::error::PipelineError;
use crate::graph::context::ContextState;

pub const ENCODER_SAMPLE_RATE: u32 = 24000;
pub const FRAME_DURATION_MS: u32 = 20;
pub const ENCODER_CHANNELS: u16 = 1;
/// Clock of the encoded sample position
pub const GRANULE_RATE: u32 = 48000;

/// Samples per encoded frame at the encoder rate
pub const FRAME_SAMPLES: usize = (ENCODER_SAMPLE_RATE * FRAME_DURATION_MS / 1000) as usize;

const GRANULES_PER_FRAME: u64 = (GRANULE_RATE * FRAME_DURATION_MS / 1000) as u64;

/// Mic blocks queued ahead of the encoder thread
const FEED_CAPACITY: usize = 64;

/// One encoded frame plus the capture clock after encoding it.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChunk {
    data: Vec<u8>,
    mic_duration: f64,
}

impl EncodedChunk {
    pub fn new(data: Vec<u8>, mic_duration: f64) -> Self {
        Self { data, mic_duration }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Seconds of microphone audio encoded up to and including this chunk.
    pub fn mic_duration(&self) -> f64 {
        self.mic_duration
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Control surface of a running capture encoder.
pub trait CaptureEngine: Send {
    /// Begin encoding incoming audio.
    fn start(&mut self) -> Result<(), PipelineError>;

    /// Stop encoding. A partially filled frame is discarded.
    fn stop(&mut self);

    /// Encoded position in 48 kHz granules.
    fn encoded_sample_position(&self) -> u64;

    fn mic_duration(&self) -> f64 {
        self.encoded_sample_position() as f64 / GRANULE_RATE as f64
    }
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub codec: CodecKind,
    /// Rate of the blocks fed to the recorder.
    pub input_sample_rate: u32,
    pub resample_quality: u8,
}

#[derive(Debug, Default)]
struct RecorderControl {
    started: AtomicBool,
    /// Bumped on every start/stop so the worker drops partial frames
    epoch: AtomicU64,
    shutdown: AtomicBool,
    position: AtomicU64,
}

/// Capture encoder running on a dedicated thread.
pub struct StreamingRecorder {
    control: Arc<RecorderControl>,
    feed: Option<mpsc::Sender<Vec<f32>>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamingRecorder {
    /// Start the encoder thread and wait until its engine is ready.
    ///
    /// Chunks are delivered on `chunks`; encoding happens only between
    /// `start` and `stop`, and only while `context_state` is `Running`.
    pub async fn spawn(
        config: RecorderConfig,
        context_state: watch::Receiver<ContextState>,
        chunks: mpsc::Sender<EncodedChunk>,
    ) -> Result<Self, PipelineError> {
        let (feed_tx, feed_rx) = mpsc::channel(FEED_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let control = Arc::new(RecorderControl::default());

        let worker_control = Arc::clone(&control);
        let thread = std::thread::Builder::new()
            .name("capture-encoder".to_string())
            .spawn(move || {
                let encoder = match init_encoder(&config) {
                    Ok(encoder) => {
                        let _ = ready_tx.send(Ok(()));
                        encoder
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                encoder.run(feed_rx, worker_control, context_state, chunks);
            })
            .map_err(|e| PipelineError::Codec(format!("spawn capture encoder: {}", e)))?;

        let mut recorder = Self {
            control,
            feed: Some(feed_tx),
            thread: Some(thread),
        };

        match ready_rx.await {
            Ok(Ok(())) => Ok(recorder),
            Ok(Err(e)) => {
                recorder.shutdown();
                Err(e)
            }
            Err(_) => {
                recorder.shutdown();
                Err(PipelineError::Codec(
                    "capture encoder exited during init".to_string(),
                ))
            }
        }
    }

    /// Sender for microphone blocks at the configured input rate.
    pub fn feed(&self) -> Option<mpsc::Sender<Vec<f32>>> {
        self.feed.clone()
    }

    /// Signal the worker thread to exit. Idempotent.
    ///
    /// The thread is not joined: it may be parked on a full chunk channel
    /// whose consumer is torn down after the recorder. It exits at its next
    /// wakeup, or once the feed and chunk channels close.
    pub fn shutdown(&mut self) {
        self.control.started.store(false, Ordering::Release);
        self.control.shutdown.store(true, Ordering::Release);
        if let Some(feed) = self.feed.take() {
            // Wake the worker if it is waiting for input
            let _ = feed.try_send(Vec::new());
        }
        if let Some(thread) = self.thread.take() {
            if thread.is_finished() {
                let _ = thread.join();
            }
        }
    }
}

impl CaptureEngine for StreamingRecorder {
    fn start(&mut self) -> Result<(), PipelineError> {
        if self.control.shutdown.load(Ordering::Acquire) {
            return Err(PipelineError::ContextClosed);
        }
        if !self.control.started.swap(true, Ordering::AcqRel) {
            self.control.epoch.fetch_add(1, Ordering::AcqRel);
            log::info!("CaptureEncoder: started");
        }
        Ok(())
    }

    fn stop(&mut self) {
        if self.control.started.swap(false, Ordering::AcqRel) {
            self.control.epoch.fetch_add(1, Ordering::AcqRel);
            log::info!(
                "CaptureEncoder: stopped at {:.2}s",
                self.mic_duration()
            );
        }
    }

    fn encoded_sample_position(&self) -> u64 {
        self.control.position.load(Ordering::Acquire)
    }
}

impl Drop for StreamingRecorder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn init_encoder(config: &RecorderConfig) -> Result<FrameEncoder, PipelineError> {
    let engine = config.codec.encoder(ENCODER_SAMPLE_RATE, ENCODER_CHANNELS)?;
    let resampler = StreamingResampler::new(
        config.input_sample_rate,
        ENCODER_SAMPLE_RATE,
        config.resample_quality,
    )?;
    log::info!(
        "CaptureEncoder: ready ({:?}, {} Hz -> {} Hz, {} ms frames)",
        config.codec,
        config.input_sample_rate,
        ENCODER_SAMPLE_RATE,
        FRAME_DURATION_MS
    );
    Ok(FrameEncoder {
        engine,
        resampler,
        frame: Vec::with_capacity(FRAME_SAMPLES * 2),
    })
}

struct FrameEncoder {
    engine: Box<dyn EncodeEngine>,
    resampler: StreamingResampler,
    frame: Vec<f32>,
}

impl FrameEncoder {
    fn run(
        mut self,
        mut feed: mpsc::Receiver<Vec<f32>>,
        control: Arc<RecorderControl>,
        context_state: watch::Receiver<ContextState>,
        chunks: mpsc::Sender<EncodedChunk>,
    ) {
        let mut seen_epoch = control.epoch.load(Ordering::Acquire);

        while let Some(block) = feed.blocking_recv() {
            if control.shutdown.load(Ordering::Acquire) {
                break;
            }

            let epoch = control.epoch.load(Ordering::Acquire);
            if epoch != seen_epoch {
                self.frame.clear();
                seen_epoch = epoch;
            }

            if !control.started.load(Ordering::Acquire)
                || *context_state.borrow() != ContextState::Running
            {
                continue;
            }

            match self.resampler.process(&block) {
                Ok(samples) => self.frame.extend(samples),
                Err(e) => {
                    log::warn!("CaptureEncoder: resample failed: {}", e);
                    continue;
                }
            }

            while self.frame.len() >= FRAME_SAMPLES {
                let pcm: Vec<f32> = self.frame.drain(..FRAME_SAMPLES).collect();
                let data = match self.engine.encode(&pcm) {
                    Ok(data) => data,
                    Err(e) => {
                        log::warn!("CaptureEncoder: encode failed: {}", e);
                        continue;
                    }
                };

                let position =
                    control.position.fetch_add(GRANULES_PER_FRAME, Ordering::AcqRel) + GRANULES_PER_FRAME;
                let chunk = EncodedChunk::new(data, position as f64 / GRANULE_RATE as f64);

                if chunks.blocking_send(chunk).is_err() {
                    log::debug!("CaptureEncoder: chunk consumer gone, stopping");
                    return;
                }
            }
        }

        log::info!("CaptureEncoder: worker exited");
    }
}
