//! Decode worker: inbound packets to playback-rate frames
//!
//! Runs on its own thread. Messages are processed strictly in arrival
//! order: one `Init`, then any number of `Frame`s, then `Close`. A packet
//! that fails to decode is logged, counted and dropped; the worker keeps
//! going with the next one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::audio::resample::StreamingResampler;
use crate::codec::DecodeEngine;
use crate::error::PipelineError;
use crate::graph::worklet::{PostError, WorkletMessage, WorkletPort};
use crate::stats::PipelineStats;

/// Rate of the audio carried on the wire.
pub const DECODER_SAMPLE_RATE: u32 = 24000;

/// Samples per forwarded frame at 24 kHz (40 ms)
const BUFFER_LENGTH_AT_DECODER_RATE: u64 = 960;

/// Inbound packets queued ahead of the worker
const INPUT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct DecoderConfig {
    pub decoder_sample_rate: u32,
    pub output_sample_rate: u32,
    /// Samples per frame forwarded to the worklet, at the output rate.
    pub buffer_length: usize,
    pub resample_quality: u8,
}

impl DecoderConfig {
    pub fn new(output_sample_rate: u32, resample_quality: u8) -> Self {
        Self {
            decoder_sample_rate: DECODER_SAMPLE_RATE,
            output_sample_rate,
            buffer_length: (BUFFER_LENGTH_AT_DECODER_RATE * output_sample_rate as u64
                / DECODER_SAMPLE_RATE as u64) as usize,
            resample_quality,
        }
    }
}

#[derive(Debug)]
enum DecoderMessage {
    Init(DecoderConfig),
    Frame(Vec<u8>),
    Close,
}

/// The decode worker has shut down.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("decode worker is closed")]
pub struct DecoderClosed;

/// Cloneable entry point for inbound packets.
#[derive(Debug, Clone)]
pub struct DecoderInput {
    tx: mpsc::Sender<DecoderMessage>,
}

impl DecoderInput {
    /// Queue one encoded packet. Waits while the worker is backlogged.
    pub async fn send(&self, packet: Vec<u8>) -> Result<(), DecoderClosed> {
        self.tx
            .send(DecoderMessage::Frame(packet))
            .await
            .map_err(|_| DecoderClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct DecodeWorker {
    input: DecoderInput,
    closed: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DecodeWorker {
    /// Start the worker and initialize its engine with `config`.
    ///
    /// Decoded frames go to `sink`, tagged with the latest value of
    /// `mic_duration`. Fails if the engine rejects the configuration.
    pub async fn spawn(
        engine: Box<dyn DecodeEngine>,
        config: DecoderConfig,
        sink: WorkletPort,
        mic_duration: watch::Receiver<f64>,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, PipelineError> {
        let (tx, rx) = mpsc::channel(INPUT_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let closed = Arc::new(AtomicBool::new(false));

        tx.try_send(DecoderMessage::Init(config))
            .map_err(|_| PipelineError::Codec("decoder input unavailable".to_string()))?;

        let worker = Worker {
            engine,
            resampler: None,
            buffer_length: 0,
            pending: Vec::new(),
            sink,
            mic_duration,
            stats,
            closed: Arc::clone(&closed),
        };

        let thread = std::thread::Builder::new()
            .name("decode-worker".to_string())
            .spawn(move || worker.run(rx, ready_tx))
            .map_err(|e| PipelineError::Codec(format!("spawn decode worker: {}", e)))?;

        let mut this = Self {
            input: DecoderInput { tx },
            closed,
            thread: Some(thread),
        };

        match ready_rx.await {
            Ok(Ok(())) => Ok(this),
            Ok(Err(e)) => {
                this.close();
                Err(e)
            }
            Err(_) => {
                this.close();
                Err(PipelineError::Codec(
                    "decode worker exited during init".to_string(),
                ))
            }
        }
    }

    pub fn input(&self) -> DecoderInput {
        self.input.clone()
    }

    /// Stop the worker. Later sends on any `DecoderInput` fail. Idempotent.
    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // A full queue still ends the worker: it checks the flag per message
        let _ = self.input.tx.try_send(DecoderMessage::Close);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("DecodeWorker: worker thread panicked");
            }
        }
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        self.close();
    }
}

struct Worker {
    engine: Box<dyn DecodeEngine>,
    resampler: Option<StreamingResampler>,
    buffer_length: usize,
    pending: Vec<f32>,
    sink: WorkletPort,
    mic_duration: watch::Receiver<f64>,
    stats: Arc<PipelineStats>,
    closed: Arc<AtomicBool>,
}

impl Worker {
    fn run(
        mut self,
        mut rx: mpsc::Receiver<DecoderMessage>,
        ready_tx: oneshot::Sender<Result<(), PipelineError>>,
    ) {
        let mut ready_tx = Some(ready_tx);

        while let Some(message) = rx.blocking_recv() {
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            match message {
                DecoderMessage::Init(config) => {
                    if self.resampler.is_some() {
                        log::warn!("DecodeWorker: ignoring repeated init");
                        continue;
                    }
                    let result = self.init(&config);
                    let failed = result.is_err();
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(result);
                    }
                    if failed {
                        break;
                    }
                }
                DecoderMessage::Frame(packet) => {
                    if self.resampler.is_none() {
                        log::warn!("DecodeWorker: frame before init, dropped");
                        continue;
                    }
                    if !self.handle_frame(&packet) {
                        log::debug!("DecodeWorker: playback gone, stopping");
                        break;
                    }
                }
                DecoderMessage::Close => break,
            }
        }

        rx.close();
        log::info!("DecodeWorker: stopped");
    }

    fn init(&mut self, config: &DecoderConfig) -> Result<(), PipelineError> {
        if config.buffer_length == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "buffer length 0 at {} Hz",
                config.output_sample_rate
            )));
        }
        self.engine.init(config)?;
        self.resampler = Some(StreamingResampler::new(
            config.decoder_sample_rate,
            config.output_sample_rate,
            config.resample_quality,
        )?);
        self.buffer_length = config.buffer_length;
        self.pending = Vec::with_capacity(config.buffer_length * 2);

        log::info!(
            "DecodeWorker: initialized ({} Hz -> {} Hz, {} samples per frame)",
            config.decoder_sample_rate,
            config.output_sample_rate,
            config.buffer_length
        );
        Ok(())
    }

    /// Returns false once the worklet port is closed.
    fn handle_frame(&mut self, packet: &[u8]) -> bool {
        let decoded = match self.engine.decode(packet) {
            Ok(samples) => samples,
            Err(fault) => {
                self.stats.record_decode_fault();
                log::warn!("DecodeWorker: {}", fault);
                return true;
            }
        };
        if decoded.is_empty() {
            self.stats.record_empty_decode();
            return true;
        }
        self.stats.record_frame_decoded();

        let Some(resampler) = self.resampler.as_mut() else {
            return true;
        };
        match resampler.process(&decoded) {
            Ok(resampled) => self.pending.extend(resampled),
            Err(e) => {
                self.stats.record_decode_fault();
                log::warn!("DecodeWorker: resample failed: {}", e);
                return true;
            }
        }

        while self.pending.len() >= self.buffer_length {
            let frame: Vec<f32> = self.pending.drain(..self.buffer_length).collect();
            let mic_duration = *self.mic_duration.borrow();
            match self.sink.post(WorkletMessage::Audio {
                frame,
                mic_duration,
            }) {
                Ok(()) => self.stats.record_frame_forwarded(),
                Err(PostError::Full) => {
                    self.stats.record_dropped_samples(self.buffer_length);
                    log::debug!("DecodeWorker: worklet port full, frame dropped");
                }
                Err(PostError::Closed) => return false,
            }
        }
        true
    }
}
