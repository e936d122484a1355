//! Microphone sources
//!
//! A `MicSource` opens into a `MicStream`: mono f32 blocks delivered over a
//! channel at the device's native rate. `CpalMicSource` captures from the
//! default input device on a dedicated audio thread, since cpal streams are
//! not `Send`.

use std::any::Any;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, StreamConfig};
use tokio::sync::mpsc;

use crate::error::PipelineError;

/// Blocks buffered between the audio callback and the pipeline
const MIC_CHANNEL_CAPACITY: usize = 64;

/// Something that can produce live microphone audio.
pub trait MicSource: Send + Sync {
    /// Open the source. Fails with `CaptureUnavailable` when the device is
    /// missing or access is denied.
    fn open(&self) -> Result<MicStream, PipelineError>;
}

/// An open microphone: native sample rate plus a channel of mono blocks.
///
/// Dropping the stream releases the underlying device.
pub struct MicStream {
    sample_rate: u32,
    blocks: mpsc::Receiver<Vec<f32>>,
    _guard: Option<Box<dyn Any + Send>>,
}

impl MicStream {
    pub fn new(sample_rate: u32, blocks: mpsc::Receiver<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            blocks,
            _guard: None,
        }
    }

    /// Attach a value that is kept alive for as long as the stream.
    pub fn with_guard(mut self, guard: impl Any + Send) -> Self {
        self._guard = Some(Box::new(guard));
        self
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub(crate) fn into_parts(self) -> (u32, mpsc::Receiver<Vec<f32>>, Option<Box<dyn Any + Send>>) {
        (self.sample_rate, self.blocks, self._guard)
    }
}

/// Captures from the system's default input device.
#[derive(Debug, Default, Clone)]
pub struct CpalMicSource;

impl CpalMicSource {
    pub fn new() -> Self {
        Self
    }
}

impl MicSource for CpalMicSource {
    fn open(&self) -> Result<MicStream, PipelineError> {
        let (block_tx, block_rx) = mpsc::channel(MIC_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32, PipelineError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || run_capture_thread(block_tx, ready_tx, stop_rx))
            .map_err(|e| PipelineError::CaptureUnavailable(format!("spawn capture thread: {}", e)))?;

        let sample_rate = ready_rx.recv().map_err(|_| {
            PipelineError::CaptureUnavailable("capture thread exited during startup".to_string())
        })??;

        let guard = CaptureThreadGuard {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        };

        Ok(MicStream::new(sample_rate, block_rx).with_guard(guard))
    }
}

/// Stops and joins the capture thread when dropped.
struct CaptureThreadGuard {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for CaptureThreadGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Mic: capture thread panicked");
            }
        }
    }
}

fn run_capture_thread(
    block_tx: mpsc::Sender<Vec<f32>>,
    ready_tx: std_mpsc::Sender<Result<u32, PipelineError>>,
    stop_rx: std_mpsc::Receiver<()>,
) {
    let stream = match open_default_input(block_tx) {
        Ok((stream, sample_rate)) => {
            let _ = ready_tx.send(Ok(sample_rate));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Park until asked to stop (or the guard is gone)
    let _ = stop_rx.recv();
    drop(stream);
    log::info!("Mic: capture stopped");
}

fn open_default_input(
    block_tx: mpsc::Sender<Vec<f32>>,
) -> Result<(cpal::Stream, u32), PipelineError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| PipelineError::CaptureUnavailable("no input device found".to_string()))?;

    log::info!("Mic: using input device {:?}", device.name());

    let supported = device.default_input_config().map_err(|e| {
        PipelineError::CaptureUnavailable(format!("no supported input config: {}", e))
    })?;

    log::info!(
        "Mic: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let sample_rate = config.sample_rate.0;

    let stream = match sample_format {
        SampleFormat::I16 => build_input_stream::<i16>(&device, &config, block_tx)?,
        SampleFormat::U16 => build_input_stream::<u16>(&device, &config, block_tx)?,
        SampleFormat::F32 => build_input_stream::<f32>(&device, &config, block_tx)?,
        other => {
            return Err(PipelineError::CaptureUnavailable(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    };

    stream
        .play()
        .map_err(|e| PipelineError::CaptureUnavailable(format!("failed to start stream: {}", e)))?;

    Ok((stream, sample_rate))
}

fn build_input_stream<T>(
    device: &Device,
    config: &StreamConfig,
    block_tx: mpsc::Sender<Vec<f32>>,
) -> Result<cpal::Stream, PipelineError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let err_fn = |err| log::error!("Mic: stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let block = downmix_to_mono(data, channels);
                // Never block the audio thread; a full channel drops the block
                if block_tx.try_send(block).is_err() {
                    log::trace!("Mic: pipeline behind, dropped input block");
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| PipelineError::CaptureUnavailable(e.to_string()))
}

/// Average interleaved channels into a mono f32 block.
fn downmix_to_mono<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: Sample,
    f32: FromSample<T>,
{
    if channels <= 1 {
        return data.iter().map(|&s| s.to_sample::<f32>()).collect();
    }
    data.chunks(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|&s| s.to_sample::<f32>()).sum();
            sum / frame.len() as f32
        })
        .collect()
}
