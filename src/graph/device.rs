//! Default output device backend
//!
//! cpal streams are not `Send`, so each output lives on its own
//! "audio-output" thread and is controlled through a command channel.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use futures_util::future::BoxFuture;
use tokio::sync::oneshot;

use super::context::{AudioBackend, OutputStream};
use super::GraphRenderer;
use crate::error::PipelineError;

enum DeviceCommand {
    Play(oneshot::Sender<Result<(), PipelineError>>),
    Close,
}

/// Plays the graph through the system's default output device.
#[derive(Debug, Default, Clone)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

fn default_output() -> Result<(Device, cpal::SupportedStreamConfig), PipelineError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PipelineError::Device("no output device found".to_string()))?;
    let config = device
        .default_output_config()
        .map_err(|e| PipelineError::Device(format!("no supported output config: {}", e)))?;
    Ok((device, config))
}

impl AudioBackend for CpalBackend {
    fn output_sample_rate(&self) -> Result<u32, PipelineError> {
        let (_, config) = default_output()?;
        Ok(config.sample_rate().0)
    }

    fn open_output(&self, renderer: GraphRenderer) -> Result<Box<dyn OutputStream>, PipelineError> {
        let (command_tx, command_rx) = std_mpsc::channel::<DeviceCommand>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), PipelineError>>();

        let thread = std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || run_output_thread(renderer, command_rx, ready_tx))
            .map_err(|e| PipelineError::Device(format!("spawn output thread: {}", e)))?;

        ready_rx.recv().map_err(|_| {
            PipelineError::Device("output thread exited during startup".to_string())
        })??;

        Ok(Box::new(CpalOutputStream {
            command_tx: Some(command_tx),
            thread: Some(thread),
        }))
    }
}

struct CpalOutputStream {
    command_tx: Option<std_mpsc::Sender<DeviceCommand>>,
    thread: Option<JoinHandle<()>>,
}

impl OutputStream for CpalOutputStream {
    fn play(&mut self) -> BoxFuture<'_, Result<(), PipelineError>> {
        Box::pin(async move {
            let (ack_tx, ack_rx) = oneshot::channel();
            let sent = self
                .command_tx
                .as_ref()
                .map(|tx| tx.send(DeviceCommand::Play(ack_tx)).is_ok())
                .unwrap_or(false);
            if !sent {
                return Err(PipelineError::ContextClosed);
            }
            ack_rx
                .await
                .map_err(|_| PipelineError::Device("output thread exited".to_string()))?
        })
    }

    fn close(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(DeviceCommand::Close);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("AudioOutput: output thread panicked");
            }
        }
    }
}

impl Drop for CpalOutputStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_output_thread(
    renderer: GraphRenderer,
    command_rx: std_mpsc::Receiver<DeviceCommand>,
    ready_tx: std_mpsc::Sender<Result<(), PipelineError>>,
) {
    let stream = match open_default_output(renderer) {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    while let Ok(command) = command_rx.recv() {
        match command {
            DeviceCommand::Play(ack) => {
                let result = stream
                    .play()
                    .map_err(|e| PipelineError::Device(format!("failed to start output: {}", e)));
                let _ = ack.send(result);
            }
            DeviceCommand::Close => break,
        }
    }

    if let Err(e) = stream.pause() {
        log::debug!("AudioOutput: pause on close failed: {}", e);
    }
    drop(stream);
    log::info!("AudioOutput: output stopped");
}

fn open_default_output(renderer: GraphRenderer) -> Result<cpal::Stream, PipelineError> {
    let (device, supported) = default_output()?;

    log::info!(
        "AudioOutput: using {:?} at {} Hz, {} channels, {:?}",
        device.name(),
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let sample_format = supported.sample_format();
    let mut config: StreamConfig = supported.into();
    config.sample_rate = cpal::SampleRate(renderer.sample_rate());

    let stream = match sample_format {
        SampleFormat::I16 => build_output_stream::<i16>(&device, &config, renderer)?,
        SampleFormat::U16 => build_output_stream::<u16>(&device, &config, renderer)?,
        SampleFormat::F32 => build_output_stream::<f32>(&device, &config, renderer)?,
        other => {
            return Err(PipelineError::Device(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    };

    // Built streams may start immediately on some hosts; hold until resumed
    stream
        .pause()
        .map_err(|e| PipelineError::Device(format!("failed to pause output: {}", e)))?;

    Ok(stream)
}

fn build_output_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut renderer: GraphRenderer,
) -> Result<cpal::Stream, PipelineError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels as usize;
    let mut mono: Vec<f32> = Vec::new();
    let err_fn = |err| log::error!("AudioOutput: stream error: {}", err);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels.max(1);
                mono.resize(frames, 0.0);
                renderer.render(&mut mono);
                for (frame, &sample) in data.chunks_mut(channels.max(1)).zip(&mono) {
                    let value = T::from_sample(sample);
                    frame.fill(value);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| PipelineError::Device(e.to_string()))
}
