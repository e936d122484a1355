//! Playback graph
//!
//! Fixed topology, built once per pipeline:
//!
//! ```text
//! mic tap ──► input analyser ──────────────┐
//!                                          ├──► mix destination
//! worklet ──► output analyser ──┬──────────┘
//!                               └──► gain ──► device output
//! ```
//!
//! `PlaybackGraph` holds the control-side handles; `GraphRenderer` is moved
//! to the device thread and produces one quantum per `render` call.

pub mod analyser;
pub mod bridge;
pub mod context;
pub mod device;
pub mod gain;
pub mod mix;
pub mod worklet;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;

use self::analyser::Analyser;
use self::bridge::WorkletNode;
use self::context::{ContextClock, ContextShared, ContextState, PlaybackContext};
use self::gain::{GainParam, GainReader};
use self::mix::MixDestination;
use self::worklet::{AudioUnit, PlayoutStatus, WorkletPort};
use crate::error::PipelineError;

/// Mic blocks buffered between the capture fan-out and the render thread
const CAPTURE_TAP_CAPACITY: usize = 64;

/// Mic audio held for the mix before the oldest is dropped, in seconds
const MAX_MIC_BACKLOG_SECS: u32 = 1;

#[derive(Debug, Clone)]
pub struct GraphSettings {
    pub fft_size: usize,
    pub initial_gain: f32,
    pub volume_time_constant: f64,
}

#[derive(Debug, Clone, Copy)]
enum GraphCommand {
    SetGainTarget {
        target: f32,
        start_time: f64,
        time_constant: f64,
    },
}

/// Control-side handles to a built graph.
pub struct PlaybackGraph {
    input_analyser: Analyser,
    output_analyser: Analyser,
    mix: MixDestination,
    gain: GainReader,
    commands: mpsc::UnboundedSender<GraphCommand>,
    capture_tap: mpsc::Sender<Vec<f32>>,
    port: WorkletPort,
    playout: Arc<PlayoutStatus>,
    clock: ContextClock,
    volume_time_constant: f64,
}

impl PlaybackGraph {
    /// Ramp the output gain toward `level`, starting now.
    pub fn set_volume(&self, level: f32) {
        let command = GraphCommand::SetGainTarget {
            target: level,
            start_time: self.clock.current_time(),
            time_constant: self.volume_time_constant,
        };
        if self.commands.send(command).is_err() {
            log::debug!("PlaybackGraph: renderer gone, volume change dropped");
        }
    }

    pub fn input_analyser(&self) -> &Analyser {
        &self.input_analyser
    }

    pub fn output_analyser(&self) -> &Analyser {
        &self.output_analyser
    }

    pub fn mix(&self) -> &MixDestination {
        &self.mix
    }

    pub fn gain(&self) -> &GainReader {
        &self.gain
    }

    pub fn worklet_port(&self) -> &WorkletPort {
        &self.port
    }

    pub fn playout(&self) -> &Arc<PlayoutStatus> {
        &self.playout
    }

    pub fn clock(&self) -> &ContextClock {
        &self.clock
    }

    pub(crate) fn capture_tap(&self) -> mpsc::Sender<Vec<f32>> {
        self.capture_tap.clone()
    }
}

/// Wire the fixed topology around `node` on `context`.
pub fn build_playback_graph(
    context: &PlaybackContext,
    node: WorkletNode,
    settings: &GraphSettings,
) -> Result<(PlaybackGraph, GraphRenderer), PipelineError> {
    let sample_rate = context.sample_rate();
    let input_analyser = Analyser::new(settings.fft_size)?;
    let output_analyser = Analyser::new(settings.fft_size)?;
    let mix = MixDestination::new(sample_rate);
    let gain = GainParam::new(settings.initial_gain, sample_rate);
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (tap_tx, tap_rx) = mpsc::channel(CAPTURE_TAP_CAPACITY);
    let (port, unit, playout) = node.into_parts();

    let graph = PlaybackGraph {
        input_analyser: input_analyser.clone(),
        output_analyser: output_analyser.clone(),
        mix: mix.clone(),
        gain: gain.reader(),
        commands: command_tx,
        capture_tap: tap_tx,
        port,
        playout,
        clock: context.clock(),
        volume_time_constant: settings.volume_time_constant,
    };

    let renderer = GraphRenderer {
        shared: context.shared(),
        worklet: unit,
        capture_tap: tap_rx,
        mic_backlog: VecDeque::new(),
        max_mic_backlog: (sample_rate * MAX_MIC_BACKLOG_SECS) as usize,
        input_analyser,
        output_analyser,
        gain,
        commands: command_rx,
        mix,
        mic_buf: Vec::new(),
        worklet_buf: Vec::new(),
        mix_buf: Vec::new(),
    };

    Ok((graph, renderer))
}

/// Render side of the graph. Owned by whichever thread drives the output.
pub struct GraphRenderer {
    shared: Arc<ContextShared>,
    worklet: Box<dyn AudioUnit>,
    capture_tap: mpsc::Receiver<Vec<f32>>,
    mic_backlog: VecDeque<f32>,
    max_mic_backlog: usize,
    input_analyser: Analyser,
    output_analyser: Analyser,
    gain: GainParam,
    commands: mpsc::UnboundedReceiver<GraphCommand>,
    mix: MixDestination,
    mic_buf: Vec<f32>,
    worklet_buf: Vec<f32>,
    mix_buf: Vec<f32>,
}

impl GraphRenderer {
    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate()
    }

    /// Produce the next quantum of mono output. Silence unless the context is running.
    pub fn render(&mut self, out: &mut [f32]) {
        if self.shared.state() != ContextState::Running {
            out.fill(0.0);
            return;
        }
        let frames = out.len();

        while let Ok(command) = self.commands.try_recv() {
            match command {
                GraphCommand::SetGainTarget {
                    target,
                    start_time,
                    time_constant,
                } => self.gain.set_target_at_time(target, start_time, time_constant),
            }
        }

        while let Ok(block) = self.capture_tap.try_recv() {
            self.mic_backlog.extend(block);
        }
        if self.mic_backlog.len() > self.max_mic_backlog {
            let excess = self.mic_backlog.len() - self.max_mic_backlog;
            self.mic_backlog.drain(..excess);
        }

        let available = self.mic_backlog.len().min(frames);
        self.mic_buf.clear();
        self.mic_buf.extend(self.mic_backlog.drain(..available));
        self.mic_buf.resize(frames, 0.0);
        self.input_analyser.push(&self.mic_buf);

        self.worklet_buf.resize(frames, 0.0);
        self.worklet.process(&mut self.worklet_buf[..frames]);
        self.output_analyser.push(&self.worklet_buf[..frames]);

        if self.mix.subscriber_count() > 0 {
            self.mix_buf.clear();
            self.mix_buf.extend(
                self.worklet_buf[..frames]
                    .iter()
                    .zip(&self.mic_buf)
                    .map(|(ai, mic)| ai + mic),
            );
            self.mix.publish(&self.mix_buf);
        }

        let first_frame = self.shared.advance(frames as u64);
        for (i, (sample, &ai)) in out.iter_mut().zip(&self.worklet_buf[..frames]).enumerate() {
            *sample = ai * self.gain.value_at(first_frame + i as u64);
        }
        self.gain.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::bridge::{output_unit_factory, UnitOptions};
    use crate::graph::context::OfflineBackend;
    use crate::graph::worklet::WorkletMessage;
    use crate::stats::PipelineStats;

    fn settings() -> GraphSettings {
        GraphSettings {
            fft_size: 256,
            initial_gain: 1.0,
            volume_time_constant: 0.01,
        }
    }

    fn build(ctx: &PlaybackContext) -> (PlaybackGraph, GraphRenderer) {
        let options = UnitOptions {
            sample_rate: ctx.sample_rate(),
            initial_buffer_ms: 0,
            max_buffer_ms: 1000,
            stats: Arc::new(PipelineStats::new()),
        };
        let node = output_unit_factory()(&options).unwrap();
        build_playback_graph(ctx, node, &settings()).unwrap()
    }

    #[tokio::test]
    async fn test_silent_while_suspended() {
        let backend = OfflineBackend::new(48000);
        let ctx = PlaybackContext::new(&backend).unwrap();
        let (graph, mut renderer) = build(&ctx);

        graph
            .worklet_port()
            .post(WorkletMessage::Audio {
                frame: vec![0.5; 128],
                mic_duration: 0.0,
            })
            .unwrap();

        let mut out = vec![1.0; 128];
        renderer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(ctx.current_time(), 0.0);
    }

    #[tokio::test]
    async fn test_worklet_audio_reaches_output_and_mix() {
        let backend = OfflineBackend::new(48000);
        let mut ctx = PlaybackContext::new(&backend).unwrap();
        let (graph, mut renderer) = build(&ctx);
        ctx.resume().await.unwrap();

        let mut mix_rx = graph.mix().subscribe();
        graph.capture_tap().try_send(vec![0.25; 128]).unwrap();
        graph
            .worklet_port()
            .post(WorkletMessage::Audio {
                frame: vec![0.5; 128],
                mic_duration: 0.02,
            })
            .unwrap();

        let mut out = vec![0.0; 128];
        renderer.render(&mut out);

        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
        let mixed = mix_rx.recv().await.unwrap();
        assert!(mixed.iter().all(|&s| (s - 0.75).abs() < 1e-6));
        assert!(graph.input_analyser().level() > 0.0);
        assert!(graph.output_analyser().level() > 0.0);
        assert!((ctx.current_time() - 128.0 / 48000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_mic_does_not_reach_device_output() {
        let backend = OfflineBackend::new(48000);
        let mut ctx = PlaybackContext::new(&backend).unwrap();
        let (graph, mut renderer) = build(&ctx);
        ctx.resume().await.unwrap();

        graph.capture_tap().try_send(vec![0.9; 128]).unwrap();
        let mut out = vec![1.0; 128];
        renderer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[tokio::test]
    async fn test_volume_ramps_output() {
        let backend = OfflineBackend::new(48000);
        let mut ctx = PlaybackContext::new(&backend).unwrap();
        let (graph, mut renderer) = build(&ctx);
        ctx.resume().await.unwrap();

        graph.set_volume(0.0);
        graph
            .worklet_port()
            .post(WorkletMessage::Audio {
                frame: vec![1.0; 4800],
                mic_duration: 0.0,
            })
            .unwrap();

        let mut out = vec![0.0; 4800];
        renderer.render(&mut out);

        // Starts near full scale and decays without a jump
        assert!(out[0] > 0.99);
        assert!(out.windows(2).all(|w| w[1] <= w[0]));
        assert!(out[4799] < 0.001);
        assert!(graph.gain().value() < 0.001);
    }
}
