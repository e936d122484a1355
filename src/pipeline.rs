//! Pipeline controller
//!
//! A single task owns the pipeline state, the live pipeline's resources and
//! the volume level. `PipelineController` handles send it commands; builds
//! run as separate tasks and report back, so a shutdown can interrupt a
//! build that is still loading or resuming.
//!
//! Observers follow the live pipeline through a `watch` channel of
//! `Option<Arc<PipelineHandle>>`: `Some` is published only once every
//! stage is running, `None` once it has been released.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::mic::MicSource;
use crate::audio::resample::StreamingResampler;
use crate::capture::{CaptureEngine, EncodedChunk, RecorderConfig, StreamingRecorder};
use crate::decode::{DecodeWorker, DecoderConfig, DecoderInput};
use crate::error::PipelineError;
use crate::graph::analyser::Analyser;
use crate::graph::bridge::{acquire_worklet_node, BuiltinUnitLoader, UnitLoader, UnitOptions};
use crate::graph::context::{AudioBackend, ContextClock, ContextState, PlaybackContext};
use crate::graph::device::CpalBackend;
use crate::graph::gain::GainReader;
use crate::graph::mix::MixDestination;
use crate::graph::worklet::PlayoutStatus;
use crate::graph::{build_playback_graph, GraphSettings, PlaybackGraph};
use crate::settings::AudioSettings;
use crate::state_machine::{reduce, Effect, Event, PipelineState, State};
use crate::stats::{PipelineStats, StatsSnapshot};

/// Commands queued ahead of the controller task
const COMMAND_CAPACITY: usize = 32;

/// Encoded chunks buffered between the encoder and the forwarder
const CHUNK_CAPACITY: usize = 64;

/// Log encoder progress every N chunks (~5 s of audio)
const PROGRESS_LOG_INTERVAL: u64 = 250;

/// Mic-to-graph resampling only feeds meters and the mix
const TAP_RESAMPLE_QUALITY: u8 = 0;

/// Collaborators the controller builds pipelines with.
#[derive(Clone)]
pub struct PipelineDeps {
    pub backend: Arc<dyn AudioBackend>,
    pub unit_loader: Arc<dyn UnitLoader>,
}

impl PipelineDeps {
    /// Default output device and the built-in playback unit.
    pub fn system() -> Self {
        Self {
            backend: Arc::new(CpalBackend::new()),
            unit_loader: Arc::new(BuiltinUnitLoader),
        }
    }
}

/// Read-only view of a live pipeline.
///
/// Holding a handle does not keep the pipeline alive; after shutdown its
/// decoder input rejects packets and its meters stop updating.
pub struct PipelineHandle {
    id: Uuid,
    sample_rate: u32,
    input_analyser: Analyser,
    output_analyser: Analyser,
    mix: MixDestination,
    gain: GainReader,
    decoder: DecoderInput,
    clock: ContextClock,
    playout: Arc<PlayoutStatus>,
    mic_duration: watch::Receiver<f64>,
    stats: Arc<PipelineStats>,
}

impl PipelineHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Playback context rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Microphone level and spectrum.
    pub fn input_analyser(&self) -> &Analyser {
        &self.input_analyser
    }

    /// AI output level and spectrum, before the volume stage.
    pub fn output_analyser(&self) -> &Analyser {
        &self.output_analyser
    }

    pub fn mix(&self) -> &MixDestination {
        &self.mix
    }

    /// Current gain of the volume stage.
    pub fn volume(&self) -> f32 {
        self.gain.value()
    }

    /// Entry point for inbound encoded packets.
    pub fn decoder(&self) -> &DecoderInput {
        &self.decoder
    }

    pub fn current_time(&self) -> f64 {
        self.clock.current_time()
    }

    pub fn context_state(&self) -> ContextState {
        self.clock.state()
    }

    /// Seconds of microphone audio encoded so far.
    pub fn mic_duration(&self) -> f64 {
        *self.mic_duration.borrow()
    }

    /// How far playback trails capture, in seconds.
    pub fn playout_delay(&self) -> f64 {
        (self.mic_duration() - self.playout.playing_mic_duration()).max(0.0)
    }

    pub fn buffered_samples(&self) -> usize {
        self.playout.buffered_samples()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("id", &self.id)
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

/// Everything a live pipeline owns. Dropping it releases all of it.
struct PipelineResources {
    id: Uuid,
    context: PlaybackContext,
    recorder: StreamingRecorder,
    decoder: DecodeWorker,
    graph: PlaybackGraph,
    tasks: Vec<JoinHandle<()>>,
    _mic_guard: Option<Box<dyn Any + Send>>,
}

impl PipelineResources {
    fn set_volume(&self, level: f32) {
        self.graph.set_volume(level);
    }
}

impl Drop for PipelineResources {
    fn drop(&mut self) {
        self.context.close();
        self.recorder.stop();
        self.recorder.shutdown();
        self.decoder.close();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        log::info!("Pipeline: {} released", self.id);
    }
}

/// Drop `resources` on the blocking pool; closing joins worker and device threads.
async fn release(resources: PipelineResources) {
    let id = resources.id;
    if let Err(e) = tokio::task::spawn_blocking(move || drop(resources)).await {
        log::warn!("Pipeline: release of {} failed: {}", id, e);
    }
}

type SetupReply = oneshot::Sender<Result<Arc<PipelineHandle>, PipelineError>>;

enum Command {
    Setup {
        mic: Arc<dyn MicSource>,
        reply: SetupReply,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    SetVolume {
        level: f32,
        reply: oneshot::Sender<()>,
    },
}

struct BuildResult {
    id: Uuid,
    result: Result<(PipelineResources, Arc<PipelineHandle>), PipelineError>,
}

struct InFlightBuild {
    id: Uuid,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Cloneable handle to the controller task.
///
/// The task exits, releasing any live pipeline, once every clone is dropped.
#[derive(Clone)]
pub struct PipelineController {
    commands: mpsc::Sender<Command>,
    handle_rx: watch::Receiver<Option<Arc<PipelineHandle>>>,
}

impl PipelineController {
    /// Start the controller task on the current runtime.
    ///
    /// Every encoded microphone chunk of every pipeline is sent to `on_chunk`.
    pub fn spawn(
        settings: AudioSettings,
        deps: PipelineDeps,
        on_chunk: mpsc::Sender<EncodedChunk>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (handle_tx, handle_rx) = watch::channel(None);
        let (build_tx, build_rx) = mpsc::channel(4);

        let volume = settings.initial_volume.clamp(0.0, 1.0);
        let actor = ControllerActor {
            state: State::Idle,
            settings,
            deps,
            on_chunk,
            volume,
            waiters: Vec::new(),
            requester: None,
            pending_mic: None,
            build: None,
            built: None,
            active: None,
            handle_tx,
            build_tx,
        };

        tokio::spawn(actor.run(command_rx, build_rx));

        Self {
            commands: command_tx,
            handle_rx,
        }
    }

    /// Build the pipeline around `mic`, or return the live one.
    ///
    /// Calls made while a build is in flight wait for that build.
    pub async fn setup(&self, mic: Arc<dyn MicSource>) -> Result<Arc<PipelineHandle>, PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Setup { mic, reply })
            .await
            .map_err(|_| PipelineError::ControllerGone)?;
        rx.await.map_err(|_| PipelineError::ControllerGone)?
    }

    /// Release the live pipeline or interrupt the in-flight build. Safe to
    /// call at any time, any number of times.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Set the output volume in [0.0, 1.0]; out-of-range values are clamped.
    ///
    /// The level applies to the live pipeline (ramped) and to pipelines built later.
    pub async fn set_volume(&self, level: f32) -> Result<(), PipelineError> {
        if !level.is_finite() {
            return Err(PipelineError::InvalidVolume(level));
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SetVolume {
                level: level.clamp(0.0, 1.0),
                reply,
            })
            .await
            .map_err(|_| PipelineError::ControllerGone)?;
        rx.await.map_err(|_| PipelineError::ControllerGone)
    }

    /// Follow the live pipeline.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<PipelineHandle>>> {
        self.handle_rx.clone()
    }

    pub fn current(&self) -> Option<Arc<PipelineHandle>> {
        self.handle_rx.borrow().clone()
    }

    pub fn state(&self) -> PipelineState {
        if self.handle_rx.borrow().is_some() {
            PipelineState::Active
        } else {
            PipelineState::Uninitialized
        }
    }
}

struct ControllerActor {
    state: State,
    settings: AudioSettings,
    deps: PipelineDeps,
    on_chunk: mpsc::Sender<EncodedChunk>,
    volume: f32,
    waiters: Vec<SetupReply>,
    /// Reply channel of the setup call being dispatched
    requester: Option<SetupReply>,
    /// Mic of the setup call being dispatched
    pending_mic: Option<Arc<dyn MicSource>>,
    build: Option<InFlightBuild>,
    /// Finished build awaiting Publish or DiscardBuild
    built: Option<(PipelineResources, Arc<PipelineHandle>)>,
    active: Option<(PipelineResources, Arc<PipelineHandle>)>,
    handle_tx: watch::Sender<Option<Arc<PipelineHandle>>>,
    build_tx: mpsc::Sender<BuildResult>,
}

impl ControllerActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut builds: mpsc::Receiver<BuildResult>,
    ) {
        log::debug!("Pipeline: controller started");

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle_command(command, &mut builds).await;
                }
                Some(result) = builds.recv() => {
                    self.handle_build_result(result).await;
                }
            }
        }

        // Every controller handle is gone
        self.dispatch(Event::ShutdownRequested, &mut builds).await;
        log::debug!("Pipeline: controller stopped");
    }

    async fn handle_command(&mut self, command: Command, builds: &mut mpsc::Receiver<BuildResult>) {
        match command {
            Command::Setup { mic, reply } => {
                self.requester = Some(reply);
                self.pending_mic = Some(mic);
                self.dispatch(Event::SetupRequested, builds).await;
                self.requester = None;
                self.pending_mic = None;
            }
            Command::Shutdown { reply } => {
                self.dispatch(Event::ShutdownRequested, builds).await;
                let _ = reply.send(());
            }
            Command::SetVolume { level, reply } => {
                self.volume = level;
                if let Some((resources, _)) = self.active.as_ref() {
                    resources.set_volume(level);
                }
                log::debug!("Pipeline: volume set to {:.2}", level);
                let _ = reply.send(());
            }
        }
    }

    async fn handle_build_result(&mut self, build: BuildResult) {
        let BuildResult { id, result } = build;
        if self.build.as_ref().is_some_and(|b| b.id == id) {
            self.build = None;
        }
        let event = match result {
            Ok(built) => {
                self.built = Some(built);
                Event::BuildOk { id }
            }
            Err(err) => Event::BuildFail { id, err },
        };
        self.apply(event).await;
    }

    /// Reduce an event whose effects may need to await a cancelled build.
    async fn dispatch(&mut self, event: Event, builds: &mut mpsc::Receiver<BuildResult>) {
        let (next, effects) = reduce(&self.state, event);
        self.state = next;

        for effect in effects {
            if let Effect::CancelBuild { id } = effect {
                self.cancel_build(id, builds).await;
            } else {
                self.run_effect(effect).await;
            }
        }
        self.release_unpublished().await;
    }

    async fn apply(&mut self, event: Event) {
        let (next, effects) = reduce(&self.state, event);
        self.state = next;

        for effect in effects {
            self.run_effect(effect).await;
        }
        self.release_unpublished().await;
    }

    async fn release_unpublished(&mut self) {
        if let Some((resources, _)) = self.built.take() {
            release(resources).await;
        }
    }

    /// Cancel the in-flight build and wait until it has released what it built.
    async fn cancel_build(&mut self, id: Uuid, builds: &mut mpsc::Receiver<BuildResult>) {
        let Some(build) = self.build.take() else {
            return;
        };
        log::info!("Pipeline: cancelling build {}", id);
        build.cancel.cancel();
        if let Err(e) = build.task.await {
            log::warn!("Pipeline: build task ended abnormally: {}", e);
        }
        // The build may have finished before noticing the cancel
        while let Ok(result) = builds.try_recv() {
            self.handle_build_result(result).await;
        }
    }

    async fn run_effect(&mut self, effect: Effect) {
        match effect {
            Effect::StartBuild { id } => self.start_build(id),
            Effect::CancelBuild { id } => {
                if let Some(build) = self.build.take() {
                    log::info!("Pipeline: cancelling build {}", id);
                    build.cancel.cancel();
                }
            }
            Effect::QueueWaiter => {
                if let Some(reply) = self.requester.take() {
                    self.waiters.push(reply);
                }
            }
            Effect::ReplyReady => {
                if let (Some(reply), Some((_, handle))) = (self.requester.take(), self.active.as_ref()) {
                    let _ = reply.send(Ok(Arc::clone(handle)));
                }
            }
            Effect::Publish { id } => {
                let Some((resources, handle)) = self.built.take() else {
                    log::error!("Pipeline: publish {} without a finished build", id);
                    return;
                };
                resources.set_volume(self.volume);
                self.handle_tx.send_replace(Some(Arc::clone(&handle)));
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Ok(Arc::clone(&handle)));
                }
                self.active = Some((resources, handle));
                log::info!("Pipeline: {} active", id);
            }
            Effect::FailWaiters { err } => {
                log::warn!("Pipeline: setup failed: {}", err);
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
            Effect::DiscardBuild { id } => {
                log::info!("Pipeline: discarding stale build {}", id);
                self.release_unpublished().await;
            }
            Effect::Teardown { id } => {
                log::info!("Pipeline: shutting down {}", id);
                // Observers see None only after everything is released
                if let Some((resources, _)) = self.active.take() {
                    release(resources).await;
                }
                self.handle_tx.send_replace(None);
            }
        }
    }

    fn start_build(&mut self, id: Uuid) {
        let Some(mic) = self.pending_mic.take() else {
            log::error!("Pipeline: build {} requested without a mic source", id);
            return;
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let settings = self.settings.clone();
        let deps = self.deps.clone();
        let on_chunk = self.on_chunk.clone();
        let volume = self.volume;
        let results = self.build_tx.clone();

        log::info!("Pipeline: building {}", id);

        let task = tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => Err(PipelineError::Cancelled),
                built = build_pipeline(id, &settings, &deps, mic, on_chunk, volume) => built,
            };
            let _ = results.send(BuildResult { id, result }).await;
        });

        self.build = Some(InFlightBuild { id, cancel, task });
    }
}

/// Construct and start every stage, in dependency order. Any error drops
/// what was built so far.
async fn build_pipeline(
    id: Uuid,
    settings: &AudioSettings,
    deps: &PipelineDeps,
    mic: Arc<dyn MicSource>,
    on_chunk: mpsc::Sender<EncodedChunk>,
    volume: f32,
) -> Result<(PipelineResources, Arc<PipelineHandle>), PipelineError> {
    let stats = Arc::new(PipelineStats::new());
    let mut context = PlaybackContext::new(deps.backend.as_ref())?;
    let sample_rate = context.sample_rate();

    // Worklet bridge
    let options = UnitOptions {
        sample_rate,
        initial_buffer_ms: settings.jitter_initial_buffer_ms,
        max_buffer_ms: settings.jitter_max_buffer_ms,
        stats: Arc::clone(&stats),
    };
    let node = acquire_worklet_node(
        &mut context,
        deps.unit_loader.as_ref(),
        &settings.worklet_unit,
        &options,
        &settings.asset_root,
        Duration::from_millis(settings.unit_load_timeout_ms),
    )
    .await?;

    // Capture source. Opening a device waits on its stream thread.
    let stream = tokio::task::spawn_blocking(move || mic.open())
        .await
        .map_err(|e| PipelineError::CaptureUnavailable(format!("mic open task failed: {}", e)))??;
    let (mic_rate, mic_blocks, mic_guard) = stream.into_parts();
    log::info!("Pipeline: mic at {} Hz, context at {} Hz", mic_rate, sample_rate);

    // Analysers, mix destination, gain
    let (graph, renderer) = build_playback_graph(
        &context,
        node,
        &GraphSettings {
            fft_size: settings.fft_size,
            initial_gain: volume,
            volume_time_constant: settings.volume_time_constant_secs,
        },
    )?;
    let backend = Arc::clone(&deps.backend);
    let output = tokio::task::spawn_blocking(move || backend.open_output(renderer))
        .await
        .map_err(|e| PipelineError::Device(format!("output open task failed: {}", e)))??;
    context.attach_output(output)?;

    // Decode worker
    let (mic_duration_tx, mic_duration_rx) = watch::channel(0.0f64);
    let decoder = DecodeWorker::spawn(
        settings.codec.decoder()?,
        DecoderConfig::new(sample_rate, settings.decoder_resample_quality),
        graph.worklet_port().clone(),
        mic_duration_rx.clone(),
        Arc::clone(&stats),
    )
    .await?;

    // Encoder
    let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CAPACITY);
    let recorder = StreamingRecorder::spawn(
        RecorderConfig {
            codec: settings.codec,
            input_sample_rate: mic_rate,
            resample_quality: settings.encoder_resample_quality,
        },
        context.subscribe_state(),
        chunk_tx,
    )
    .await?;

    let feed = recorder.feed().ok_or(PipelineError::ContextClosed)?;
    let tap_resampler = if mic_rate == sample_rate {
        None
    } else {
        Some(StreamingResampler::new(mic_rate, sample_rate, TAP_RESAMPLE_QUALITY)?)
    };

    context.resume().await?;

    let tasks = vec![
        tokio::spawn(fan_out_mic(mic_blocks, feed, graph.capture_tap(), tap_resampler)),
        tokio::spawn(forward_chunks(
            chunk_rx,
            mic_duration_tx,
            on_chunk,
            Arc::clone(&stats),
        )),
    ];
    let mut resources = PipelineResources {
        id,
        context,
        recorder,
        decoder,
        graph,
        tasks,
        _mic_guard: mic_guard,
    };

    let handle = Arc::new(PipelineHandle {
        id,
        sample_rate,
        input_analyser: resources.graph.input_analyser().clone(),
        output_analyser: resources.graph.output_analyser().clone(),
        mix: resources.graph.mix().clone(),
        gain: resources.graph.gain().clone(),
        decoder: resources.decoder.input(),
        clock: resources.graph.clock().clone(),
        playout: Arc::clone(resources.graph.playout()),
        mic_duration: mic_duration_rx,
        stats,
    });

    resources.recorder.start()?;

    Ok((resources, handle))
}

/// Copy each mic block to the encoder and, at the context rate, to the graph.
async fn fan_out_mic(
    mut blocks: mpsc::Receiver<Vec<f32>>,
    encoder: mpsc::Sender<Vec<f32>>,
    graph_tap: mpsc::Sender<Vec<f32>>,
    mut resampler: Option<StreamingResampler>,
) {
    while let Some(block) = blocks.recv().await {
        let tap_block = match resampler.as_mut() {
            Some(resampler) => match resampler.process(&block) {
                Ok(resampled) => resampled,
                Err(e) => {
                    log::warn!("Pipeline: mic tap resample failed: {}", e);
                    Vec::new()
                }
            },
            None => block.clone(),
        };
        if !tap_block.is_empty() && graph_tap.try_send(tap_block).is_err() {
            log::trace!("Pipeline: graph tap full, mic block dropped");
        }

        if let Err(e) = encoder.try_send(block) {
            if matches!(e, mpsc::error::TrySendError::Closed(_)) {
                break;
            }
            log::trace!("Pipeline: encoder behind, mic block dropped");
        }
    }
    log::debug!("Pipeline: mic fan-out stopped");
}

/// Publish each chunk's mic duration, then hand the chunk to the transport.
async fn forward_chunks(
    mut chunks: mpsc::Receiver<EncodedChunk>,
    mic_duration: watch::Sender<f64>,
    on_chunk: mpsc::Sender<EncodedChunk>,
    stats: Arc<PipelineStats>,
) {
    while let Some(chunk) = chunks.recv().await {
        mic_duration.send_replace(chunk.mic_duration());
        let count = stats.record_chunk_encoded();
        if count % PROGRESS_LOG_INTERVAL == 0 {
            log::info!(
                "Pipeline: {} chunks encoded ({:.1}s of audio)",
                count,
                chunk.mic_duration()
            );
        }
        if on_chunk.send(chunk).await.is_err() {
            log::debug!("Pipeline: chunk consumer gone");
            break;
        }
    }
}
