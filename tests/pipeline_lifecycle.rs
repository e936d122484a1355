//! Integration tests for the pipeline controller
//!
//! Every test runs headless: output goes to an `OfflineBackend` rendered by
//! hand, the microphone is a channel, and the wire codec is PCM16 so packets
//! can be built and checked directly.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test pipeline_lifecycle
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use duplex_voice::audio::{MicSource, MicStream, MixRecorder};
use duplex_voice::codec::{EncodeEngine, Pcm16Encoder};
use duplex_voice::graph::bridge::{BuiltinUnitLoader, UnitLoader, UnitModule};
use duplex_voice::graph::context::OfflineBackend;
use duplex_voice::{
    AudioSettings, CodecKind, ContextState, EncodedChunk, PipelineController, PipelineDeps,
    PipelineError, PipelineState,
};

const RATE: u32 = 24000;

// ============================================================================
// Fakes
// ============================================================================

/// Microphone fed from a channel. Can be opened once.
struct ChannelMic {
    blocks: Mutex<Option<mpsc::Receiver<Vec<f32>>>>,
    opened: AtomicUsize,
}

impl ChannelMic {
    fn new() -> (Arc<Self>, mpsc::Sender<Vec<f32>>) {
        let (tx, rx) = mpsc::channel(64);
        let mic = Arc::new(Self {
            blocks: Mutex::new(Some(rx)),
            opened: AtomicUsize::new(0),
        });
        (mic, tx)
    }
}

impl MicSource for ChannelMic {
    fn open(&self) -> Result<MicStream, PipelineError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let rx = self
            .blocks
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| PipelineError::CaptureUnavailable("already open".to_string()))?;
        Ok(MicStream::new(RATE, rx))
    }
}

/// Microphone whose permission was denied.
struct DeniedMic;

impl MicSource for DeniedMic {
    fn open(&self) -> Result<MicStream, PipelineError> {
        Err(PipelineError::CaptureUnavailable("permission denied".to_string()))
    }
}

/// Microphone whose device takes a while to come up.
struct SlowMic {
    delay: Duration,
    opened: AtomicUsize,
}

impl MicSource for SlowMic {
    fn open(&self) -> Result<MicStream, PipelineError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let (_tx, rx) = mpsc::channel(1);
        Ok(MicStream::new(RATE, rx))
    }
}

/// Built-in loader that counts loads and can be slowed down.
struct CountingLoader {
    loads: AtomicUsize,
    delay: Duration,
}

impl CountingLoader {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            delay,
        })
    }

    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl UnitLoader for CountingLoader {
    fn load_module<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<UnitModule, PipelineError>> {
        Box::pin(async move {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            BuiltinUnitLoader.load_module(path).await
        })
    }
}

struct Harness {
    controller: PipelineController,
    backend: OfflineBackend,
    loader: Arc<CountingLoader>,
    chunks: mpsc::Receiver<EncodedChunk>,
}

fn settings() -> AudioSettings {
    AudioSettings {
        codec: CodecKind::Pcm16,
        jitter_initial_buffer_ms: 0,
        ..AudioSettings::default()
    }
}

fn harness_with(settings: AudioSettings, load_delay: Duration) -> Harness {
    let backend = OfflineBackend::new(RATE);
    let loader = CountingLoader::new(load_delay);
    let (chunk_tx, chunks) = mpsc::channel(64);
    let deps = PipelineDeps {
        backend: Arc::new(backend.clone()),
        unit_loader: loader.clone(),
    };
    Harness {
        controller: PipelineController::spawn(settings, deps, chunk_tx),
        backend,
        loader,
        chunks,
    }
}

fn harness() -> Harness {
    harness_with(settings(), Duration::ZERO)
}

fn pcm_packet(value: f32, samples: usize) -> Vec<u8> {
    Pcm16Encoder.encode(&vec![value; samples]).unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Record every value the controller publishes.
fn record_publications(
    controller: &PipelineController,
) -> (Arc<Mutex<Vec<bool>>>, tokio::task::JoinHandle<()>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut rx = controller.subscribe();
    let log = Arc::clone(&seen);
    let task = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let active = rx.borrow_and_update().is_some();
            log.lock().unwrap().push(active);
        }
    });
    (seen, task)
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn setup_then_shutdown_publishes_once_each() {
    let h = harness();
    let (seen, monitor) = record_publications(&h.controller);
    let (mic, _mic_tx) = ChannelMic::new();

    assert_eq!(h.controller.state(), PipelineState::Uninitialized);
    let handle = h.controller.setup(mic).await.unwrap();

    assert_eq!(h.controller.state(), PipelineState::Active);
    assert_eq!(handle.sample_rate(), RATE);
    assert_eq!(handle.context_state(), ContextState::Running);
    assert!(h.backend.is_attached());
    assert!(Arc::ptr_eq(&handle, &h.controller.current().unwrap()));
    wait_until(|| seen.lock().unwrap().len() == 1).await;

    h.controller.shutdown().await;

    assert_eq!(h.controller.state(), PipelineState::Uninitialized);
    assert!(h.controller.current().is_none());
    assert_eq!(handle.context_state(), ContextState::Closed);
    assert!(!h.backend.is_attached());

    wait_until(|| seen.lock().unwrap().len() == 2).await;
    assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    monitor.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn capture_failure_never_publishes() {
    let h = harness();
    let (seen, monitor) = record_publications(&h.controller);

    let err = h.controller.setup(Arc::new(DeniedMic)).await.unwrap_err();
    assert!(matches!(err, PipelineError::CaptureUnavailable(_)));
    assert!(h.controller.current().is_none());
    // Output is opened after the mic
    assert_eq!(h.backend.outputs_opened(), 0);

    // The controller is back to idle and can build again
    let (mic, _mic_tx) = ChannelMic::new();
    h.controller.setup(mic).await.unwrap();
    wait_until(|| !seen.lock().unwrap().is_empty()).await;
    assert_eq!(*seen.lock().unwrap(), vec![true]);
    monitor.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn device_failure_releases_partial_build() {
    let h = harness();
    h.backend.fail_next_open();
    let (mic, _mic_tx) = ChannelMic::new();

    let err = h.controller.setup(mic).await.unwrap_err();
    assert!(matches!(err, PipelineError::Device(_)));
    assert!(h.controller.current().is_none());
    assert!(!h.backend.is_attached());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_unit_fails_with_unit_load() {
    let h = harness_with(
        AudioSettings {
            worklet_unit: "missing-processor".to_string(),
            ..settings()
        },
        Duration::ZERO,
    );
    let (mic, _mic_tx) = ChannelMic::new();

    let err = h.controller.setup(mic.clone()).await.unwrap_err();
    assert!(matches!(err, PipelineError::UnitLoad { .. }));
    assert_eq!(mic.opened.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_setup_builds_one_pipeline() {
    let h = harness_with(settings(), Duration::from_millis(50));
    let (mic, _mic_tx) = ChannelMic::new();

    let (a, b) = tokio::join!(h.controller.setup(mic.clone()), h.controller.setup(mic.clone()));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));

    let c = h.controller.setup(mic.clone()).await.unwrap();
    assert!(Arc::ptr_eq(&a, &c));

    assert_eq!(mic.opened.load(Ordering::SeqCst), 1);
    assert_eq!(h.backend.outputs_opened(), 1);
    assert_eq!(h.loader.loads(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_is_idempotent() {
    let h = harness();

    // Nothing to release yet
    h.controller.shutdown().await;

    let (mic, _mic_tx) = ChannelMic::new();
    let handle = h.controller.setup(mic).await.unwrap();
    h.controller.shutdown().await;
    h.controller.shutdown().await;

    assert!(h.controller.current().is_none());
    assert!(handle.decoder().send(pcm_packet(0.1, 960)).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_during_setup_cancels_build() {
    let h = harness_with(settings(), Duration::from_millis(300));
    let (seen, monitor) = record_publications(&h.controller);
    let (mic, _mic_tx) = ChannelMic::new();

    let controller = h.controller.clone();
    let setup = tokio::spawn(async move { controller.setup(mic).await });

    wait_until(|| h.loader.loads() == 1).await;
    h.controller.shutdown().await;

    let err = setup.await.unwrap().unwrap_err();
    assert_eq!(err, PipelineError::Cancelled);
    assert!(h.controller.current().is_none());
    assert_eq!(h.controller.state(), PipelineState::Uninitialized);
    assert_eq!(h.backend.outputs_opened(), 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(seen.lock().unwrap().is_empty());
    monitor.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_interrupts_slow_mic_open() {
    let h = harness();
    let mic = Arc::new(SlowMic {
        delay: Duration::from_millis(800),
        opened: AtomicUsize::new(0),
    });

    let controller = h.controller.clone();
    let slow = Arc::clone(&mic);
    let setup = tokio::spawn(async move { controller.setup(slow).await });

    wait_until(|| mic.opened.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = std::time::Instant::now();
    h.controller.shutdown().await;
    let err = setup.await.unwrap().unwrap_err();

    assert!(
        started.elapsed() < Duration::from_millis(400),
        "shutdown waited {:?} for the mic",
        started.elapsed()
    );
    assert_eq!(err, PipelineError::Cancelled);
    assert!(h.controller.current().is_none());
    assert_eq!(h.backend.outputs_opened(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn setup_shutdown_race_leaves_nothing_behind() {
    let h = harness_with(settings(), Duration::from_millis(2));
    let (seen, monitor) = record_publications(&h.controller);

    for (round, delay_us) in (0..=2000u64).step_by(250).enumerate() {
        let (mic, _mic_tx) = ChannelMic::new();
        let controller = h.controller.clone();
        let setup = tokio::spawn(async move { controller.setup(mic).await });

        // The build has started; shut down somewhere around its finish
        while h.loader.loads() <= round {
            tokio::task::yield_now().await;
        }
        if delay_us > 0 {
            tokio::time::sleep(Duration::from_micros(delay_us)).await;
        }
        h.controller.shutdown().await;

        match setup.await.unwrap() {
            Ok(_) | Err(PipelineError::Cancelled) => {}
            Err(e) => panic!("round {}: unexpected setup error {:?}", round, e),
        }
        assert!(h.controller.current().is_none(), "round {}: pipeline left live", round);
        assert!(!h.backend.is_attached(), "round {}: output left attached", round);
        assert_eq!(h.controller.state(), PipelineState::Uninitialized);
        wait_until(|| seen.lock().unwrap().last() != Some(&true)).await;
    }

    monitor.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recording_failure_still_releases_pipeline() {
    let h = harness();
    let (mic, _mic_tx) = ChannelMic::new();
    let handle = h.controller.setup(mic).await.unwrap();

    // A regular file where the recordings directory should be
    let blocker = tempfile::NamedTempFile::new().unwrap();
    let path = blocker.path().join("mix.wav");
    assert!(MixRecorder::start(handle.mix(), &path).is_err());

    h.controller.shutdown().await;
    assert!(h.controller.current().is_none());
    assert!(!h.backend.is_attached());
    assert_eq!(handle.context_state(), ContextState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_controller_releases_pipeline() {
    let h = harness();
    let (mic, _mic_tx) = ChannelMic::new();
    let handle = h.controller.setup(mic).await.unwrap();

    let backend = h.backend.clone();
    drop(h);

    wait_until(|| !backend.is_attached()).await;
    wait_until(|| handle.context_state() == ContextState::Closed).await;
}

// ============================================================================
// Audio paths
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mic_audio_reaches_transport_in_order() {
    let mut h = harness();
    let (mic, mic_tx) = ChannelMic::new();
    let handle = h.controller.setup(mic).await.unwrap();

    // 10 ms blocks: six of them make three 20 ms frames
    for _ in 0..6 {
        mic_tx.send(vec![0.25; 240]).await.unwrap();
    }

    let mut durations = Vec::new();
    for _ in 0..3 {
        let chunk = tokio::time::timeout(Duration::from_secs(5), h.chunks.recv())
            .await
            .unwrap()
            .unwrap();
        // PCM16: two bytes per sample
        assert_eq!(chunk.data().len(), 960);
        durations.push(chunk.mic_duration());
    }

    let expected = [0.02, 0.04, 0.06];
    for (got, want) in durations.iter().zip(expected) {
        assert!((got - want).abs() < 1e-9, "{} != {}", got, want);
    }
    wait_until(|| (handle.mic_duration() - 0.06).abs() < 1e-9).await;
    assert_eq!(handle.stats().chunks_encoded, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn decoded_audio_plays_and_volume_ramps() {
    let h = harness();
    let (mic, _mic_tx) = ChannelMic::new();
    let handle = h.controller.setup(mic).await.unwrap();

    for _ in 0..5 {
        handle.decoder().send(pcm_packet(0.5, 960)).await.unwrap();
    }
    wait_until(|| handle.stats().frames_forwarded == 5).await;

    let loud = h.backend.render(960);
    assert!((loud[480] - 0.5).abs() < 1e-3);
    assert!(handle.output_analyser().level() > 0.0);

    h.controller.set_volume(0.0).await.unwrap();
    assert_eq!(handle.volume(), 1.0);

    // 60 ms at a 10 ms time constant
    let quiet = h.backend.render(1440);
    assert!(quiet[0] > 0.4, "ramp starts from the current gain");
    assert!(quiet[1439].abs() < 0.01);
    assert!(quiet.windows(2).all(|w| w[1] <= w[0] + 1e-6));
    assert!(handle.volume() < 0.01);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_frame_does_not_stop_playback() {
    let h = harness();
    let (mic, _mic_tx) = ChannelMic::new();
    let handle = h.controller.setup(mic).await.unwrap();

    handle.decoder().send(vec![1, 2, 3]).await.unwrap();
    handle.decoder().send(pcm_packet(0.3, 960)).await.unwrap();

    wait_until(|| handle.stats().frames_forwarded == 1).await;
    assert_eq!(handle.stats().decode_faults, 1);
    assert_eq!(h.controller.state(), PipelineState::Active);

    let out = h.backend.render(960);
    assert!((out[100] - 0.3).abs() < 1e-3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_volume_is_rejected() {
    let h = harness();
    let err = h.controller.set_volume(f32::NAN).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidVolume(_)));

    // Out of range is clamped, not rejected
    h.controller.set_volume(3.0).await.unwrap();
}
