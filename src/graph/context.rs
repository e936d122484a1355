//! Playback context: clock, lifecycle and output attachment
//!
//! A context starts `Suspended`, becomes `Running` on `resume`, and ends
//! `Closed`. Once closed it cannot be resumed; a new pipeline builds a new
//! context.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::watch;

use super::bridge::UnitRegistry;
use super::GraphRenderer;
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Suspended,
    Running,
    Closed,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextState::Suspended => write!(f, "Suspended"),
            ContextState::Running => write!(f, "Running"),
            ContextState::Closed => write!(f, "Closed"),
        }
    }
}

impl ContextState {
    fn as_u8(self) -> u8 {
        match self {
            ContextState::Suspended => 0,
            ContextState::Running => 1,
            ContextState::Closed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ContextState::Suspended,
            1 => ContextState::Running,
            _ => ContextState::Closed,
        }
    }
}

/// State shared between the context and its render thread.
#[derive(Debug)]
pub(crate) struct ContextShared {
    state: AtomicU8,
    frames: AtomicU64,
    sample_rate: u32,
}

impl ContextShared {
    fn new(sample_rate: u32) -> Self {
        Self {
            state: AtomicU8::new(ContextState::Suspended.as_u8()),
            frames: AtomicU64::new(0),
            sample_rate,
        }
    }

    pub(crate) fn state(&self) -> ContextState {
        ContextState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ContextState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Advance the clock by one quantum; returns the quantum's first frame.
    pub(crate) fn advance(&self, frames: u64) -> u64 {
        self.frames.fetch_add(frames, Ordering::AcqRel)
    }

    pub(crate) fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.frames.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }
}

/// Cheap read-only view of a context's clock and state.
#[derive(Debug, Clone)]
pub struct ContextClock {
    shared: Arc<ContextShared>,
}

impl ContextClock {
    /// Seconds of audio rendered so far.
    pub fn current_time(&self) -> f64 {
        self.shared.current_time()
    }

    pub fn state(&self) -> ContextState {
        self.shared.state()
    }
}

/// Device output for a playback context.
pub trait AudioBackend: Send + Sync {
    /// Rate at which the context will render.
    fn output_sample_rate(&self) -> Result<u32, PipelineError>;

    /// Start pulling quanta from `renderer`. The stream stays paused until `play`.
    fn open_output(&self, renderer: GraphRenderer) -> Result<Box<dyn OutputStream>, PipelineError>;
}

pub trait OutputStream: Send {
    fn play(&mut self) -> BoxFuture<'_, Result<(), PipelineError>>;

    /// Stop the device. Must be safe to call more than once.
    fn close(&mut self);
}

pub struct PlaybackContext {
    shared: Arc<ContextShared>,
    state_tx: watch::Sender<ContextState>,
    registry: UnitRegistry,
    output: Option<Box<dyn OutputStream>>,
}

impl PlaybackContext {
    /// Create a suspended context at the backend's output rate.
    pub fn new(backend: &dyn AudioBackend) -> Result<Self, PipelineError> {
        let sample_rate = backend.output_sample_rate()?;
        if sample_rate == 0 {
            return Err(PipelineError::Device("output reports 0 Hz".to_string()));
        }
        let (state_tx, _) = watch::channel(ContextState::Suspended);

        log::debug!("PlaybackContext: created at {} Hz", sample_rate);

        Ok(Self {
            shared: Arc::new(ContextShared::new(sample_rate)),
            state_tx,
            registry: UnitRegistry::new(),
            output: None,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate()
    }

    pub fn state(&self) -> ContextState {
        self.shared.state()
    }

    pub fn current_time(&self) -> f64 {
        self.shared.current_time()
    }

    pub fn clock(&self) -> ContextClock {
        ContextClock {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ContextState> {
        self.state_tx.subscribe()
    }

    pub fn registry(&self) -> &UnitRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut UnitRegistry {
        &mut self.registry
    }

    pub(crate) fn shared(&self) -> Arc<ContextShared> {
        Arc::clone(&self.shared)
    }

    /// Attach the device stream that drives this context's renderer.
    pub fn attach_output(&mut self, output: Box<dyn OutputStream>) -> Result<(), PipelineError> {
        if self.state() == ContextState::Closed {
            let mut output = output;
            output.close();
            return Err(PipelineError::ContextClosed);
        }
        if let Some(mut previous) = self.output.replace(output) {
            previous.close();
        }
        Ok(())
    }

    pub async fn resume(&mut self) -> Result<(), PipelineError> {
        match self.state() {
            ContextState::Closed => return Err(PipelineError::ContextClosed),
            ContextState::Running => return Ok(()),
            ContextState::Suspended => {}
        }

        if let Some(output) = self.output.as_mut() {
            output.play().await?;
        }

        self.transition(ContextState::Running);
        Ok(())
    }

    /// Stop rendering and release the device. Idempotent.
    pub fn close(&mut self) {
        if self.state() == ContextState::Closed {
            return;
        }
        self.transition(ContextState::Closed);
        if let Some(mut output) = self.output.take() {
            output.close();
        }
        log::debug!(
            "PlaybackContext: closed after {:.2}s",
            self.shared.current_time()
        );
    }

    fn transition(&self, state: ContextState) {
        self.shared.set_state(state);
        self.state_tx.send_replace(state);
    }
}

impl Drop for PlaybackContext {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for PlaybackContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackContext")
            .field("sample_rate", &self.sample_rate())
            .field("state", &self.state())
            .finish()
    }
}

struct OfflineInner {
    sample_rate: u32,
    /// (output generation, renderer)
    renderer: Mutex<Option<(usize, GraphRenderer)>>,
    outputs_opened: AtomicUsize,
    fail_next_open: AtomicBool,
}

/// Backend without a device: quanta are rendered on demand by `render`.
///
/// Used for headless runs and tests.
#[derive(Clone)]
pub struct OfflineBackend {
    inner: Arc<OfflineInner>,
}

impl OfflineBackend {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(OfflineInner {
                sample_rate,
                renderer: Mutex::new(None),
                outputs_opened: AtomicUsize::new(0),
                fail_next_open: AtomicBool::new(false),
            }),
        }
    }

    /// Render `frames` samples from the attached graph, or silence if none.
    pub fn render(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames];
        let mut guard = self
            .inner
            .renderer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((_, renderer)) = guard.as_mut() {
            renderer.render(&mut out);
        }
        out
    }

    pub fn is_attached(&self) -> bool {
        self.inner
            .renderer
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Total outputs opened over the backend's lifetime.
    pub fn outputs_opened(&self) -> usize {
        self.inner.outputs_opened.load(Ordering::SeqCst)
    }

    /// Make the next `open_output` fail with a device error.
    pub fn fail_next_open(&self) {
        self.inner.fail_next_open.store(true, Ordering::SeqCst);
    }
}

impl AudioBackend for OfflineBackend {
    fn output_sample_rate(&self) -> Result<u32, PipelineError> {
        Ok(self.inner.sample_rate)
    }

    fn open_output(&self, renderer: GraphRenderer) -> Result<Box<dyn OutputStream>, PipelineError> {
        if self.inner.fail_next_open.swap(false, Ordering::SeqCst) {
            return Err(PipelineError::Device("offline output refused".to_string()));
        }

        let generation = self.inner.outputs_opened.fetch_add(1, Ordering::SeqCst) + 1;
        let mut guard = self
            .inner
            .renderer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some((generation, renderer));

        Ok(Box::new(OfflineStream {
            inner: Arc::clone(&self.inner),
            generation,
        }))
    }
}

struct OfflineStream {
    inner: Arc<OfflineInner>,
    generation: usize,
}

impl OutputStream for OfflineStream {
    fn play(&mut self) -> BoxFuture<'_, Result<(), PipelineError>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&mut self) {
        let mut guard = self
            .inner
            .renderer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if matches!(guard.as_ref(), Some((generation, _)) if *generation == self.generation) {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle() {
        let backend = OfflineBackend::new(48000);
        let mut ctx = PlaybackContext::new(&backend).unwrap();
        let mut states = ctx.subscribe_state();
        assert_eq!(ctx.state(), ContextState::Suspended);
        assert_eq!(ctx.sample_rate(), 48000);

        ctx.resume().await.unwrap();
        assert_eq!(ctx.state(), ContextState::Running);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ContextState::Running);

        ctx.close();
        assert_eq!(ctx.state(), ContextState::Closed);
        assert_eq!(ctx.resume().await, Err(PipelineError::ContextClosed));
    }

    #[test]
    fn test_close_is_idempotent() {
        let backend = OfflineBackend::new(16000);
        let mut ctx = PlaybackContext::new(&backend).unwrap();
        ctx.close();
        ctx.close();
        assert_eq!(ctx.state(), ContextState::Closed);
    }

    #[test]
    fn test_clock_starts_at_zero() {
        let backend = OfflineBackend::new(16000);
        let ctx = PlaybackContext::new(&backend).unwrap();
        assert_eq!(ctx.current_time(), 0.0);
        assert_eq!(ctx.clock().current_time(), 0.0);
    }

    #[test]
    fn test_offline_render_without_graph_is_silent() {
        let backend = OfflineBackend::new(48000);
        assert!(!backend.is_attached());
        assert_eq!(backend.render(128), vec![0.0; 128]);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ContextState::Running.to_string(), "Running");
        assert_eq!(ContextState::Closed.to_string(), "Closed");
    }
}
