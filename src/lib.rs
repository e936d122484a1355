//! Full-duplex voice pipeline.
//!
//! Microphone audio is encoded in 20 ms frames and handed to a transport;
//! encoded audio coming back is decoded off the async runtime and played
//! through a small audio graph with metering and volume control.
//! `PipelineController` is the entry point for building and releasing it.

pub mod audio;
pub mod capture;
pub mod codec;
pub mod decode;
pub mod error;
pub mod graph;
pub mod pipeline;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod stats;
pub mod transport;

pub use capture::EncodedChunk;
pub use codec::CodecKind;
pub use decode::DecoderInput;
pub use error::{DecodeFault, PipelineError, RegistrationError, SettingsError, TransportError};
pub use graph::context::ContextState;
pub use pipeline::{PipelineController, PipelineDeps, PipelineHandle};
pub use session::{HttpComputePool, RegistrationOutcome, SessionBroker};
pub use settings::{AppSettings, AudioSettings, SessionSettings};
pub use state_machine::PipelineState;
pub use stats::StatsSnapshot;
pub use transport::RealtimeTransport;

/// Install `env_logger` with an `info` default (overridable via `RUST_LOG`).
///
/// Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
