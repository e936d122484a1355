//! Error types for the duplex voice pipeline
//!
//! Construction failures (`PipelineError`) abort `setup` as a whole.
//! Per-frame decode failures (`DecodeFault`) are dropped by the decode worker
//! and never reach the controller.

use thiserror::Error;

/// Errors raised while building, driving, or tearing down the pipeline.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// Worklet unit could not be instantiated, even after loading its module.
    #[error("Failed to load audio unit '{unit}': {reason}")]
    UnitLoad { unit: String, reason: String },

    /// Microphone permission denied or device absent.
    #[error("Microphone unavailable: {0}")]
    CaptureUnavailable(String),

    /// Output device could not be opened or started.
    #[error("Audio device error: {0}")]
    Device(String),

    /// Encoder or decoder engine could not be created.
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Resampler error: {0}")]
    Resample(String),

    /// Operation attempted on a closed playback context.
    #[error("Audio context is closed")]
    ContextClosed,

    /// Setup was interrupted by a shutdown.
    #[error("Pipeline setup cancelled")]
    Cancelled,

    /// A setting is outside the range the pipeline accepts.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid volume level: {0}")]
    InvalidVolume(f32),

    /// The controller task has exited.
    #[error("Pipeline controller is no longer running")]
    ControllerGone,
}

/// A single inbound frame could not be decoded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Malformed audio frame: {0}")]
pub struct DecodeFault(pub String);

/// Errors from the session registration collaborator.
///
/// These never propagate into the audio pipeline; `SessionBroker` folds them
/// into a `success: false` outcome.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Pool request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Pool returned HTTP {0}")]
    Status(u16),

    #[error("Pool returned an unusable response: {0}")]
    InvalidResponse(String),
}

/// Errors from writing the mix recording.
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("Failed to write WAV file: {0}")]
    Wav(#[from] hound::Error),

    #[error("Recording I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Recording task failed: {0}")]
    Task(String),
}

/// Errors from persisting settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Settings I/O error at {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors from the WebSocket transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Failed to connect to realtime endpoint: {0}")]
    ConnectionFailed(String),

    #[error("Failed to send audio: {0}")]
    SendFailed(String),

    #[error("WebSocket disconnected: {0}")]
    Disconnected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_error_display() {
        let err = PipelineError::UnitLoad {
            unit: "audio-output-processor".to_string(),
            reason: "timeout".to_string(),
        };
        assert!(err.to_string().contains("audio-output-processor"));
        assert!(err.to_string().contains("timeout"));

        let err = PipelineError::CaptureUnavailable("permission denied".to_string());
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn test_decode_fault_display() {
        let fault = DecodeFault("odd length".to_string());
        assert_eq!(fault.to_string(), "Malformed audio frame: odd length");
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));
    }
}
