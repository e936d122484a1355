//! Audio I/O helpers
//!
//! Microphone capture (cpal), streaming sample-rate conversion (rubato) and
//! WAV recording of the mix (hound).

pub mod mic;
pub mod resample;
pub mod wav;

pub use mic::{CpalMicSource, MicSource, MicStream};
pub use resample::StreamingResampler;
pub use wav::{MixRecorder, RecordingSummary};
