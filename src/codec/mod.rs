//! Codec capability interfaces
//!
//! The capture encoder and decode worker only see `EncodeEngine` and
//! `DecodeEngine`, so any conforming implementation can be substituted.
//! Opus is the production codec; PCM16 is a raw fallback for local
//! development and tests.

#[cfg(feature = "opus-codec")]
mod opus;

use serde::{Deserialize, Serialize};

use crate::decode::DecoderConfig;
use crate::error::{DecodeFault, PipelineError};

/// Encodes one fixed-size mono frame at a time.
pub trait EncodeEngine: Send {
    /// Encode exactly one frame of samples in [-1.0, 1.0].
    fn encode(&mut self, frame: &[f32]) -> Result<Vec<u8>, PipelineError>;
}

/// Decodes inbound packets back to mono samples at the encoded rate.
pub trait DecodeEngine: Send {
    /// Configure the engine. Called once, before the first `decode`.
    fn init(&mut self, config: &DecoderConfig) -> Result<(), PipelineError>;

    /// Decode one packet. An empty result means the packet carried no audio.
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>, DecodeFault>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Opus,
    Pcm16,
}

impl CodecKind {
    pub fn encoder(
        self,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Box<dyn EncodeEngine>, PipelineError> {
        match self {
            CodecKind::Opus => opus_encoder(sample_rate, channels),
            CodecKind::Pcm16 => Ok(Box::new(Pcm16Encoder)),
        }
    }

    pub fn decoder(self) -> Result<Box<dyn DecodeEngine>, PipelineError> {
        match self {
            CodecKind::Opus => opus_decoder(),
            CodecKind::Pcm16 => Ok(Box::new(Pcm16Decoder::default())),
        }
    }
}

#[cfg(feature = "opus-codec")]
fn opus_encoder(sample_rate: u32, channels: u16) -> Result<Box<dyn EncodeEngine>, PipelineError> {
    Ok(Box::new(opus::OpusEncodeEngine::new(sample_rate, channels)?))
}

#[cfg(not(feature = "opus-codec"))]
fn opus_encoder(_sample_rate: u32, _channels: u16) -> Result<Box<dyn EncodeEngine>, PipelineError> {
    Err(PipelineError::Codec(
        "built without the opus-codec feature".to_string(),
    ))
}

#[cfg(feature = "opus-codec")]
fn opus_decoder() -> Result<Box<dyn DecodeEngine>, PipelineError> {
    Ok(Box::new(opus::OpusDecodeEngine::default()))
}

#[cfg(not(feature = "opus-codec"))]
fn opus_decoder() -> Result<Box<dyn DecodeEngine>, PipelineError> {
    Err(PipelineError::Codec(
        "built without the opus-codec feature".to_string(),
    ))
}

/// Little-endian signed 16-bit PCM.
pub struct Pcm16Encoder;

impl EncodeEngine for Pcm16Encoder {
    fn encode(&mut self, frame: &[f32]) -> Result<Vec<u8>, PipelineError> {
        let mut out = Vec::with_capacity(frame.len() * 2);
        for &sample in frame {
            out.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
        }
        Ok(out)
    }
}

#[derive(Default)]
pub struct Pcm16Decoder {
    initialized: bool,
}

impl DecodeEngine for Pcm16Decoder {
    fn init(&mut self, _config: &DecoderConfig) -> Result<(), PipelineError> {
        self.initialized = true;
        Ok(())
    }

    fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>, DecodeFault> {
        if !self.initialized {
            return Err(DecodeFault("decoder not initialized".to_string()));
        }
        if packet.len() % 2 != 0 {
            return Err(DecodeFault(format!(
                "PCM16 packet has odd length {}",
                packet.len()
            )));
        }
        Ok(packet
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
            .collect())
    }
}

/// Convert a float sample to i16, clamping to [-1.0, 1.0].
pub(crate) fn sample_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}
