//! Opus engines backed by libopus

use opus::{Application, Channels, Decoder, Encoder};

use super::{DecodeEngine, EncodeEngine};
use crate::decode::DecoderConfig;
use crate::error::{DecodeFault, PipelineError};

/// Largest packet libopus will produce for a single frame.
const MAX_PACKET_BYTES: usize = 4000;

/// 120 ms, the longest Opus frame, at 48 kHz.
const MAX_FRAME_SAMPLES: usize = 5760;

fn channels_for(count: u16) -> Result<Channels, PipelineError> {
    match count {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        n => Err(PipelineError::Codec(format!("unsupported channel count {}", n))),
    }
}

pub struct OpusEncodeEngine {
    encoder: Encoder,
    packet: Vec<u8>,
}

impl OpusEncodeEngine {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, PipelineError> {
        let encoder = Encoder::new(sample_rate, channels_for(channels)?, Application::Audio)
            .map_err(|e| PipelineError::Codec(format!("Failed to create Opus encoder: {}", e)))?;

        log::debug!("Opus encoder: {} Hz, {} channel(s)", sample_rate, channels);

        Ok(Self {
            encoder,
            packet: vec![0u8; MAX_PACKET_BYTES],
        })
    }
}

impl EncodeEngine for OpusEncodeEngine {
    fn encode(&mut self, frame: &[f32]) -> Result<Vec<u8>, PipelineError> {
        let len = self
            .encoder
            .encode_float(frame, &mut self.packet)
            .map_err(|e| PipelineError::Codec(format!("Opus encode failed: {}", e)))?;
        Ok(self.packet[..len].to_vec())
    }
}

#[derive(Default)]
pub struct OpusDecodeEngine {
    decoder: Option<Decoder>,
    pcm: Vec<f32>,
}

impl DecodeEngine for OpusDecodeEngine {
    fn init(&mut self, config: &DecoderConfig) -> Result<(), PipelineError> {
        let decoder = Decoder::new(config.decoder_sample_rate, Channels::Mono)
            .map_err(|e| PipelineError::Codec(format!("Failed to create Opus decoder: {}", e)))?;
        self.decoder = Some(decoder);
        self.pcm = vec![0.0; MAX_FRAME_SAMPLES];
        Ok(())
    }

    fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>, DecodeFault> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| DecodeFault("decoder not initialized".to_string()))?;

        if packet.is_empty() {
            return Ok(Vec::new());
        }

        let samples = decoder
            .decode_float(packet, &mut self.pcm, false)
            .map_err(|e| DecodeFault(e.to_string()))?;
        Ok(self.pcm[..samples].to_vec())
    }
}
