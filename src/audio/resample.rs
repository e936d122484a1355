//! Streaming sample-rate conversion
//!
//! Wraps rubato's fixed-input resamplers so callers can push blocks of any
//! length. Input is accumulated until a full resampler chunk is available;
//! the remainder waits for the next push.

use rubato::{
    FastFixedIn, PolynomialDegree, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
    VecResampler, WindowFunction,
};

use crate::error::PipelineError;

/// Highest accepted quality level.
pub const MAX_QUALITY: u8 = 10;

/// Mono resampler for continuous streams.
pub struct StreamingResampler {
    /// `None` when both rates match
    engine: Option<Box<dyn VecResampler<f32>>>,
    pending: Vec<f32>,
    input_rate: u32,
    output_rate: u32,
}

impl StreamingResampler {
    /// Create a resampler from `input_rate` to `output_rate`.
    ///
    /// `quality` follows the 0..=10 scale: 0-6 select polynomial
    /// interpolation of rising degree, 7-10 select windowed sinc with a
    /// growing kernel. Values above 10 are treated as 10.
    pub fn new(input_rate: u32, output_rate: u32, quality: u8) -> Result<Self, PipelineError> {
        if input_rate == 0 || output_rate == 0 {
            return Err(PipelineError::Resample(format!(
                "invalid sample rate ({} -> {})",
                input_rate, output_rate
            )));
        }

        let quality = quality.min(MAX_QUALITY);
        // 10 ms of input per resampler pass
        let chunk_size = (input_rate as usize / 100).max(1);
        let ratio = output_rate as f64 / input_rate as f64;

        let engine: Option<Box<dyn VecResampler<f32>>> = if input_rate == output_rate {
            None
        } else if quality <= 6 {
            let degree = match quality {
                0..=2 => PolynomialDegree::Linear,
                3..=4 => PolynomialDegree::Cubic,
                _ => PolynomialDegree::Septic,
            };
            let resampler = FastFixedIn::<f32>::new(ratio, 1.0, degree, chunk_size, 1)
                .map_err(|e| PipelineError::Resample(e.to_string()))?;
            Some(Box::new(resampler))
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 32 * (quality as usize - 6),
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 128,
                window: WindowFunction::BlackmanHarris2,
            };
            let resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, chunk_size, 1)
                .map_err(|e| PipelineError::Resample(e.to_string()))?;
            Some(Box::new(resampler))
        };

        log::debug!(
            "Resampler: {} Hz -> {} Hz (quality {})",
            input_rate,
            output_rate,
            quality
        );

        Ok(Self {
            engine,
            pending: Vec::with_capacity(chunk_size * 2),
            input_rate,
            output_rate,
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Push a block of input, returning whatever output is ready.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>, PipelineError> {
        let Some(engine) = self.engine.as_mut() else {
            return Ok(input.to_vec());
        };

        self.pending.extend_from_slice(input);
        let mut output = Vec::new();

        loop {
            let needed = engine.input_frames_next();
            if self.pending.len() < needed {
                break;
            }

            let block = vec![self.pending.drain(..needed).collect::<Vec<f32>>()];
            let result = engine
                .process(&block, None)
                .map_err(|e| PipelineError::Resample(e.to_string()))?;

            if let Some(channel) = result.into_iter().next() {
                output.extend(channel);
            }
        }

        Ok(output)
    }

    /// Samples waiting for a full resampler chunk.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
