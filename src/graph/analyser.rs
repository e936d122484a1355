//! Pass-through analysers for level metering and visualization
//!
//! The render thread pushes every quantum it sees; UI code reads the most
//! recent `fft_size` samples either as a waveform or as a smoothed
//! magnitude spectrum in decibels. Analysers never alter the signal.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::error::PipelineError;

/// Spectrum smoothing factor (weight of the previous frame)
const SMOOTHING_TIME_CONSTANT: f32 = 0.8;

/// Floor reported for silent bins
pub const MIN_DECIBELS: f32 = -100.0;

const MIN_FFT_SIZE: usize = 32;
const MAX_FFT_SIZE: usize = 32768;

struct AnalyserState {
    samples: VecDeque<f32>,
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
}

/// Shared handle to one analyser node.
#[derive(Clone)]
pub struct Analyser {
    state: Arc<Mutex<AnalyserState>>,
    fft_size: usize,
}

impl std::fmt::Debug for Analyser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analyser")
            .field("fft_size", &self.fft_size)
            .finish()
    }
}

impl Analyser {
    pub fn new(fft_size: usize) -> Result<Self, PipelineError> {
        if !fft_size.is_power_of_two() || !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&fft_size) {
            return Err(PipelineError::InvalidConfig(format!(
                "fft size {} must be a power of two in {}..={}",
                fft_size, MIN_FFT_SIZE, MAX_FFT_SIZE
            )));
        }

        let fft = FftPlanner::<f32>::new().plan_fft_forward(fft_size);

        Ok(Self {
            state: Arc::new(Mutex::new(AnalyserState {
                samples: VecDeque::from(vec![0.0; fft_size]),
                fft_size,
                fft,
                window: blackman_window(fft_size),
                smoothed: vec![0.0; fft_size / 2],
            })),
            fft_size,
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Feed samples from the render thread. Skips the update rather than
    /// blocking if a reader holds the lock.
    pub(crate) fn push(&self, samples: &[f32]) {
        let Ok(mut state) = self.state.try_lock() else {
            return;
        };
        let capacity = state.fft_size;

        if samples.len() >= capacity {
            state.samples.clear();
            state.samples.extend(&samples[samples.len() - capacity..]);
            return;
        }

        let overflow = (state.samples.len() + samples.len()).saturating_sub(capacity);
        if overflow > 0 {
            state.samples.drain(..overflow);
        }
        state.samples.extend(samples);
    }

    /// The most recent `fft_size` samples, oldest first.
    pub fn time_domain_data(&self) -> Vec<f32> {
        self.lock().samples.iter().copied().collect()
    }

    /// Smoothed magnitude spectrum in dB, `fft_size / 2` bins.
    pub fn frequency_data(&self) -> Vec<f32> {
        let mut state = self.lock();
        let AnalyserState {
            samples,
            fft_size,
            fft,
            window,
            smoothed,
        } = &mut *state;

        let mut buffer: Vec<Complex<f32>> = samples
            .iter()
            .zip(window.iter())
            .map(|(&s, &w)| Complex::new(s * w, 0.0))
            .collect();
        fft.process(&mut buffer);

        let scale = 1.0 / *fft_size as f32;
        smoothed
            .iter_mut()
            .zip(buffer.iter())
            .map(|(prev, bin)| {
                let magnitude = bin.norm() * scale;
                *prev = SMOOTHING_TIME_CONSTANT * *prev + (1.0 - SMOOTHING_TIME_CONSTANT) * magnitude;
                if *prev > 0.0 {
                    (20.0 * prev.log10()).max(MIN_DECIBELS)
                } else {
                    MIN_DECIBELS
                }
            })
            .collect()
    }

    /// RMS of the current window, in [0.0, 1.0].
    pub fn level(&self) -> f32 {
        let state = self.lock();
        if state.samples.is_empty() {
            return 0.0;
        }
        let sum_squares: f64 = state
            .samples
            .iter()
            .map(|&s| (s as f64) * (s as f64))
            .sum();
        ((sum_squares / state.samples.len() as f64).sqrt() as f32).clamp(0.0, 1.0)
    }

    fn lock(&self) -> MutexGuard<'_, AnalyserState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn blackman_window(size: usize) -> Vec<f32> {
    let alpha = 0.16f32;
    let a0 = 0.5 * (1.0 - alpha);
    let a1 = 0.5;
    let a2 = 0.5 * alpha;
    (0..size)
        .map(|i| {
            let x = i as f32 / size as f32;
            a0 - a1 * (2.0 * std::f32::consts::PI * x).cos()
                + a2 * (4.0 * std::f32::consts::PI * x).cos()
        })
        .collect()
}
