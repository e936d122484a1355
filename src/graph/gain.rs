//! Gain stage with exponential target automation
//!
//! `set_target_at_time` follows the Web Audio `setTargetAtTime` curve:
//! `v(t) = target + (v0 - target) * exp(-(t - t0) / tau)`, where `v0` is the
//! value at `t0`. The gain therefore never steps, which keeps volume changes
//! free of clicks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Below this distance from the target the ramp snaps and ends.
const SETTLE_EPSILON: f32 = 1e-5;

#[derive(Debug, Clone, Copy)]
struct TargetRamp {
    target: f32,
    start_frame: u64,
    time_constant_frames: f64,
    start_value: Option<f32>,
}

/// Per-sample gain value owned by the render thread.
#[derive(Debug)]
pub struct GainParam {
    value: f32,
    sample_rate: u32,
    ramp: Option<TargetRamp>,
    published: Arc<AtomicU32>,
}

impl GainParam {
    pub fn new(initial: f32, sample_rate: u32) -> Self {
        Self {
            value: initial,
            sample_rate,
            ramp: None,
            published: Arc::new(AtomicU32::new(initial.to_bits())),
        }
    }

    /// Start approaching `target` at `start_time` (seconds of context time).
    ///
    /// Replaces any ramp in progress; the new ramp starts from whatever value
    /// the gain has when `start_time` is reached.
    pub fn set_target_at_time(&mut self, target: f32, start_time: f64, time_constant: f64) {
        let start_frame = (start_time.max(0.0) * self.sample_rate as f64).round() as u64;
        self.ramp = Some(TargetRamp {
            target,
            start_frame,
            time_constant_frames: time_constant.max(0.0) * self.sample_rate as f64,
            start_value: None,
        });
    }

    /// Gain for the sample at `frame`, advancing the automation.
    pub fn value_at(&mut self, frame: u64) -> f32 {
        let Some(ramp) = self.ramp.as_mut() else {
            return self.value;
        };
        if frame < ramp.start_frame {
            return self.value;
        }

        let v0 = *ramp.start_value.get_or_insert(self.value);
        let next = if ramp.time_constant_frames <= 0.0 {
            ramp.target
        } else {
            let elapsed = (frame - ramp.start_frame) as f64;
            let decay = (-elapsed / ramp.time_constant_frames).exp();
            ramp.target + (v0 - ramp.target) * decay as f32
        };

        if (next - ramp.target).abs() < SETTLE_EPSILON {
            self.value = ramp.target;
            self.ramp = None;
        } else {
            self.value = next;
        }
        self.value
    }

    /// Current value without advancing.
    pub fn value(&self) -> f32 {
        self.value
    }

    /// Make the current value visible to `GainReader`s.
    pub fn publish(&self) {
        self.published.store(self.value.to_bits(), Ordering::Relaxed);
    }

    pub fn reader(&self) -> GainReader {
        GainReader {
            value: Arc::clone(&self.published),
        }
    }
}

/// Read-only view of the gain stage, updated once per render quantum.
#[derive(Debug, Clone)]
pub struct GainReader {
    value: Arc<AtomicU32>,
}

impl GainReader {
    pub fn value(&self) -> f32 {
        f32::from_bits(self.value.load(Ordering::Relaxed))
    }
}
