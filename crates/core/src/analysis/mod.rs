//! Time-domain transient detection.
//!
//! The pipeline runs once per sample inside the render callback: a one-pole
//! high-pass removes rumble, an asymmetric envelope follower drives a capped
//! adaptive gain, and the gained level is blended with the gained first
//! difference into a `[0, 1]` detection value. The block maximum feeds a
//! peak-hold envelope that the threshold logic compares against a
//! sensitivity-dependent threshold.

use crate::DetectorConfig;

/// Smallest value the adaptive gain envelope may decay to. Keeps the
/// envelope away from zero and out of the denormal range during silence.
const ENVELOPE_FLOOR: f32 = 1e-6;

/// Blend factor between the sustained level term and the edge term.
const BLEND: f32 = 0.5;

/// Stateful per-sample transient estimator for a single session.
#[derive(Debug, Clone)]
pub struct TransientDetector {
    config: DetectorConfig,
    last_sample: f32,
    hpf_state: f32,
    prev_hpf: f32,
    agc_envelope: f32,
}

impl TransientDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            last_sample: 0.0,
            hpf_state: 0.0,
            prev_hpf: 0.0,
            agc_envelope: config.agc_initial_envelope.max(ENVELOPE_FLOOR),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Returns every filter and envelope to its initial value.
    pub fn reset(&mut self) {
        *self = Self::new(self.config);
    }

    pub fn last_sample(&self) -> f32 {
        self.last_sample
    }

    pub fn hpf_state(&self) -> f32 {
        self.hpf_state
    }

    pub fn agc_envelope(&self) -> f32 {
        self.agc_envelope
    }

    /// Advances the pipeline by one sample and returns its detection value.
    #[inline]
    pub fn step(&mut self, sample: f32) -> f32 {
        let cfg = &self.config;

        self.hpf_state = cfg.hpf_coefficient * (self.hpf_state + sample - self.last_sample);
        self.last_sample = sample;
        let level = self.hpf_state.abs();

        let gain = if cfg.agc_enabled {
            let rate = if level > self.agc_envelope {
                cfg.agc_attack
            } else {
                cfg.agc_release
            };
            self.agc_envelope += rate * (level - self.agc_envelope);
            self.agc_envelope = self.agc_envelope.max(ENVELOPE_FLOOR);
            applied_gain(self.agc_envelope, cfg.agc_gain_floor, cfg.agc_max_gain)
        } else {
            1.0
        };

        let diff = (self.hpf_state - self.prev_hpf).abs();
        self.prev_hpf = self.hpf_state;

        let sustained = level * gain * BLEND;
        let edge = diff * gain * BLEND * cfg.edge_emphasis;
        ((sustained + edge) * cfg.transient_weight).clamp(0.0, 1.0)
    }

    /// Runs a whole block through [`TransientDetector::step`] and returns the
    /// largest detection value seen.
    pub fn process_samples(&mut self, samples: &[f32]) -> f32 {
        samples
            .iter()
            .fold(0.0_f32, |max, &sample| max.max(self.step(sample)))
    }
}

/// Gain applied for a given envelope: the inverse of the envelope, never
/// computed from an envelope below `floor`, and never above `max_gain`.
#[inline]
pub fn applied_gain(envelope: f32, floor: f32, max_gain: f32) -> f32 {
    let target = 1.0 / envelope.max(floor);
    target.min(max_gain)
}

/// Fast-attack, geometric-release envelope over block maxima.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakHold {
    level: f32,
    decay: f32,
}

impl PeakHold {
    pub fn new(decay: f32) -> Self {
        Self { level: 0.0, decay }
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    /// Folds one block maximum into the envelope. Call once per block.
    #[inline]
    pub fn update(&mut self, max_in_batch: f32) -> f32 {
        self.level = max_in_batch.max(self.level * self.decay);
        self.level
    }

    pub fn reset(&mut self) {
        self.level = 0.0;
    }
}

/// Trigger threshold for a sensitivity in `[0, 1]`:
/// `ceiling * range^sensitivity`.
pub fn threshold(sensitivity: f64, config: &DetectorConfig) -> f32 {
    let sensitivity = sensitivity.clamp(0.0, 1.0);
    (config.threshold_ceiling * config.threshold_range.powf(sensitivity)) as f32
}

/// Peak normalised to the threshold, so `1.0` means "about to trigger".
pub fn visual_level(peak: f32, threshold: f32) -> f32 {
    if threshold <= 0.0 {
        return if peak > 0.0 { 1.0 } else { 0.0 };
    }
    (peak / threshold).clamp(0.0, 1.0)
}

/// Result of comparing the peak envelope against the current threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub peak: f32,
    pub threshold: f32,
    pub visual_level: f32,
    pub trigger: bool,
}

pub fn evaluate(peak: f32, sensitivity: f64, config: &DetectorConfig) -> Evaluation {
    let threshold = threshold(sensitivity, config);
    Evaluation {
        peak,
        threshold,
        visual_level: visual_level(peak, threshold),
        trigger: peak > threshold,
    }
}
