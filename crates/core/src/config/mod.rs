use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{Parameters, Result};

/// Upper bound accepted for the trigger delay, in milliseconds.
pub const MAX_DELAY_MS: f64 = 10_000.0;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub detector: DetectorConfig,
    pub parameters: Parameters,
}

impl AppConfig {
    /// Reads a configuration file. Fields that are absent keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.parameters = config.parameters.clamped();
        let detector = config.detector.sanitized();
        if detector != config.detector {
            tracing::warn!(path = %path.display(), "detector tuning out of range, clamped");
            config.detector = detector;
        }
        tracing::debug!(path = %path.display(), "loaded app config");
        Ok(config)
    }
}

/// Tuning constants of the detection pipeline.
///
/// Two observed tunings exist for this detector: one without adaptive gain and
/// a heavier transient weight, one with adaptive gain and a weight of 1.5. The
/// defaults follow the latter, both knobs stay configurable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// One-pole high-pass coefficient applied to the sample difference.
    pub hpf_coefficient: f32,
    /// Enables the adaptive gain stage. When disabled the applied gain is 1.
    pub agc_enabled: bool,
    /// Envelope smoothing rate while the level is rising.
    pub agc_attack: f32,
    /// Envelope smoothing rate while the level is falling.
    pub agc_release: f32,
    /// Envelope value a fresh session starts from.
    pub agc_initial_envelope: f32,
    /// Lowest envelope the gain computation will divide by.
    pub agc_gain_floor: f32,
    /// Cap on the applied gain.
    pub agc_max_gain: f32,
    /// Multiplier on the edge (first difference) term.
    pub edge_emphasis: f32,
    /// Final weighting of the blended detection value.
    pub transient_weight: f32,
    /// Per-block decay factor of the peak-hold envelope.
    pub peak_decay: f32,
    /// Threshold at sensitivity 0.
    pub threshold_ceiling: f64,
    /// Ratio between the threshold at sensitivity 1 and at sensitivity 0.
    pub threshold_range: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            hpf_coefficient: 0.97,
            agc_enabled: true,
            agc_attack: 0.05,
            agc_release: 0.0005,
            agc_initial_envelope: 0.05,
            agc_gain_floor: 0.20,
            agc_max_gain: 2.0,
            edge_emphasis: 4.0,
            transient_weight: 1.5,
            peak_decay: 0.90,
            threshold_ceiling: 0.32,
            threshold_range: 0.04,
        }
    }
}

impl DetectorConfig {
    /// Tuning without the adaptive gain stage and with the heavier weight.
    pub fn without_agc() -> Self {
        Self {
            agc_enabled: false,
            transient_weight: 1.8,
            ..Self::default()
        }
    }

    /// Returns a copy whose constants keep the pipeline stable: the high-pass
    /// and peak decay stay below 1 and the threshold stays positive. Values
    /// that are not finite fall back to the defaults.
    pub fn sanitized(self) -> Self {
        let d = Self::default();
        Self {
            hpf_coefficient: bounded(self.hpf_coefficient, 0.0, 0.9999, d.hpf_coefficient),
            agc_enabled: self.agc_enabled,
            agc_attack: bounded(self.agc_attack, 0.0, 1.0, d.agc_attack),
            agc_release: bounded(self.agc_release, 0.0, 1.0, d.agc_release),
            agc_initial_envelope: bounded(
                self.agc_initial_envelope,
                1e-6,
                1.0,
                d.agc_initial_envelope,
            ),
            agc_gain_floor: bounded(self.agc_gain_floor, 1e-6, 1.0, d.agc_gain_floor),
            agc_max_gain: bounded(self.agc_max_gain, 0.0, 64.0, d.agc_max_gain),
            edge_emphasis: bounded(self.edge_emphasis, 0.0, 64.0, d.edge_emphasis),
            transient_weight: bounded(self.transient_weight, 0.0, 64.0, d.transient_weight),
            peak_decay: bounded(self.peak_decay, 0.0, 0.999, d.peak_decay),
            threshold_ceiling: bounded_f64(self.threshold_ceiling, 1e-6, 1.0, d.threshold_ceiling),
            threshold_range: bounded_f64(self.threshold_range, 1e-6, 1.0, d.threshold_range),
        }
    }
}

fn bounded(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}

fn bounded_f64(value: f64, min: f64, max: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}
