use std::{
    fs,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};

use crate::{config::MAX_DELAY_MS, Result};

pub const DEFAULT_SENSITIVITY: f64 = 0.15;
pub const DEFAULT_INTENSITY_SCALE: f64 = 1.0;
pub const DEFAULT_DELAY_MS: f64 = 230.0;

/// Persisted form of the user-tunable knobs. Serialises to a flat
/// `name -> number` JSON object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    pub sensitivity: f64,
    pub intensity_scale: f64,
    pub delay_ms: f64,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            sensitivity: DEFAULT_SENSITIVITY,
            intensity_scale: DEFAULT_INTENSITY_SCALE,
            delay_ms: DEFAULT_DELAY_MS,
        }
    }
}

impl Parameters {
    /// Returns a copy with every field moved into its valid range.
    pub fn clamped(self) -> Self {
        Self {
            sensitivity: clamp_or(self.sensitivity, 0.0, 1.0, DEFAULT_SENSITIVITY),
            intensity_scale: clamp_or(self.intensity_scale, 0.0, 1.0, DEFAULT_INTENSITY_SCALE),
            delay_ms: clamp_or(self.delay_ms, 0.0, MAX_DELAY_MS, DEFAULT_DELAY_MS),
        }
    }

    /// Reads persisted parameters. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let params: Self = serde_json::from_str(&raw)?;
        Ok(params.clamped())
    }

    /// Like [`Parameters::load`] but a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no persisted parameters, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Writes the parameters as a flat JSON object, creating the parent
    /// directory if needed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        tracing::debug!(path = %path.display(), "saved parameters");
        Ok(())
    }
}

fn clamp_or(value: f64, min: f64, max: f64, fallback: f64) -> f64 {
    if value.is_nan() {
        fallback
    } else {
        value.clamp(min, max)
    }
}

/// Lock-free store for the three knobs. Written from control threads, read
/// from the render callback. Cloning yields another handle to the same values.
#[derive(Clone)]
pub struct ParameterStore {
    inner: Arc<Knobs>,
}

struct Knobs {
    sensitivity: AtomicU64,
    intensity_scale: AtomicU64,
    delay_ms: AtomicU64,
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new(Parameters::default())
    }
}

impl ParameterStore {
    /// Store seeded with `initial`, clamped.
    pub fn new(initial: Parameters) -> Self {
        let initial = initial.clamped();
        Self {
            inner: Arc::new(Knobs {
                sensitivity: AtomicU64::new(initial.sensitivity.to_bits()),
                intensity_scale: AtomicU64::new(initial.intensity_scale.to_bits()),
                delay_ms: AtomicU64::new(initial.delay_ms.to_bits()),
            }),
        }
    }

    pub fn sensitivity(&self) -> f64 {
        load(&self.inner.sensitivity)
    }

    pub fn intensity_scale(&self) -> f64 {
        load(&self.inner.intensity_scale)
    }

    pub fn delay_ms(&self) -> f64 {
        load(&self.inner.delay_ms)
    }

    /// Stores the sensitivity clamped to `[0, 1]` and returns the stored value.
    /// NaN leaves the current value untouched.
    pub fn set_sensitivity(&self, value: f64) -> f64 {
        store_clamped(&self.inner.sensitivity, value, 0.0, 1.0)
    }

    /// Stores the intensity scale clamped to `[0, 1]`.
    pub fn set_intensity_scale(&self, value: f64) -> f64 {
        store_clamped(&self.inner.intensity_scale, value, 0.0, 1.0)
    }

    /// Stores the delay clamped to `[0, MAX_DELAY_MS]`.
    pub fn set_delay_ms(&self, value: f64) -> f64 {
        store_clamped(&self.inner.delay_ms, value, 0.0, MAX_DELAY_MS)
    }

    /// Copies the three knobs into a [`Parameters`] value.
    pub fn snapshot(&self) -> Parameters {
        Parameters {
            sensitivity: self.sensitivity(),
            intensity_scale: self.intensity_scale(),
            delay_ms: self.delay_ms(),
        }
    }

    /// Stores every field of `params` with the usual clamping.
    pub fn apply(&self, params: &Parameters) {
        self.set_sensitivity(params.sensitivity);
        self.set_intensity_scale(params.intensity_scale);
        self.set_delay_ms(params.delay_ms);
    }
}

impl std::fmt::Debug for ParameterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterStore")
            .field("sensitivity", &self.sensitivity())
            .field("intensity_scale", &self.intensity_scale())
            .field("delay_ms", &self.delay_ms())
            .finish()
    }
}

fn load(slot: &AtomicU64) -> f64 {
    f64::from_bits(slot.load(Ordering::Relaxed))
}

fn store_clamped(slot: &AtomicU64, value: f64, min: f64, max: f64) -> f64 {
    if value.is_nan() {
        return load(slot);
    }
    let value = value.clamp(min, max);
    slot.store(value.to_bits(), Ordering::Relaxed);
    value
}
