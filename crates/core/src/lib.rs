//! Core library for the Haptic Pulse trigger engine.
//!
//! The engine taps the audio of whatever is playing, detects impactful
//! transients sample by sample against a self-calibrating noise floor and
//! publishes a continuous level plus a delayed trigger a haptic actuator can
//! pulse on. Each module owns one stage: parameters, the DSP pipeline, the
//! delay scheduler, published output, the processor seam the playback host
//! drives, and the session binder tying them to a media item.

pub mod analysis;
pub mod config;
pub mod error;
pub mod host;
pub mod output;
pub mod params;
pub mod processor;
pub mod session;
pub mod timeline;

pub use analysis::{evaluate, threshold, visual_level, Evaluation, PeakHold, TransientDetector};
pub use config::{AppConfig, DetectorConfig, MAX_DELAY_MS};
pub use error::{PulseError, Result};
pub use host::{AudioTrack, BlockStatus, ManualHost, MediaItem, MediaItemId, PlaybackHost, TapHandle};
pub use output::{OutputSnapshot, OutputState};
pub use params::{ParameterStore, Parameters};
pub use processor::{
    Decision, SampleBlock, SampleLayout, SampleProcessor, StreamFormat, TransientProcessor,
};
pub use session::TriggerEngine;
pub use timeline::{DelayLine, DelayScheduler};
