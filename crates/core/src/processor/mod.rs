use std::{iter::StepBy, slice::Iter, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    analysis::{evaluate, PeakHold, TransientDetector},
    timeline::{DelayLine, DelayLineFeed, ScheduleHandle},
    DetectorConfig, OutputState, ParameterStore,
};

/// How a host lays out multi-channel samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleLayout {
    Interleaved,
    Planar,
}

/// Stream description handed to a processor before the first block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_rate: f64,
    pub channels: usize,
    pub layout: SampleLayout,
}

impl StreamFormat {
    /// Single-channel interleaved stream.
    pub fn mono(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            channels: 1,
            layout: SampleLayout::Interleaved,
        }
    }
}

/// One block of float samples as delivered by the host.
#[derive(Debug, Clone, Copy)]
pub enum SampleBlock<'a> {
    Interleaved { data: &'a [f32], channels: usize },
    Planar(&'a [&'a [f32]]),
}

impl<'a> SampleBlock<'a> {
    /// Wraps a mono buffer.
    pub fn mono(data: &'a [f32]) -> Self {
        Self::Interleaved { data, channels: 1 }
    }

    /// Samples of the first channel, which is what the detector analyses.
    pub fn primary_channel(&self) -> StepBy<Iter<'a, f32>> {
        match *self {
            Self::Interleaved { data, channels } => data.iter().step_by(channels.max(1)),
            Self::Planar(planes) => planes.first().copied().unwrap_or(&[]).iter().step_by(1),
        }
    }

    /// Frames in the block, per channel.
    pub fn frames(&self) -> usize {
        match *self {
            Self::Interleaved { data, channels } => data.len() / channels.max(1),
            Self::Planar(planes) => planes.first().map_or(0, |plane| plane.len()),
        }
    }
}

/// What one processed block decided.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Decision {
    pub current_level: f32,
    pub visual_level: f32,
    /// Undelayed trigger candidate; delivery to consumers happens later.
    pub trigger: bool,
    pub intensity_scale: f32,
}

/// Callback surface a playback host drives from its render thread.
///
/// `prepare` and `unprepare` run outside the real-time context and may
/// allocate. `process` must not block, allocate or perform IO.
pub trait SampleProcessor: Send {
    /// Called once before the first block, off the render thread.
    fn prepare(&mut self, format: &StreamFormat);
    /// Analyses one block on the render thread.
    fn process(&mut self, block: &SampleBlock<'_>) -> Decision;
    /// Called after the last block; returns all state to rest.
    fn unprepare(&mut self);
}

/// Shared handles a processor publishes through.
#[derive(Debug)]
pub struct ProcessorLinks {
    pub params: ParameterStore,
    pub output: Arc<OutputState>,
    pub scheduler: ScheduleHandle,
    pub delay_lines: DelayLineFeed,
}

/// The transient pipeline bound to one session generation.
#[derive(Debug)]
pub struct TransientProcessor {
    detector: TransientDetector,
    peak: PeakHold,
    delay_line: Option<DelayLine>,
    sample_rate: f64,
    generation: u64,
    links: ProcessorLinks,
}

impl TransientProcessor {
    /// Pipeline for `generation`; the delay line is allocated in `prepare`.
    pub fn new(config: DetectorConfig, generation: u64, links: ProcessorLinks) -> Self {
        Self {
            detector: TransientDetector::new(config),
            peak: PeakHold::new(config.peak_decay),
            delay_line: None,
            sample_rate: 0.0,
            generation,
            links,
        }
    }

    /// Session generation this processor publishes for.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn detector(&self) -> &TransientDetector {
        &self.detector
    }

    pub fn peak_level(&self) -> f32 {
        self.peak.level()
    }

    /// Length of the active delay line, once prepared.
    pub fn delay_line_len(&self) -> Option<usize> {
        self.delay_line.as_ref().map(DelayLine::len)
    }

    fn reset(&mut self) {
        self.detector.reset();
        self.peak.reset();
        if let Some(line) = self.delay_line.as_mut() {
            line.reset();
        }
    }
}

impl SampleProcessor for TransientProcessor {
    fn prepare(&mut self, format: &StreamFormat) {
        self.sample_rate = format.sample_rate;
        self.reset();
        self.delay_line = Some(DelayLine::new(self.links.params.delay_ms(), self.sample_rate));
    }

    fn process(&mut self, block: &SampleBlock<'_>) -> Decision {
        self.links.delay_lines.adopt(&mut self.delay_line);

        let mut max_in_batch = 0.0_f32;
        let mut delayed_max = 0.0_f32;
        for &sample in block.primary_channel() {
            let value = self.detector.step(sample);
            max_in_batch = max_in_batch.max(value);
            if let Some(line) = self.delay_line.as_mut() {
                delayed_max = delayed_max.max(line.push(value));
            }
        }

        let peak = self.peak.update(max_in_batch);
        let params = &self.links.params;
        let eval = evaluate(peak, params.sensitivity(), self.detector.config());
        let intensity_scale = params.intensity_scale() as f32;

        self.links.output.publish_levels(
            self.generation,
            peak,
            eval.visual_level,
            delayed_max,
            intensity_scale,
        );
        let delay = Duration::from_secs_f64(params.delay_ms() / 1000.0);
        // A refused decision is counted by the handle and reported off-thread.
        self.links
            .scheduler
            .schedule(self.generation, eval.trigger, delay);

        Decision {
            current_level: peak,
            visual_level: eval.visual_level,
            trigger: eval.trigger,
            intensity_scale,
        }
    }

    fn unprepare(&mut self) {
        self.reset();
        self.delay_line = None;
    }
}
