use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crossbeam_channel::Receiver;

use crate::{
    host::{AudioTrack, MediaItem, PlaybackHost, TapHandle},
    processor::{ProcessorLinks, TransientProcessor},
    timeline::{delay_line_channel, DelayLine, DelayLinePublisher, DelayScheduler},
    DetectorConfig, OutputSnapshot, OutputState, ParameterStore, Parameters, Result,
};

/// Binds the transient pipeline to whatever item is playing.
///
/// One engine serves one playback surface. It owns the parameter store, the
/// published output and the delay scheduler; the per-sample state lives in the
/// processor installed on the host, one per session.
pub struct TriggerEngine {
    shared: Arc<Shared>,
}

struct Shared {
    host: Arc<dyn PlaybackHost>,
    config: DetectorConfig,
    params: ParameterStore,
    output: Arc<OutputState>,
    scheduler: DelayScheduler,
    binding: Mutex<Option<Session>>,
}

struct Session {
    item: MediaItem,
    generation: u64,
    attachment: Attachment,
}

enum Attachment {
    /// Waiting for the host to resolve the audio track.
    Resolving,
    /// The item has no audio; nothing will ever be processed.
    Silent,
    Tapped {
        tap: TapHandle,
        sample_rate: f64,
        delay_lines: DelayLinePublisher,
    },
}

impl TriggerEngine {
    /// Creates an unbound engine and starts its delay scheduler thread.
    pub fn new(
        host: Arc<dyn PlaybackHost>,
        config: DetectorConfig,
        params: Parameters,
    ) -> Result<Self> {
        let output = Arc::new(OutputState::new());
        let scheduler = DelayScheduler::spawn(output.clone())?;
        Ok(Self {
            shared: Arc::new(Shared {
                host,
                config: config.sanitized(),
                params: ParameterStore::new(params),
                output,
                scheduler,
                binding: Mutex::new(None),
            }),
        })
    }

    /// Engine with the default tuning and parameters.
    pub fn with_defaults(host: Arc<dyn PlaybackHost>) -> Result<Self> {
        Self::new(host, DetectorConfig::default(), Parameters::default())
    }

    /// Attaches the pipeline to `item`. A no-op when already bound to the same
    /// item; otherwise the previous session is torn down first. Track lookup
    /// is asynchronous and the tap is installed once it completes.
    pub fn setup(&self, item: &MediaItem) {
        let generation = {
            let mut binding = self.shared.lock_binding();
            if binding.as_ref().is_some_and(|s| s.item.id() == item.id()) {
                tracing::debug!(item = ?item.id(), "already bound, ignoring setup");
                return;
            }
            if let Some(previous) = binding.take() {
                self.shared.teardown(previous);
            }
            let generation = self.shared.output.begin_generation();
            *binding = Some(Session {
                item: item.clone(),
                generation,
                attachment: Attachment::Resolving,
            });
            generation
        };

        tracing::info!(item = ?item.id(), title = item.title(), generation, "binding to media item");
        let weak = Arc::downgrade(&self.shared);
        self.shared.host.resolve_audio_track(
            item,
            Box::new(move |track| {
                if let Some(shared) = weak.upgrade() {
                    shared.attach(generation, track);
                }
            }),
        );
    }

    /// Detaches from the current item and returns every output and DSP value
    /// to rest. Pending trigger deliveries are discarded.
    pub fn stop(&self) {
        let mut binding = self.shared.lock_binding();
        if let Some(session) = binding.take() {
            tracing::info!(item = ?session.item.id(), "stopping analysis");
            self.shared.teardown(session);
        }
        self.shared.output.begin_generation();
    }

    /// Sets the detection sensitivity, clamped to `[0, 1]`. Higher values
    /// lower the trigger threshold.
    pub fn set_sensitivity(&self, value: f64) {
        let stored = self.shared.params.set_sensitivity(value);
        tracing::debug!(requested = value, stored, "sensitivity updated");
    }

    /// Sets the actuation strength reported alongside the trigger.
    pub fn set_intensity_scale(&self, value: f64) {
        let stored = self.shared.params.set_intensity_scale(value);
        tracing::debug!(requested = value, stored, "intensity scale updated");
    }

    /// Updates the trigger delay. An attached session receives a freshly
    /// allocated, zeroed delay line sized for the new value.
    pub fn set_delay_ms(&self, value: f64) {
        let stored = self.shared.params.set_delay_ms(value);
        tracing::debug!(requested = value, stored, "trigger delay updated");

        let binding = self.shared.lock_binding();
        if let Some(Attachment::Tapped {
            sample_rate,
            delay_lines,
            ..
        }) = binding.as_ref().map(|s| &s.attachment)
        {
            let line = DelayLine::new(stored, *sample_rate);
            let len = line.len();
            if delay_lines.publish(line) {
                tracing::debug!(len, "published resized delay line");
            } else {
                tracing::warn!(len, "delay line hand-off is saturated, keeping the old line");
            }
        }
    }

    /// Applies all three knobs through their setters.
    pub fn apply_parameters(&self, params: &Parameters) {
        self.set_sensitivity(params.sensitivity);
        self.set_intensity_scale(params.intensity_scale);
        self.set_delay_ms(params.delay_ms);
    }

    /// Current values of the parameter store.
    pub fn parameters(&self) -> Parameters {
        self.shared.params.snapshot()
    }

    /// Loads persisted parameters (defaults if the file is missing) and
    /// applies them.
    pub fn load_parameters(&self, path: impl AsRef<Path>) -> Result<Parameters> {
        let params = Parameters::load_or_default(path)?;
        self.apply_parameters(&params);
        Ok(params)
    }

    /// Persists the current parameters to `path`.
    pub fn save_parameters(&self, path: impl AsRef<Path>) -> Result<()> {
        self.parameters().save(path)
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.shared.config
    }

    /// Every published output value read at once.
    pub fn snapshot(&self) -> OutputSnapshot {
        self.shared.output.snapshot()
    }

    /// Raw peak-hold level of the last processed block.
    pub fn current_level(&self) -> f32 {
        self.shared.output.current_level()
    }

    /// Peak normalised to the threshold, for display.
    pub fn visual_level(&self) -> f32 {
        self.shared.output.visual_level()
    }

    /// Delayed trigger state a haptic actuator should follow.
    pub fn is_active(&self) -> bool {
        self.shared.output.is_active()
    }

    /// Stream of output snapshots, one per publication.
    pub fn updates(&self) -> Receiver<OutputSnapshot> {
        self.shared.output.updates()
    }

    /// Item the engine is bound to, attached or not.
    pub fn bound_item(&self) -> Option<MediaItem> {
        self.shared.lock_binding().as_ref().map(|s| s.item.clone())
    }

    /// Whether a processing tap is currently installed.
    pub fn is_attached(&self) -> bool {
        matches!(
            self.shared.lock_binding().as_ref().map(|s| &s.attachment),
            Some(Attachment::Tapped { .. })
        )
    }

    /// Current session generation.
    pub fn generation(&self) -> u64 {
        self.shared.output.generation()
    }

    /// Trigger decisions lost because the delay queue was saturated.
    pub fn dropped_triggers(&self) -> u64 {
        self.shared.scheduler.dropped()
    }
}

impl Drop for TriggerEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TriggerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerEngine")
            .field("bound_item", &self.bound_item())
            .field("params", &self.shared.params)
            .field("output", &self.snapshot())
            .finish()
    }
}

impl Shared {
    fn lock_binding(&self) -> MutexGuard<'_, Option<Session>> {
        self.binding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn teardown(&self, session: Session) {
        if let Attachment::Tapped { tap, delay_lines, .. } = session.attachment {
            self.host.remove_tap(tap);
            delay_lines.collect_retired();
        }
        let dropped = self.scheduler.dropped();
        if dropped > 0 {
            tracing::warn!(dropped, "delay queue was saturated, trigger decisions were lost");
        }
    }

    fn attach(&self, generation: u64, track: Option<AudioTrack>) {
        let mut binding = self.lock_binding();
        let Some(session) = binding.as_mut().filter(|s| s.generation == generation) else {
            tracing::debug!(generation, "dropping stale track resolution");
            return;
        };

        let Some(track) = track else {
            tracing::info!(item = ?session.item.id(), "item has no audio track, staying idle");
            session.attachment = Attachment::Silent;
            return;
        };

        let (publisher, feed) = delay_line_channel();
        let links = ProcessorLinks {
            params: self.params.clone(),
            output: self.output.clone(),
            scheduler: self.scheduler.handle(),
            delay_lines: feed,
        };
        let processor = TransientProcessor::new(self.config, generation, links);
        let tap = self.host.install_tap(&track, Box::new(processor));
        tracing::info!(
            item = ?session.item.id(),
            sample_rate = track.format.sample_rate,
            channels = track.format.channels,
            "analysis tap installed"
        );
        session.attachment = Attachment::Tapped {
            tap,
            sample_rate: track.format.sample_rate,
            delay_lines: publisher,
        };
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::{host::ManualHost, processor::StreamFormat};

    fn engine_with(host: &Arc<ManualHost>) -> TriggerEngine {
        TriggerEngine::with_defaults(host.clone()).unwrap()
    }

    fn clip(id: u64) -> MediaItem {
        MediaItem::new(id, format!("clip-{id}"))
    }

    fn impulse(len: usize) -> Vec<f32> {
        let mut block = vec![0.0; len];
        block[0] = 1.0;
        block
    }

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn setup_installs_a_tap_once_the_track_resolves() {
        let host = Arc::new(ManualHost::new());
        let item = clip(1);
        host.add_track(&item, StreamFormat::mono(48_000.0));
        let engine = engine_with(&host);

        engine.setup(&item);
        assert!(engine.is_attached());
        assert_eq!(host.installed_taps(), 1);

        let decision = host.render(&impulse(512)).unwrap();
        assert!(decision.trigger);
        assert_eq!(engine.current_level(), 1.0);
    }

    #[test]
    fn repeated_setup_for_the_same_item_keeps_state() {
        let host = Arc::new(ManualHost::new());
        let item = clip(1);
        host.add_track(&item, StreamFormat::mono(48_000.0));
        let engine = engine_with(&host);

        engine.setup(&item);
        let generation = engine.generation();
        host.render(&impulse(512));

        engine.setup(&item);
        assert_eq!(host.install_count(), 1);
        assert_eq!(engine.generation(), generation);
        assert_eq!(engine.current_level(), 1.0);

        // The peak keeps decaying from where it was instead of restarting.
        host.render(&[0.0; 512]);
        assert!((engine.current_level() - 0.9).abs() < 1e-3);
    }

    #[test]
    fn switching_items_starts_fresh() {
        let host = Arc::new(ManualHost::new());
        let (first, second) = (clip(1), clip(2));
        host.add_track(&first, StreamFormat::mono(48_000.0));
        host.add_track(&second, StreamFormat::mono(44_100.0));
        let engine = engine_with(&host);

        engine.setup(&first);
        host.render(&impulse(512));
        engine.setup(&second);

        assert_eq!(host.install_count(), 2);
        assert_eq!(host.installed_taps(), 1);
        assert_eq!(engine.current_level(), 0.0);
        assert_eq!(engine.bound_item(), Some(second));

        host.render(&[0.0; 512]);
        assert_eq!(engine.current_level(), 0.0);
    }

    #[test]
    fn item_without_audio_stays_idle() {
        let host = Arc::new(ManualHost::new());
        let engine = engine_with(&host);
        let item = clip(7);

        engine.setup(&item);
        assert_eq!(engine.bound_item(), Some(item.clone()));
        assert!(!engine.is_attached());
        assert!(host.render(&impulse(64)).is_none());
        assert!(!engine.is_active());

        // Still bound: another setup for it is a no-op.
        engine.setup(&item);
        assert_eq!(host.install_count(), 0);
    }

    #[test]
    fn track_resolution_does_not_block_setup() {
        let host = Arc::new(ManualHost::deferred());
        let item = clip(3);
        host.add_track(&item, StreamFormat::mono(48_000.0));
        let engine = engine_with(&host);

        engine.setup(&item);
        assert!(!engine.is_attached());
        assert_eq!(host.pending_resolutions(), 1);

        host.resolve_pending();
        assert!(engine.is_attached());
    }

    #[test]
    fn resolution_after_stop_is_ignored() {
        let host = Arc::new(ManualHost::deferred());
        let item = clip(3);
        host.add_track(&item, StreamFormat::mono(48_000.0));
        let engine = engine_with(&host);

        engine.setup(&item);
        engine.stop();
        host.resolve_pending();

        assert!(!engine.is_attached());
        assert_eq!(host.install_count(), 0);
    }

    #[test]
    fn stop_detaches_and_zeroes_outputs() {
        let host = Arc::new(ManualHost::new());
        let item = clip(1);
        host.add_track(&item, StreamFormat::mono(48_000.0));
        let engine = engine_with(&host);
        engine.set_delay_ms(0.0);

        engine.setup(&item);
        host.render(&impulse(512));
        assert!(wait_until(Duration::from_secs(1), || engine.is_active()));

        engine.stop();
        let snap = engine.snapshot();
        assert!(!snap.is_active);
        assert_eq!(snap.current_level, 0.0);
        assert_eq!(snap.visual_level, 0.0);
        assert_eq!(host.installed_taps(), 0);
        assert_eq!(engine.bound_item(), None);

        // Setting up the same item again after a stop re-attaches.
        engine.setup(&item);
        assert_eq!(host.install_count(), 2);
    }

    #[test]
    fn stop_suppresses_pending_trigger() {
        let host = Arc::new(ManualHost::new());
        let item = clip(1);
        host.add_track(&item, StreamFormat::mono(48_000.0));
        let engine = engine_with(&host);
        engine.set_delay_ms(80.0);

        engine.setup(&item);
        host.render(&impulse(512));
        engine.stop();

        std::thread::sleep(Duration::from_millis(200));
        assert!(!engine.is_active());
    }

    #[test]
    fn failed_blocks_are_skipped() {
        let host = Arc::new(ManualHost::new());
        let item = clip(1);
        host.add_track(&item, StreamFormat::mono(48_000.0));
        let engine = engine_with(&host);
        engine.setup(&item);

        host.render(&impulse(512));
        assert!(host.render_failed().is_none());
        assert_eq!(engine.current_level(), 1.0);

        host.render(&[0.0; 512]);
        assert!((engine.current_level() - 0.9).abs() < 1e-3);
    }

    #[test]
    fn delay_change_reallocates_the_delay_line() {
        let host = Arc::new(ManualHost::new());
        let item = clip(1);
        host.add_track(&item, StreamFormat::mono(1_000.0));
        let engine = engine_with(&host);
        engine.setup(&item);

        engine.set_delay_ms(4.0);
        host.render(&impulse(4));
        assert_eq!(engine.snapshot().delayed_level, 0.0);
        host.render(&[0.0; 4]);
        assert_eq!(engine.snapshot().delayed_level, 1.0);
    }

    #[test]
    fn parameter_setters_clamp() {
        let host = Arc::new(ManualHost::new());
        let engine = engine_with(&host);

        engine.set_sensitivity(2.0);
        engine.set_intensity_scale(-1.0);
        engine.set_delay_ms(-30.0);

        let params = engine.parameters();
        assert_eq!(params.sensitivity, 1.0);
        assert_eq!(params.intensity_scale, 0.0);
        assert_eq!(params.delay_ms, 0.0);
    }

    #[test]
    fn parameters_persist_across_engines() {
        let path = std::env::temp_dir().join(format!(
            "haptic-pulse-{}-engine-params.json",
            std::process::id()
        ));
        let host = Arc::new(ManualHost::new());

        let engine = engine_with(&host);
        engine.set_sensitivity(0.7);
        engine.set_delay_ms(55.0);
        engine.save_parameters(&path).unwrap();
        drop(engine);

        let restored = engine_with(&host);
        let params = restored.load_parameters(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(params.sensitivity, 0.7);
        assert_eq!(restored.parameters().delay_ms, 55.0);
    }

    #[test]
    fn dropping_the_engine_removes_its_tap() {
        let host = Arc::new(ManualHost::new());
        let item = clip(1);
        host.add_track(&item, StreamFormat::mono(48_000.0));

        let engine = engine_with(&host);
        engine.setup(&item);
        drop(engine);

        assert_eq!(host.installed_taps(), 0);
    }
}
