//! Boundary to the media playback engine.
//!
//! The engine only needs three things from a host: asynchronous resolution of
//! an item's audio track, a way to install a [`SampleProcessor`] on that track
//! and a way to remove it again. [`ManualHost`] implements the boundary
//! in-process so blocks can be pushed by hand.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::processor::{Decision, SampleBlock, SampleLayout, SampleProcessor, StreamFormat};

/// Stable identity of a playable item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MediaItemId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaItem {
    id: MediaItemId,
    title: String,
}

impl MediaItem {
    pub fn new(id: u64, title: impl Into<String>) -> Self {
        Self {
            id: MediaItemId(id),
            title: title.into(),
        }
    }

    pub fn id(&self) -> MediaItemId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }
}

/// Audio track of an item, resolved by the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioTrack {
    pub item: MediaItemId,
    pub format: StreamFormat,
}

/// Identifies an installed processing tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TapHandle(u64);

/// Completion callback for [`PlaybackHost::resolve_audio_track`].
pub type TrackCallback = Box<dyn FnOnce(Option<AudioTrack>) + Send>;

pub trait PlaybackHost: Send + Sync {
    /// Looks up the audio track of `item`. Must not block; the callback may
    /// run later on any thread, or inline. `None` means the item has no
    /// audio.
    fn resolve_audio_track(&self, item: &MediaItem, on_resolved: TrackCallback);

    /// Installs `processor` on `track`. The host calls `prepare` before the
    /// first block and then `process` from its render thread.
    fn install_tap(&self, track: &AudioTrack, processor: Box<dyn SampleProcessor>) -> TapHandle;

    /// Removes a tap. Once this returns no further `process` call happens;
    /// the host calls `unprepare` and drops the processor.
    fn remove_tap(&self, tap: TapHandle);
}

/// Outcome the host reports for a render cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Ok,
    Failed,
}

/// Host driven by hand: tracks are registered up front, blocks are pushed
/// with [`ManualHost::render`].
#[derive(Default)]
pub struct ManualHost {
    state: Mutex<HostState>,
}

#[derive(Default)]
struct HostState {
    tracks: HashMap<MediaItemId, StreamFormat>,
    deferred: bool,
    pending: Vec<(MediaItemId, TrackCallback)>,
    taps: Vec<InstalledTap>,
    next_tap: u64,
    installs: usize,
}

struct InstalledTap {
    handle: TapHandle,
    format: StreamFormat,
    processor: Box<dyn SampleProcessor>,
}

impl ManualHost {
    /// Host that answers track lookups immediately, on the calling thread.
    pub fn new() -> Self {
        Self::default()
    }

    /// Host that holds track lookups until [`ManualHost::resolve_pending`].
    pub fn deferred() -> Self {
        let host = Self::default();
        host.lock().deferred = true;
        host
    }

    pub fn add_track(&self, item: &MediaItem, format: StreamFormat) {
        self.lock().tracks.insert(item.id(), format);
    }

    /// Completes every held lookup. Returns how many were answered.
    pub fn resolve_pending(&self) -> usize {
        let (pending, tracks) = {
            let mut state = self.lock();
            (std::mem::take(&mut state.pending), state.tracks.clone())
        };
        let count = pending.len();
        for (item, callback) in pending {
            callback(lookup(&tracks, item));
        }
        count
    }

    pub fn pending_resolutions(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn installed_taps(&self) -> usize {
        self.lock().taps.len()
    }

    /// Total number of taps ever installed.
    pub fn install_count(&self) -> usize {
        self.lock().installs
    }

    /// Delivers a successful block of interleaved samples to the installed
    /// tap. Returns `None` when nothing is installed.
    pub fn render(&self, samples: &[f32]) -> Option<Decision> {
        self.render_with_status(BlockStatus::Ok, samples)
    }

    /// Simulates a render cycle the host reports as failed.
    pub fn render_failed(&self) -> Option<Decision> {
        self.render_with_status(BlockStatus::Failed, &[])
    }

    pub fn render_with_status(&self, status: BlockStatus, samples: &[f32]) -> Option<Decision> {
        if status == BlockStatus::Failed {
            return None;
        }
        let mut state = self.lock();
        let tap = state.taps.last_mut()?;
        let channels = tap.format.channels.max(1);
        let decision = match tap.format.layout {
            SampleLayout::Interleaved => tap.processor.process(&SampleBlock::Interleaved {
                data: samples,
                channels,
            }),
            SampleLayout::Planar => {
                let frames = samples.len() / channels;
                let planes: Vec<&[f32]> = samples.chunks(frames.max(1)).take(channels).collect();
                tap.processor.process(&SampleBlock::Planar(&planes))
            }
        };
        Some(decision)
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lookup(tracks: &HashMap<MediaItemId, StreamFormat>, item: MediaItemId) -> Option<AudioTrack> {
    tracks.get(&item).map(|format| AudioTrack {
        item,
        format: *format,
    })
}

impl PlaybackHost for ManualHost {
    fn resolve_audio_track(&self, item: &MediaItem, on_resolved: TrackCallback) {
        let track = {
            let mut state = self.lock();
            if state.deferred {
                state.pending.push((item.id(), on_resolved));
                return;
            }
            lookup(&state.tracks, item.id())
        };
        on_resolved(track);
    }

    fn install_tap(&self, track: &AudioTrack, mut processor: Box<dyn SampleProcessor>) -> TapHandle {
        processor.prepare(&track.format);
        let mut state = self.lock();
        state.next_tap += 1;
        state.installs += 1;
        let handle = TapHandle(state.next_tap);
        state.taps.push(InstalledTap {
            handle,
            format: track.format,
            processor,
        });
        handle
    }

    fn remove_tap(&self, tap: TapHandle) {
        let removed = {
            let mut state = self.lock();
            state
                .taps
                .iter()
                .position(|installed| installed.handle == tap)
                .map(|index| state.taps.remove(index))
        };
        if let Some(mut installed) = removed {
            installed.processor.unprepare();
        }
    }
}

impl std::fmt::Debug for ManualHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ManualHost")
            .field("tracks", &state.tracks.len())
            .field("deferred", &state.deferred)
            .field("pending", &state.pending.len())
            .field("taps", &state.taps.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[derive(Default)]
    struct Counting {
        prepared: Arc<AtomicUsize>,
        processed: Arc<AtomicUsize>,
        unprepared: Arc<AtomicUsize>,
    }

    impl SampleProcessor for Counting {
        fn prepare(&mut self, _format: &StreamFormat) {
            self.prepared.fetch_add(1, Ordering::SeqCst);
        }

        fn process(&mut self, block: &SampleBlock<'_>) -> Decision {
            self.processed.fetch_add(block.frames(), Ordering::SeqCst);
            Decision::default()
        }

        fn unprepare(&mut self) {
            self.unprepared.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn resolves_registered_tracks_inline() {
        let host = ManualHost::new();
        let item = MediaItem::new(1, "clip");
        host.add_track(&item, StreamFormat::mono(48_000.0));

        let (tx, rx) = std::sync::mpsc::channel();
        host.resolve_audio_track(&item, Box::new(move |track| tx.send(track).unwrap()));

        let track = rx.try_recv().unwrap().expect("track should resolve");
        assert_eq!(track.item, item.id());
        assert_eq!(track.format.sample_rate, 48_000.0);
    }

    #[test]
    fn unknown_item_has_no_track() {
        let host = ManualHost::new();
        let (tx, rx) = std::sync::mpsc::channel();
        host.resolve_audio_track(&MediaItem::new(9, "silent film"), Box::new(move |t| tx.send(t).unwrap()));
        assert!(rx.try_recv().unwrap().is_none());
    }

    #[test]
    fn deferred_host_waits_for_resolution() {
        let host = ManualHost::deferred();
        let item = MediaItem::new(2, "clip");
        host.add_track(&item, StreamFormat::mono(44_100.0));

        let (tx, rx) = std::sync::mpsc::channel();
        host.resolve_audio_track(&item, Box::new(move |t| tx.send(t).unwrap()));
        assert!(rx.try_recv().is_err());
        assert_eq!(host.pending_resolutions(), 1);

        assert_eq!(host.resolve_pending(), 1);
        assert!(rx.try_recv().unwrap().is_some());
    }

    #[test]
    fn tap_lifecycle_calls_processor_hooks() {
        let host = ManualHost::new();
        let counting = Counting::default();
        let (prepared, processed, unprepared) = (
            counting.prepared.clone(),
            counting.processed.clone(),
            counting.unprepared.clone(),
        );
        let track = AudioTrack {
            item: MediaItemId(3),
            format: StreamFormat {
                sample_rate: 48_000.0,
                channels: 2,
                layout: SampleLayout::Interleaved,
            },
        };

        let tap = host.install_tap(&track, Box::new(counting));
        assert_eq!(prepared.load(Ordering::SeqCst), 1);

        host.render(&[0.0; 64]);
        assert_eq!(processed.load(Ordering::SeqCst), 32);

        assert!(host.render_failed().is_none());
        assert_eq!(processed.load(Ordering::SeqCst), 32);

        host.remove_tap(tap);
        assert_eq!(unprepared.load(Ordering::SeqCst), 1);
        assert_eq!(host.installed_taps(), 0);
        assert!(host.render(&[0.0; 64]).is_none());
    }

    #[test]
    fn planar_tracks_are_split_into_planes() {
        let host = ManualHost::new();
        let counting = Counting::default();
        let processed = counting.processed.clone();
        let track = AudioTrack {
            item: MediaItemId(4),
            format: StreamFormat {
                sample_rate: 48_000.0,
                channels: 2,
                layout: SampleLayout::Planar,
            },
        };
        host.install_tap(&track, Box::new(counting));

        host.render(&[0.0; 100]);
        assert_eq!(processed.load(Ordering::SeqCst), 50);
    }
}
