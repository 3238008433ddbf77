use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

/// Number of snapshots buffered for a slow subscriber. Once full, the oldest
/// snapshot is discarded to make room for the newest.
const UPDATE_CAPACITY: usize = 256;

/// Latest values visible to consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSnapshot {
    /// Raw peak-hold level in `[0, 1]`.
    pub current_level: f32,
    /// Peak normalised to the current threshold.
    pub visual_level: f32,
    /// Detection envelope read back through the delay line, aligned with
    /// trigger delivery.
    pub delayed_level: f32,
    /// Delayed trigger decision.
    pub is_active: bool,
    /// Actuation strength to apply while active.
    pub intensity_scale: f32,
}

/// Lock-free holder for the published values.
///
/// `is_active` shares a word with the session generation (`generation << 1 |
/// active`), so a teardown that bumps the generation and a delayed delivery
/// that targets the old one can never interleave into a stale activation.
#[derive(Debug)]
pub struct OutputState {
    current_level: AtomicU32,
    visual_level: AtomicU32,
    delayed_level: AtomicU32,
    intensity_scale: AtomicU32,
    active_word: AtomicU64,
    updates_tx: Sender<OutputSnapshot>,
    updates_rx: Receiver<OutputSnapshot>,
}

impl Default for OutputState {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputState {
    /// Output at rest: zero levels, trigger off, generation 0.
    pub fn new() -> Self {
        let (updates_tx, updates_rx) = crossbeam_channel::bounded(UPDATE_CAPACITY);
        Self {
            current_level: AtomicU32::new(0),
            visual_level: AtomicU32::new(0),
            delayed_level: AtomicU32::new(0),
            intensity_scale: AtomicU32::new(1.0_f32.to_bits()),
            active_word: AtomicU64::new(0),
            updates_tx,
            updates_rx,
        }
    }

    /// Reads every published value at once.
    pub fn snapshot(&self) -> OutputSnapshot {
        OutputSnapshot {
            current_level: load_f32(&self.current_level),
            visual_level: load_f32(&self.visual_level),
            delayed_level: load_f32(&self.delayed_level),
            is_active: self.active_word.load(Ordering::Acquire) & 1 == 1,
            intensity_scale: load_f32(&self.intensity_scale),
        }
    }

    pub fn current_level(&self) -> f32 {
        load_f32(&self.current_level)
    }

    pub fn visual_level(&self) -> f32 {
        load_f32(&self.visual_level)
    }

    pub fn is_active(&self) -> bool {
        self.active_word.load(Ordering::Acquire) & 1 == 1
    }

    /// Session generation that deliveries must match to be applied.
    pub fn generation(&self) -> u64 {
        self.active_word.load(Ordering::Acquire) >> 1
    }

    /// Receiver that gets a snapshot after every publication. Meant for a
    /// single consumer; clones compete for the same messages.
    pub fn updates(&self) -> Receiver<OutputSnapshot> {
        self.updates_rx.clone()
    }

    /// Starts a new session: bumps the generation, clears the trigger and
    /// zeroes every level. Returns the new generation.
    pub fn begin_generation(&self) -> u64 {
        let previous = self
            .active_word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some(((word >> 1) + 1) << 1)
            })
            .unwrap_or_else(|word| word);
        store_f32(&self.current_level, 0.0);
        store_f32(&self.visual_level, 0.0);
        store_f32(&self.delayed_level, 0.0);
        self.notify();
        (previous >> 1) + 1
    }

    /// Publishes the immediate levels of one processed block. Ignored when
    /// `generation` is no longer current.
    pub fn publish_levels(
        &self,
        generation: u64,
        current_level: f32,
        visual_level: f32,
        delayed_level: f32,
        intensity_scale: f32,
    ) {
        if self.generation() != generation {
            return;
        }
        store_f32(&self.current_level, current_level);
        store_f32(&self.visual_level, visual_level);
        store_f32(&self.delayed_level, delayed_level);
        store_f32(&self.intensity_scale, intensity_scale);
        self.notify();
    }

    /// Applies a delayed trigger decision. Returns `false` if the delivery
    /// belonged to a torn-down session and was dropped.
    pub fn deliver_trigger(&self, generation: u64, active: bool) -> bool {
        let target = (generation << 1) | u64::from(active);
        let applied = self
            .active_word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (word >> 1 == generation).then_some(target)
            })
            .is_ok();
        if applied {
            self.notify();
        }
        applied
    }

    // A lagging subscriber loses the oldest updates, never the latest one.
    fn notify(&self) {
        let mut snapshot = self.snapshot();
        for _ in 0..UPDATE_CAPACITY {
            match self.updates_tx.try_send(snapshot) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    snapshot = rejected;
                    let _ = self.updates_rx.try_recv();
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

fn load_f32(slot: &AtomicU32) -> f32 {
    f32::from_bits(slot.load(Ordering::Relaxed))
}

fn store_f32(slot: &AtomicU32, value: f32) {
    slot.store(value.to_bits(), Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_rest() {
        let output = OutputState::new();
        let snap = output.snapshot();
        assert_eq!(snap.current_level, 0.0);
        assert_eq!(snap.visual_level, 0.0);
        assert!(!snap.is_active);
        assert_eq!(output.generation(), 0);
    }

    #[test]
    fn levels_overwrite_rather_than_accumulate() {
        let output = OutputState::new();
        let generation = output.begin_generation();
        output.publish_levels(generation, 0.8, 1.0, 0.1, 1.0);
        output.publish_levels(generation, 0.2, 0.5, 0.0, 1.0);

        assert_eq!(output.current_level(), 0.2);
        assert_eq!(output.visual_level(), 0.5);
    }

    #[test]
    fn stale_generation_cannot_activate() {
        let output = OutputState::new();
        let old = output.begin_generation();
        let new = output.begin_generation();
        assert_eq!(new, old + 1);

        assert!(!output.deliver_trigger(old, true));
        assert!(!output.is_active());

        assert!(output.deliver_trigger(new, true));
        assert!(output.is_active());
    }

    #[test]
    fn new_generation_clears_trigger_and_levels() {
        let output = OutputState::new();
        let generation = output.begin_generation();
        output.publish_levels(generation, 0.9, 1.0, 0.9, 0.5);
        output.deliver_trigger(generation, true);

        output.begin_generation();
        let snap = output.snapshot();
        assert!(!snap.is_active);
        assert_eq!(snap.current_level, 0.0);
        assert_eq!(snap.delayed_level, 0.0);
    }

    #[test]
    fn stale_levels_are_ignored() {
        let output = OutputState::new();
        let old = output.begin_generation();
        output.begin_generation();
        output.publish_levels(old, 0.7, 0.7, 0.7, 1.0);
        assert_eq!(output.current_level(), 0.0);
    }

    #[test]
    fn subscribers_see_every_publication() {
        let output = OutputState::new();
        let updates = output.updates();
        let generation = output.begin_generation();
        output.publish_levels(generation, 0.4, 0.6, 0.0, 1.0);
        output.deliver_trigger(generation, true);

        let received: Vec<OutputSnapshot> = updates.try_iter().collect();
        assert_eq!(received.len(), 3);
        assert_eq!(received[1].current_level, 0.4);
        assert!(received[2].is_active);
    }

    #[test]
    fn full_channel_keeps_the_latest_snapshot() {
        let output = OutputState::new();
        let generation = output.begin_generation();
        for step in 0..UPDATE_CAPACITY + 50 {
            output.publish_levels(generation, step as f32 / 1000.0, 0.0, 0.0, 1.0);
        }
        output.deliver_trigger(generation, true);

        let received: Vec<OutputSnapshot> = output.updates().try_iter().collect();
        assert_eq!(received.len(), UPDATE_CAPACITY);
        let last = received.last().copied().unwrap();
        assert_eq!(last, output.snapshot());
        assert!(last.is_active);
        // begin_generation plus the first 51 publications were displaced.
        assert_eq!(received[0].current_level, 51.0 / 1000.0);
    }
}
