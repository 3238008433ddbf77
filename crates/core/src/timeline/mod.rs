use std::{
    cmp::{Ordering as CmpOrdering, Reverse},
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::{OutputState, PulseError, Result};

/// Deliveries that may be queued between the render thread and the worker.
const QUEUE_CAPACITY: usize = 4096;

/// Longest the worker sleeps before re-checking for shutdown.
const IDLE_POLL: Duration = Duration::from_millis(20);

/// Fixed-length ring buffer that delays a per-sample signal by
/// `delay_ms * sample_rate / 1000` samples (at least one).
///
/// A line is built off the render thread and handed over whole; it is never
/// resized in place.
#[derive(Clone)]
pub struct DelayLine {
    buffer: Box<[f32]>,
    cursor: usize,
    delay_ms: f64,
}

impl DelayLine {
    /// Sizes the line for `delay_ms` at `sample_rate`. Negative or NaN delays
    /// are treated as zero, and `delay_ms()` reports the value used.
    pub fn new(delay_ms: f64, sample_rate: f64) -> Self {
        let delay_ms = if delay_ms.is_nan() { 0.0 } else { delay_ms.max(0.0) };
        let len = ((delay_ms * sample_rate) / 1000.0) as usize;
        Self {
            buffer: vec![0.0; len.max(1)].into_boxed_slice(),
            cursor: 0,
            delay_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn delay_ms(&self) -> f64 {
        self.delay_ms
    }

    /// Writes `value` and returns the value written `len()` samples earlier.
    #[inline]
    pub fn push(&mut self, value: f32) -> f32 {
        let out = std::mem::replace(&mut self.buffer[self.cursor], value);
        self.cursor += 1;
        if self.cursor == self.buffer.len() {
            self.cursor = 0;
        }
        out
    }

    pub fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.cursor = 0;
    }
}

impl std::fmt::Debug for DelayLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayLine")
            .field("len", &self.buffer.len())
            .field("delay_ms", &self.delay_ms)
            .finish()
    }
}

/// Lines in flight between the control thread and the render thread.
const LINE_CAPACITY: usize = 8;

/// Creates the pair used to hand freshly built delay lines to the render
/// thread and to get replaced ones back for deallocation.
pub fn delay_line_channel() -> (DelayLinePublisher, DelayLineFeed) {
    let (tx, rx) = crossbeam_channel::bounded(LINE_CAPACITY);
    let (retired_tx, retired_rx) = crossbeam_channel::bounded(LINE_CAPACITY);
    (
        DelayLinePublisher {
            tx,
            retired: retired_rx,
        },
        DelayLineFeed { rx, retired_tx },
    )
}

/// Control-thread end: publishes new lines and frees retired ones.
#[derive(Debug)]
pub struct DelayLinePublisher {
    tx: Sender<DelayLine>,
    retired: Receiver<DelayLine>,
}

impl DelayLinePublisher {
    /// Sends `line` to the render thread. Returns `false` if it could not be
    /// queued (render side gone or not draining).
    pub fn publish(&self, line: DelayLine) -> bool {
        self.collect_retired();
        self.tx.try_send(line).is_ok()
    }

    /// Drops every line the render thread has handed back. Returns how many.
    pub fn collect_retired(&self) -> usize {
        self.retired.try_iter().count()
    }
}

/// Render-thread end of [`delay_line_channel`].
#[derive(Debug)]
pub struct DelayLineFeed {
    rx: Receiver<DelayLine>,
    retired_tx: Sender<DelayLine>,
}

impl DelayLineFeed {
    /// Swaps in the newest published line, returning the replaced ones to the
    /// control thread. Returns whether a swap happened.
    pub fn adopt(&self, current: &mut Option<DelayLine>) -> bool {
        let mut swapped = false;
        while let Ok(line) = self.rx.try_recv() {
            if let Some(old) = current.replace(line) {
                // Only dropped here if the control side stopped collecting.
                let _ = self.retired_tx.try_send(old);
            }
            swapped = true;
        }
        swapped
    }
}

/// A trigger decision waiting for its delivery time.
#[derive(Debug, Clone, Copy)]
pub struct Delivery {
    pub due: Instant,
    pub generation: u64,
    pub active: bool,
}

/// Render-side handle used to queue deliveries. Never blocks or allocates.
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    tx: Sender<Delivery>,
    dropped: Arc<AtomicU64>,
}

impl ScheduleHandle {
    /// Queues `active` for delivery after `delay`. Returns `false` when the
    /// queue is saturated and the decision was dropped.
    pub fn schedule(&self, generation: u64, active: bool, delay: Duration) -> bool {
        let delivery = Delivery {
            due: Instant::now() + delay,
            generation,
            active,
        };
        let queued = self.tx.try_send(delivery).is_ok();
        if !queued {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queued
    }

    /// Decisions refused so far because the queue was full or the worker gone.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Worker thread that applies delayed trigger decisions to the output state.
///
/// Every scheduled decision is delivered independently in deadline order;
/// nothing is coalesced. Decisions whose generation has been retired by the
/// time they fall due are dropped by [`OutputState::deliver_trigger`].
pub struct DelayScheduler {
    tx: Sender<Delivery>,
    dropped: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl DelayScheduler {
    /// Starts the worker thread that applies deliveries to `output`.
    pub fn spawn(output: Arc<OutputState>) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(QUEUE_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();

        let worker = std::thread::Builder::new()
            .name("pulse-delay".to_string())
            .spawn(move || run_worker(rx, output, flag))
            .map_err(|err| PulseError::msg(format!("failed to spawn delay scheduler: {err}")))?;

        tracing::debug!("delay scheduler started");
        Ok(Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            shutdown,
            worker: Some(worker),
        })
    }

    /// Handle for the render thread. Every handle shares one drop counter.
    pub fn handle(&self) -> ScheduleHandle {
        ScheduleHandle {
            tx: self.tx.clone(),
            dropped: self.dropped.clone(),
        }
    }

    /// Total decisions dropped by any handle of this scheduler.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for DelayScheduler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("delay scheduler worker panicked");
            }
        }
        tracing::debug!("delay scheduler stopped");
    }
}

impl std::fmt::Debug for DelayScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayScheduler")
            .field("queued", &self.tx.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

struct Pending {
    due: Instant,
    seq: u64,
    generation: u64,
    active: bool,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

fn run_worker(rx: Receiver<Delivery>, output: Arc<OutputState>, shutdown: Arc<AtomicBool>) {
    let mut queue: BinaryHeap<Reverse<Pending>> = BinaryHeap::new();
    let mut seq = 0_u64;
    let mut enqueue = |queue: &mut BinaryHeap<Reverse<Pending>>, d: Delivery| {
        seq += 1;
        queue.push(Reverse(Pending {
            due: d.due,
            seq,
            generation: d.generation,
            active: d.active,
        }));
    };

    while !shutdown.load(Ordering::Acquire) {
        let now = Instant::now();
        while queue.peek().is_some_and(|Reverse(p)| p.due <= now) {
            if let Some(Reverse(p)) = queue.pop() {
                output.deliver_trigger(p.generation, p.active);
            }
        }

        let wait = queue
            .peek()
            .map(|Reverse(p)| p.due.saturating_duration_since(now))
            .unwrap_or(IDLE_POLL)
            .min(IDLE_POLL);

        match rx.recv_timeout(wait) {
            Ok(delivery) => {
                enqueue(&mut queue, delivery);
                for delivery in rx.try_iter() {
                    enqueue(&mut queue, delivery);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
