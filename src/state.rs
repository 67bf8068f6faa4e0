//! Per-decoder bookkeeping and the lock-free active-decoder table.
//!
//! A `DecoderState` is created by the decode worker when it admits a
//! decoder, and is read concurrently by the realtime thread (post-render
//! accounting) and the controller (introspection). The decoder object
//! itself never lives here: the worker owns it exclusively, and the state
//! carries only atomics plus immutable snapshots taken at admission.
//!
//! The table is a small fixed array of slots. The worker installs with a
//! compare-and-swap of an empty slot, the collector clears with a
//! compare-and-swap back to empty, and readers scan without locks.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwapOption, Guard};

use crate::decoder::{AudioFormat, Decoder, EventsHandle};

/// Number of decoders that can be live at once (the draining one plus
/// preloaded successors). Gapless handoff needs two; eight leaves room for
/// a queue of very short tracks.
pub const ACTIVE_DECODER_SLOTS: usize = 8;

/// Sentinel stored in the seek cell meaning "no seek pending". Valid seek
/// targets are nonnegative frame indices; negative values never appear as
/// frame counts anywhere in the pipeline.
pub(crate) const NO_SEEK: i64 = -1;

/// Frame total used while a stream's length is unknown; corrected downward
/// when the decoder reaches end of stream.
const UNKNOWN_TOTAL: i64 = i64::MAX;

/// Bookkeeping record for one admitted decoder.
pub struct DecoderState {
    /// Absolute frame index at which this decoder's frame 0 lands.
    timestamp: i64,
    format: AudioFormat,
    seekable: bool,
    total_frames: AtomicI64,
    frames_rendered: AtomicI64,
    frame_to_seek: AtomicI64,
    keep_decoding: AtomicBool,
    ready_for_collection: AtomicBool,
    events: Option<EventsHandle>,
}

impl DecoderState {
    pub(crate) fn new(decoder: &dyn Decoder, timestamp: i64, events: Option<EventsHandle>) -> Self {
        Self {
            timestamp,
            format: decoder.format(),
            seekable: decoder.supports_seeking(),
            total_frames: AtomicI64::new(decoder.total_frames().unwrap_or(UNKNOWN_TOTAL)),
            frames_rendered: AtomicI64::new(0),
            frame_to_seek: AtomicI64::new(NO_SEEK),
            keep_decoding: AtomicBool::new(true),
            ready_for_collection: AtomicBool::new(false),
            events,
        }
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn seekable(&self) -> bool {
        self.seekable
    }

    /// Declared (or EOS-corrected) frame total, `None` while unknown.
    pub fn total_frames(&self) -> Option<i64> {
        match self.total_frames.load(Ordering::SeqCst) {
            UNKNOWN_TOTAL => None,
            total => Some(total),
        }
    }

    /// Raw total used by the accounting arithmetic (`i64::MAX` = unknown).
    pub(crate) fn total_frames_raw(&self) -> i64 {
        self.total_frames.load(Ordering::SeqCst)
    }

    pub(crate) fn set_total_frames(&self, total: i64) {
        self.total_frames.store(total, Ordering::SeqCst);
    }

    pub fn frames_rendered(&self) -> i64 {
        self.frames_rendered.load(Ordering::SeqCst)
    }

    pub(crate) fn add_frames_rendered(&self, frames: i64) {
        self.frames_rendered.fetch_add(frames, Ordering::SeqCst);
    }

    pub(crate) fn set_frames_rendered(&self, frames: i64) {
        self.frames_rendered.store(frames, Ordering::SeqCst);
    }

    /// Pending seek target, if one has been published.
    pub fn seek_target(&self) -> Option<i64> {
        match self.frame_to_seek.load(Ordering::SeqCst) {
            NO_SEEK => None,
            target => Some(target),
        }
    }

    /// Publish a seek target for the worker to pick up. Retries against the
    /// worker's concurrent reset so the newest request always wins.
    pub(crate) fn request_seek(&self, target: i64) {
        debug_assert!(target >= 0);
        let mut current = self.frame_to_seek.load(Ordering::SeqCst);
        while let Err(observed) = self.frame_to_seek.compare_exchange(
            current,
            target,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            current = observed;
        }
    }

    /// Clear a consumed seek target. Fails silently when the controller
    /// published a newer target in the meantime; the worker will see it on
    /// the next iteration.
    pub(crate) fn finish_seek(&self, consumed: i64) {
        let _ = self.frame_to_seek.compare_exchange(
            consumed,
            NO_SEEK,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn keep_decoding(&self) -> bool {
        self.keep_decoding.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_decoding(&self) {
        self.keep_decoding.store(false, Ordering::SeqCst);
    }

    pub fn ready_for_collection(&self) -> bool {
        self.ready_for_collection.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_ready_for_collection(&self) {
        self.ready_for_collection.store(true, Ordering::SeqCst);
    }

    pub(crate) fn events(&self) -> Option<&EventsHandle> {
        self.events.as_ref()
    }
}

/// Snapshot of one table slot, pinned for the duration of a scan.
pub(crate) type SlotGuard = Guard<Option<Arc<DecoderState>>>;

/// Fixed-size, lock-free registry of live decoder states.
pub struct ActiveDecoderTable {
    slots: [ArcSwapOption<DecoderState>; ACTIVE_DECODER_SLOTS],
}

impl ActiveDecoderTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| ArcSwapOption::empty()),
        }
    }

    /// Install `state` into the first empty slot (compare-and-swap of
    /// empty to state). Returns `false` when every slot is occupied.
    pub(crate) fn install(&self, state: &Arc<DecoderState>) -> bool {
        for slot in &self.slots {
            let previous = slot.compare_and_swap(
                std::ptr::null::<DecoderState>(),
                Some(Arc::clone(state)),
            );
            if previous.is_none() {
                return true;
            }
        }
        false
    }

    /// Clear every slot whose state is flagged ready (compare-and-swap of
    /// state to empty), dropping the table's reference. Returns the number
    /// of slots reclaimed. Only the collector calls this.
    pub(crate) fn collect_ready(&self) -> usize {
        let mut collected = 0;
        for slot in &self.slots {
            let current = slot.load();
            let Some(state) = current.as_ref() else { continue };
            if !state.ready_for_collection() {
                continue;
            }
            let expected = Arc::as_ptr(state);
            let previous = slot.compare_and_swap(expected, None);
            if previous.as_ref().map(Arc::as_ptr) == Some(expected) {
                collected += 1;
            }
        }
        collected
    }

    /// The live decoder the render cursor is inside: the non-collected
    /// entry with the smallest timestamp.
    pub fn current(&self) -> Option<Arc<DecoderState>> {
        let mut best: Option<Arc<DecoderState>> = None;
        for slot in &self.slots {
            let guard = slot.load();
            let Some(state) = guard.as_ref() else { continue };
            if state.ready_for_collection() {
                continue;
            }
            if best
                .as_ref()
                .map_or(true, |b| state.timestamp() < b.timestamp())
            {
                best = Some(Arc::clone(state));
            }
        }
        best
    }

    /// Pin every slot for a single scan. Allocation-free; used on the
    /// realtime thread.
    pub(crate) fn load_all(&self) -> [SlotGuard; ACTIVE_DECODER_SLOTS] {
        std::array::from_fn(|i| self.slots[i].load())
    }

    /// Whether any live state is still producing frames. Used by the
    /// controller to decide if an enqueue must chain a worker itself.
    pub(crate) fn any_decoding(&self) -> bool {
        self.slots.iter().any(|slot| {
            slot.load()
                .as_ref()
                .is_some_and(|state| !state.ready_for_collection() && state.keep_decoding())
        })
    }

    /// Flag every live state as cancelled and collectable.
    pub(crate) fn stop_all(&self) {
        for slot in &self.slots {
            let guard = slot.load();
            if let Some(state) = guard.as_ref() {
                state.stop_decoding();
                state.mark_ready_for_collection();
            }
        }
    }

    /// Unconditionally empty the table. Shutdown only, after the collector
    /// has been joined.
    pub(crate) fn clear(&self) {
        for slot in &self.slots {
            slot.store(None);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.load().is_none())
    }
}

impl Default for ActiveDecoderTable {
    fn default() -> Self {
        Self::new()
    }
}
