//! Realtime render path: the pull callback and post-render accounting.
//!
//! Both entry points run on the host's realtime audio thread and are
//! wait-free: no locks, no allocation, at most one semaphore post each.
//! `render` moves audio and advances the global render cursor;
//! `post_render` attributes the frames of the pass just rendered to the
//! decoder states they came from, which is where gapless handoff becomes
//! observable (one pass can straddle a decoder boundary).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::player::Shared;
use crate::state::{SlotGuard, ACTIVE_DECODER_SLOTS};

/// What a render pass produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderOutcome {
    /// No decoded audio was available; the output is all zeros and the
    /// render cursor did not move.
    Silence,
    /// This many frames came from the ring; any remainder of the request
    /// was zero-filled.
    Rendered(usize),
}

/// What post-render accounting concluded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostRenderAction {
    Continue,
    /// The last live decoder finished this pass. Counters are already
    /// zeroed; the host should stop pulling when convenient.
    StreamEnded,
}

/// Cloneable realtime handle the audio sink pulls from.
///
/// The host calls [`render`](Self::render) with its output buffers, then
/// [`post_render`](Self::post_render) once the pass is complete.
#[derive(Clone)]
pub struct RenderSource {
    pub(crate) shared: Arc<Shared>,
}

impl RenderSource {
    /// Fill `output` (one plane per channel, each at least `frames` long)
    /// from the ring at the current render cursor.
    pub fn render(&self, output: &mut [&mut [f32]], frames: usize) -> RenderOutcome {
        let shared = &self.shared;

        let decoded = shared.frames_decoded.load(Ordering::SeqCst);
        let rendered = shared.frames_rendered.load(Ordering::SeqCst);
        let available = decoded - rendered;

        // Nothing decoded yet (or drained): emit silence without touching
        // the cursor, and make sure a stale last-pass count cannot be
        // redistributed by post_render.
        if available <= 0 {
            for plane in output.iter_mut() {
                plane[..frames].fill(0.0);
            }
            shared
                .frames_rendered_last_pass
                .store(0, Ordering::SeqCst);
            return RenderOutcome::Silence;
        }

        let take = (available as usize).min(frames);
        if let Some(ring) = shared.ring.get() {
            ring.fetch(output, take, rendered);
        }

        // Single-writer field, read back by post_render on this same thread.
        shared
            .frames_rendered_last_pass
            .store(take as i64, Ordering::SeqCst);
        shared.frames_rendered.fetch_add(take as i64, Ordering::SeqCst);

        if take < frames {
            tracing::trace!(take, requested = frames, "ring underrun, zero-filling tail");
            for plane in output.iter_mut() {
                plane[take..frames].fill(0.0);
            }
        }

        // Wake the producer once a whole write chunk of space is free.
        let free = shared.config.capacity_frames as i64
            - (shared.frames_decoded.load(Ordering::SeqCst)
                - shared.frames_rendered.load(Ordering::SeqCst));
        if free >= shared.config.write_chunk_frames as i64 {
            shared.decoder_sem.signal();
        }

        RenderOutcome::Rendered(take)
    }

    /// Distribute the frames of the pass just rendered across the active
    /// decoder states in stream order, firing rendering-started and
    /// rendering-finished notifications and flagging finished states for
    /// collection. Ends the stream when no live decoder remains.
    pub fn post_render(&self) -> PostRenderAction {
        let shared = &self.shared;

        let mut remaining = shared.frames_rendered_last_pass.load(Ordering::SeqCst);
        if remaining == 0 {
            return PostRenderAction::Continue;
        }

        let guards = shared.table.load_all();

        // Attribution must follow stream order. Slot order is arbitrary
        // (slots get reused), so sort the handful of live indices by
        // timestamp in place; the table is small and fixed, no allocation.
        let mut order = [0usize; ACTIVE_DECODER_SLOTS];
        let live = live_indices_by_timestamp(&guards, &mut order);

        for &slot in &order[..live] {
            let Some(state) = guards[slot].as_ref() else { continue };
            if state.ready_for_collection() {
                continue;
            }

            let need = state.total_frames_raw() - state.frames_rendered();
            let give = need.min(remaining).max(0);

            if state.frames_rendered() == 0 && give > 0 {
                if let Some(events) = state.events() {
                    events.rendering_started();
                }
            }

            state.add_frames_rendered(give);

            // Completion is checked even when nothing was attributed: a
            // zero-frame decoder is complete the moment it is looked at.
            if state.frames_rendered() == state.total_frames_raw() {
                if let Some(events) = state.events() {
                    events.rendering_finished();
                }
                state.mark_ready_for_collection();
                shared.collector_sem.signal();
            }

            remaining -= give;
            if remaining == 0 {
                break;
            }
        }

        if remaining > 0 {
            tracing::trace!(remaining, "rendered frames exceeded live decoder totals");
        }

        // No live decoder left: the stream is over. The realtime thread
        // cannot stop the device, so it resets the counters, drops the
        // playing flag, and lets the host act on the returned action.
        if shared.table.current().is_none() {
            shared.frames_decoded.store(0, Ordering::SeqCst);
            shared.frames_rendered.store(0, Ordering::SeqCst);
            shared.next_timestamp.store(0, Ordering::SeqCst);
            shared.frames_rendered_last_pass.store(0, Ordering::SeqCst);
            shared.playing.store(false, Ordering::SeqCst);
            return PostRenderAction::StreamEnded;
        }

        PostRenderAction::Continue
    }
}

/// Write the indices of live slots into `order`, sorted by ascending
/// timestamp, and return how many there are. Insertion sort over at most
/// [`ACTIVE_DECODER_SLOTS`] entries.
fn live_indices_by_timestamp(
    guards: &[SlotGuard; ACTIVE_DECODER_SLOTS],
    order: &mut [usize; ACTIVE_DECODER_SLOTS],
) -> usize {
    let mut keyed = [(0i64, 0usize); ACTIVE_DECODER_SLOTS];
    let mut live = 0;
    for (i, guard) in guards.iter().enumerate() {
        let Some(state) = guard.as_ref() else { continue };
        let ts = state.timestamp();

        let mut pos = live;
        while pos > 0 && keyed[pos - 1].0 > ts {
            keyed[pos] = keyed[pos - 1];
            pos -= 1;
        }
        keyed[pos] = (ts, i);
        live += 1;
    }
    for (dst, &(_, idx)) in order.iter_mut().zip(keyed.iter()).take(live) {
        *dst = idx;
    }
    live
}
