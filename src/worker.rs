//! The decode worker: one producer thread per admitted decoder.
//!
//! A worker takes the head of the decoder queue, registers a state in the
//! active table, and drains the decoder into the ring in fixed chunks,
//! pausing whenever less than one chunk of space is free. At end of stream
//! it corrects the decoder's frame total, advances the starting timestamp
//! for its successor, and spawns the next worker itself, which is what
//! makes handoff gapless: the successor's frames land in the ring
//! immediately after the predecessor's last frame.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use crate::decoder::SampleBuffer;
use crate::error::PlayerError;
use crate::player::Shared;
use crate::rt;
use crate::state::DecoderState;

/// Keeps `workers_active` accurate across every worker exit path.
struct ActiveWorker(Arc<Shared>);

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        self.0.workers_active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Spawn a detached worker for the decoder at the head of the queue.
///
/// `workers_active` is raised before the thread exists so the controller
/// never observes a queued decoder with no worker accounted for.
pub(crate) fn spawn(shared: Arc<Shared>) -> Result<(), PlayerError> {
    shared.workers_active.fetch_add(1, Ordering::SeqCst);
    let for_thread = Arc::clone(&shared);
    match thread::Builder::new()
        .name("decode-worker".into())
        .spawn(move || run(for_thread))
    {
        Ok(_) => Ok(()),
        Err(e) => {
            shared.workers_active.fetch_sub(1, Ordering::SeqCst);
            Err(PlayerError::WorkerSpawnFailed(e))
        }
    }
}

fn run(shared: Arc<Shared>) {
    let _active = ActiveWorker(Arc::clone(&shared));

    rt::promote_decode_thread();

    // Take the head decoder. An empty queue here means the controller was
    // torn down (or the queue cleared) between spawn and startup; nothing
    // to do.
    let pending = shared.queue.lock().unwrap().pop_front();
    let Some(pending) = pending else {
        tracing::warn!("decode worker started with an empty queue");
        return;
    };
    let mut decoder = pending.decoder;

    let timestamp = shared.next_timestamp.load(Ordering::SeqCst);
    let state = Arc::new(DecoderState::new(&*decoder, timestamp, pending.events));
    if !shared.table.install(&state) {
        tracing::error!("active decoder table is full, dropping decoder");
        return;
    }

    let format = state.format();
    let chunk_frames = shared.config.write_chunk_frames;
    let capacity = shared.config.capacity_frames as i64;
    let mut chunk = SampleBuffer::new(format.channels as usize, chunk_frames);

    tracing::debug!(
        timestamp,
        sample_rate = format.sample_rate,
        channels = format.channels,
        "decode worker started"
    );

    while state.keep_decoding() {
        // Fill the ring with as much audio as fits, one chunk at a time.
        // Cancellation is honored between chunks: a stopped worker finishes
        // the chunk in hand and exits.
        loop {
            if !state.keep_decoding() {
                break;
            }
            let free = capacity
                - (shared.frames_decoded.load(Ordering::SeqCst)
                    - shared.frames_rendered.load(Ordering::SeqCst));
            if free < chunk_frames as i64 {
                break;
            }

            if let Some(target) = state.seek_target() {
                transit_seek(&shared, &state, &mut *decoder, target);
            }

            let start_frame = decoder.current_frame();
            let frames = decoder.read_audio(&mut chunk, chunk_frames);

            if start_frame == 0 {
                if let Some(events) = state.events() {
                    events.decoding_started();
                }
            }

            if frames > 0 {
                match shared.ring.get() {
                    Some(ring) => match ring.store(&chunk, frames, start_frame + timestamp) {
                        Ok(()) => {
                            shared
                                .frames_decoded
                                .fetch_add(frames as i64, Ordering::SeqCst);
                        }
                        Err(e) => tracing::warn!(error = %e, "ring store failed, dropping chunk"),
                    },
                    // The controller allocates the ring before any worker
                    // can exist; reaching this is a wiring bug.
                    None => tracing::error!("ring buffer not allocated, dropping chunk"),
                }
            } else {
                // End of stream. Correct the frame total (some containers,
                // MP3 in particular, cannot know it without a full scan),
                // advance the starting timestamp for the next decoder, and
                // chain its worker if one is queued.
                if let Some(events) = state.events() {
                    events.decoding_finished();
                }
                state.set_total_frames(start_frame);
                // Advance the successor's timestamp before dropping the
                // decoding flag: once the flag clears, the controller may
                // chain a worker that reads it.
                shared
                    .next_timestamp
                    .fetch_add(start_frame, Ordering::SeqCst);
                state.stop_decoding();

                let have_next = !shared.queue.lock().unwrap().is_empty();
                if have_next {
                    if let Err(e) = spawn(Arc::clone(&shared)) {
                        tracing::error!(error = %e, "failed to chain next decode worker");
                    }
                }

                tracing::debug!(timestamp, total_frames = start_frame, "decode finished");
                break;
            }
        }

        // Wait for the render callback to free up a chunk of space; the
        // timeout is only a watchdog against lost wake-ups.
        shared.decoder_sem.wait_timeout(shared.config.wait_timeout);
    }
}

/// Resolve a pending seek on the worker thread.
///
/// The skipped span is accounted as if it had been rendered: the state's
/// cursor jumps to the landed frame, the global decode counter moves by the
/// skip delta, and the render cursor snaps to it, which discards whatever
/// was left in the ring. The downstream sink is reset so stale device-side
/// buffers do not play across the seam.
fn transit_seek(
    shared: &Shared,
    state: &DecoderState,
    decoder: &mut dyn crate::decoder::Decoder,
    target: i64,
) {
    let before = decoder.current_frame();
    let landed = decoder.seek_to_frame(target);

    match landed {
        Some(frame) if frame != target => {
            tracing::warn!(requested = target, landed = frame, "seek landed off target");
        }
        None => tracing::warn!(requested = target, "seek failed"),
        _ => {}
    }

    // Consume the request; a newer target published meanwhile survives for
    // the next iteration.
    state.finish_seek(target);

    if let Some(frame) = landed {
        state.set_frames_rendered(frame);

        // Rewrite the global cursors to the seek point. The store order
        // keeps the concurrent render callback on its silence path for the
        // whole window: shrink the decode counter first on a backward seek,
        // raise the render cursor first on a forward one, so `decoded -
        // rendered` never looks positive mid-rewrite.
        let delta = frame - before;
        let decoded = shared.frames_decoded.load(Ordering::SeqCst) + delta;
        if delta <= 0 {
            shared.frames_decoded.store(decoded, Ordering::SeqCst);
            shared.frames_rendered.store(decoded, Ordering::SeqCst);
        } else {
            shared.frames_rendered.store(decoded, Ordering::SeqCst);
            shared.frames_decoded.store(decoded, Ordering::SeqCst);
        }

        if let Some(sink) = shared.sink.get() {
            sink.reset();
        }
    }
}
