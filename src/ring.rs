//! Absolute-index SPSC ring buffer for planar audio.
//!
//! The ring is addressed by absolute frame index over the concatenated
//! output stream, not by a modular offset; the index is masked internally.
//! Exactly one producer (the running decode worker) stores and exactly one
//! consumer (the realtime render callback) fetches, so both operations are
//! wait-free: two independently advancing 64-bit counters with
//! release/acquire ordering carry the whole contract.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::decoder::SampleBuffer;

/// Errors from ring operations. Fetch never fails; out-of-window reads are
/// zero-filled instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// A single store span cannot exceed the ring capacity.
    #[error("store of {frames} frames at index {start} exceeds ring capacity {capacity}")]
    Overrun {
        frames: usize,
        start: i64,
        capacity: usize,
    },
}

/// Fixed-capacity, multi-channel, absolute-frame-indexed PCM ring.
pub struct RingBuffer {
    planes: Vec<UnsafeCell<Box<[f32]>>>,
    capacity: usize,
    mask: usize,
    /// Exclusive end of valid data, in absolute frames. Producer-advanced.
    write_head: AtomicI64,
    /// Lowest absolute index still backed by storage. Producer-advanced.
    first_valid: AtomicI64,
}

// SAFETY: single producer / single consumer by construction. The decode
// worker is the only thread that calls `store` and the render callback the
// only one that calls `fetch`, and the regions they touch are disjoint
// under the `frames_decoded - frames_rendered <= capacity` discipline the
// worker enforces before every store.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Provision storage for `capacity_frames` frames (rounded up to a
    /// power of two) across `channels` planes. Allocation happens here,
    /// never on the realtime path.
    pub fn new(channels: usize, capacity_frames: usize) -> Self {
        let capacity = capacity_frames.next_power_of_two();
        let planes = (0..channels)
            .map(|_| UnsafeCell::new(vec![0.0; capacity].into_boxed_slice()))
            .collect();

        Self {
            planes,
            capacity,
            mask: capacity - 1,
            write_head: AtomicI64::new(0),
            first_valid: AtomicI64::new(0),
        }
    }

    pub fn channels(&self) -> usize {
        self.planes.len()
    }

    /// Capacity in frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy `frames` frames from `src` into the ring so that
    /// `[start, start + frames)` becomes valid. Storing an equal span twice
    /// is idempotent. Producer side only.
    pub fn store(&self, src: &SampleBuffer, frames: usize, start: i64) -> Result<(), RingError> {
        if frames == 0 {
            return Ok(());
        }
        if frames > self.capacity {
            return Err(RingError::Overrun {
                frames,
                start,
                capacity: self.capacity,
            });
        }
        debug_assert!(start >= 0, "absolute frame indices are nonnegative");
        debug_assert_eq!(src.channels(), self.planes.len());
        debug_assert!(src.capacity() >= frames);

        let offset = (start as usize) & self.mask;
        let first = frames.min(self.capacity - offset);

        for (ch, plane) in self.planes.iter().enumerate() {
            // SAFETY: sole producer; the consumer never reads the region
            // being written (it is beyond `write_head` or already consumed).
            let data = unsafe { &mut **plane.get() };
            let samples = &src.plane(ch)[..frames];
            data[offset..offset + first].copy_from_slice(&samples[..first]);
            if first < frames {
                data[..frames - first].copy_from_slice(&samples[first..]);
            }
        }

        let end = start + frames as i64;
        if end > self.write_head.load(Ordering::Relaxed) {
            self.write_head.store(end, Ordering::Release);
        }
        let trailing = end - self.capacity as i64;
        if trailing > self.first_valid.load(Ordering::Relaxed) {
            self.first_valid.store(trailing, Ordering::Release);
        }

        Ok(())
    }

    /// Copy `frames` frames starting at absolute index `start` into `dst`,
    /// zero-filling output positions that fall outside the valid window.
    /// Returns the number of frames that actually came from the ring.
    /// Consumer side only; wait-free.
    pub fn fetch(&self, dst: &mut [&mut [f32]], frames: usize, start: i64) -> usize {
        let head = self.write_head.load(Ordering::Acquire);
        let first_valid = self.first_valid.load(Ordering::Acquire);

        let valid_from = start.max(first_valid);
        let valid_to = (start + frames as i64).min(head);

        if valid_to <= valid_from {
            for plane in dst.iter_mut() {
                plane[..frames].fill(0.0);
            }
            return 0;
        }

        let lead = (valid_from - start) as usize;
        let copy = (valid_to - valid_from) as usize;
        let offset = (valid_from as usize) & self.mask;
        let first = copy.min(self.capacity - offset);

        for (ch, plane) in self.planes.iter().enumerate() {
            // SAFETY: sole consumer; the producer never rewrites
            // `[first_valid, write_head)` while it remains unconsumed.
            let data = unsafe { &**plane.get() };
            let out = &mut dst[ch][..frames];
            out[..lead].fill(0.0);
            out[lead..lead + first].copy_from_slice(&data[offset..offset + first]);
            if first < copy {
                out[lead + first..lead + copy].copy_from_slice(&data[..copy - first]);
            }
            out[lead + copy..].fill(0.0);
        }

        copy
    }
}
