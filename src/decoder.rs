//! Decoder-facing interfaces: stream formats, the frame-producer trait,
//! playback notifications, and the planar transfer buffer.
//!
//! Decoders are supplied by the caller (or by [`crate::decode`]) and are
//! driven exclusively by their decode worker; the engine never touches a
//! decoder from more than one thread.

use std::sync::Arc;

/// Stream format, fixed for a decoder's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    /// Frames per second.
    pub sample_rate: u32,
    /// Channels per frame.
    pub channels: u16,
}

impl AudioFormat {
    /// Bytes per frame across all channels (planar `f32` samples).
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * std::mem::size_of::<f32>()
    }
}

/// Speaker layout as a channel bitmask, one bit per speaker position in
/// WAVE channel order (bit 0 = front left, bit 1 = front right, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelLayout(pub u64);

impl ChannelLayout {
    pub const MONO: ChannelLayout = ChannelLayout(0b100);
    pub const STEREO: ChannelLayout = ChannelLayout(0b011);

    /// Number of speaker positions present in the layout.
    pub fn channel_count(&self) -> u32 {
        self.0.count_ones()
    }
}

/// A pull-driven PCM frame producer.
///
/// `read_audio` returning 0 signals end of stream; the engine then corrects
/// the decoder's declared frame total and hands playback to the next queued
/// decoder without a gap.
pub trait Decoder: Send {
    fn format(&self) -> AudioFormat;

    fn channel_layout(&self) -> ChannelLayout;

    /// Total frames this decoder will produce, when the container declares
    /// it up front. Streams of unknown length return `None`; the engine
    /// learns the real total at end of stream.
    fn total_frames(&self) -> Option<i64>;

    fn supports_seeking(&self) -> bool;

    /// Seek to `frame`. Returns the frame actually landed on, which may
    /// differ from the request on block-aligned containers, or `None` when
    /// the seek failed.
    fn seek_to_frame(&mut self, frame: i64) -> Option<i64>;

    /// The next frame `read_audio` will produce, relative to this decoder.
    fn current_frame(&self) -> i64;

    /// Produce up to `max_frames` frames into `buf`. Returns the number of
    /// frames produced; 0 means end of stream.
    fn read_audio(&mut self, buf: &mut SampleBuffer, max_frames: usize) -> usize;
}

/// Notification hooks for one decoder's trip through the pipeline.
///
/// Each hook fires at most once per decoder lifetime under normal playback.
/// The decoding pair fires on the decode worker; the rendering pair fires on
/// the realtime audio thread and must stay wait-free (no locks, no
/// allocation, no I/O). A host that needs to do real work should hand the
/// notification off to its own queue.
pub trait PlaybackEvents: Send + Sync {
    fn decoding_started(&self) {}
    fn decoding_finished(&self) {}
    fn rendering_started(&self) {}
    fn rendering_finished(&self) {}
}

/// Shared handle to a decoder's notification hooks.
pub type EventsHandle = Arc<dyn PlaybackEvents>;

/// Planar `f32` transfer buffer, one plane per channel.
///
/// This is the shape audio crosses every seam in: decoders fill it, the
/// ring stores and fetches it, and the render callback writes into the
/// host's equivalent slice-per-channel view.
pub struct SampleBuffer {
    frames: usize,
    planes: Vec<Vec<f32>>,
}

impl SampleBuffer {
    /// Allocate a buffer holding `frames` frames across `channels` planes.
    pub fn new(channels: usize, frames: usize) -> Self {
        Self {
            frames,
            planes: vec![vec![0.0; frames]; channels],
        }
    }

    pub fn channels(&self) -> usize {
        self.planes.len()
    }

    /// Capacity in frames per plane.
    pub fn capacity(&self) -> usize {
        self.frames
    }

    pub fn plane(&self, channel: usize) -> &[f32] {
        &self.planes[channel]
    }

    pub fn plane_mut(&mut self, channel: usize) -> &mut [f32] {
        &mut self.planes[channel]
    }

    /// Zero every plane.
    pub fn clear(&mut self) {
        for plane in &mut self.planes {
            plane.fill(0.0);
        }
    }
}
