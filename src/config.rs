//! Engine tuning parameters.

use std::time::Duration;

/// Tuning parameters shared by the decode, render, and collection stages.
///
/// The ring capacity and write chunk bound each other: the decode worker
/// only writes when at least `write_chunk_frames` of space is free, and the
/// render callback signals it once that much space opens up again.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Ring capacity in frames. Rounded up to a power of two at allocation.
    pub capacity_frames: usize,
    /// Decode chunk size in frames; also the producer wake-up threshold.
    pub write_chunk_frames: usize,
    /// Watchdog timeout for the decode and collector semaphore waits.
    ///
    /// Bounds latency after a lost wake-up; correctness does not depend on it.
    pub wait_timeout: Duration,
    /// Require enqueued decoders to match the bound channel layout exactly.
    ///
    /// Sample rate and channel count are always required to match; with this
    /// set, a layout difference (e.g. L/R vs. R/L) is also rejected.
    pub require_channel_layout_match: bool,
}

impl Default for EngineConfig {
    /// Defaults sized for uninterrupted playback on common devices:
    /// a 16 Ki-frame ring (~0.37 s at 44.1 kHz) filled in 2 Ki-frame chunks.
    fn default() -> Self {
        Self {
            capacity_frames: 16_384,
            write_chunk_frames: 2_048,
            wait_timeout: Duration::from_secs(2),
            require_channel_layout_match: true,
        }
    }
}
