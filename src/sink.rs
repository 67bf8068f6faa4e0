//! The audio sink interface the engine drives.
//!
//! A sink wraps whatever produces the device callback (CPAL in
//! [`crate::output`], a manually pumped harness in tests). The engine calls
//! every method from controller or worker threads, never from the realtime
//! thread; the realtime side of the contract is the [`RenderSource`] the
//! sink pulls from inside its own callback.

use crate::decoder::{AudioFormat, ChannelLayout};
use crate::render::RenderSource;

/// Failure reported by a sink operation.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SinkError(pub String);

/// Host-facing audio output. All methods take `&self`: implementations use
/// interior mutability or a command channel to whatever thread owns the
/// device stream.
pub trait AudioSink: Send + Sync {
    /// Install the realtime pull source. Called once, before `set_format`.
    fn bind(&self, source: RenderSource);

    /// Program the output for the given stream format. Called on every
    /// format bind, before playback starts.
    fn set_format(&self, format: AudioFormat, layout: ChannelLayout) -> Result<(), SinkError>;

    /// Begin invoking the render callback.
    fn start(&self) -> Result<(), SinkError>;

    /// Stop invoking the render callback. Pausing, not teardown.
    fn stop(&self) -> Result<(), SinkError>;

    fn is_running(&self) -> bool;

    /// Flush any internal state (seek or stop discards in-flight audio).
    /// Never called from the realtime thread.
    fn reset(&self);
}
