//! Error types for the player surface.
//!
//! The realtime render path never constructs or returns these; shortfalls
//! there are reported through [`RenderOutcome`](crate::render::RenderOutcome)
//! alone.

use crate::decoder::{AudioFormat, Decoder};

/// Errors surfaced by [`Player`](crate::player::Player) operations.
///
/// Admission rejections (`FormatMismatch`, `ChannelLayoutMismatch`) hand the
/// decoder back inside the error, so the caller keeps ownership on failure.
#[derive(thiserror::Error)]
pub enum PlayerError {
    /// Enqueued decoder's sample rate or channel count differs from the
    /// format the stream was bound to.
    #[error("decoder format {actual:?} does not match the bound format {expected:?}")]
    FormatMismatch {
        expected: AudioFormat,
        actual: AudioFormat,
        decoder: Box<dyn Decoder>,
    },

    /// Enqueued decoder's channel layout differs from the bound layout.
    #[error("decoder channel layout does not match the bound layout")]
    ChannelLayoutMismatch { decoder: Box<dyn Decoder> },

    /// No installed decoder could open the given source.
    #[error("could not open {path}")]
    DecoderOpenFailed {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// Seek was requested on a decoder that cannot seek.
    #[error("the current decoder does not support seeking")]
    SeekUnsupported,

    /// The operation needs a live decoder and none is active.
    #[error("no decoder is currently active")]
    NothingPlaying,

    /// The decode worker thread could not be created.
    #[error("failed to spawn decode worker")]
    WorkerSpawnFailed(#[source] std::io::Error),

    /// The audio sink rejected a request.
    #[error("audio sink failed: {0}")]
    SinkFailed(String),
}

// Manual impl: `Box<dyn Decoder>` carried by the admission errors has no
// Debug of its own.
impl std::fmt::Debug for PlayerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FormatMismatch { expected, actual, .. } => f
                .debug_struct("FormatMismatch")
                .field("expected", expected)
                .field("actual", actual)
                .finish_non_exhaustive(),
            Self::ChannelLayoutMismatch { .. } => {
                f.debug_struct("ChannelLayoutMismatch").finish_non_exhaustive()
            }
            Self::DecoderOpenFailed { path, source } => f
                .debug_struct("DecoderOpenFailed")
                .field("path", path)
                .field("source", source)
                .finish(),
            Self::SeekUnsupported => f.write_str("SeekUnsupported"),
            Self::NothingPlaying => f.write_str("NothingPlaying"),
            Self::WorkerSpawnFailed(e) => {
                f.debug_tuple("WorkerSpawnFailed").field(e).finish()
            }
            Self::SinkFailed(msg) => f.debug_tuple("SinkFailed").field(msg).finish(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;
