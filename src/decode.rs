//! Symphonia-backed file decoder.
//!
//! Uses Symphonia to:
//! - probe the input container/codec
//! - decode packets into planar `f32` frames on demand
//! - seek accurately by time, reporting the frame actually landed on
//!
//! This is the stock [`Decoder`] implementation; anything that produces
//! frames can implement the trait instead.

use std::fs::File;
use std::path::Path;

use anyhow::{anyhow, Context};
use symphonia::core::audio::SampleBuffer as SymphoniaSampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder as SymphoniaDecoderImpl, DecoderOptions};
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};

use crate::decoder::{AudioFormat, ChannelLayout, Decoder, SampleBuffer};
use crate::error::PlayerError;

/// File decoder producing planar `f32` frames through Symphonia.
pub struct FileDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn SymphoniaDecoderImpl>,
    track_id: u32,
    format: AudioFormat,
    layout: ChannelLayout,
    total_frames: Option<i64>,
    time_base: Option<TimeBase>,
    position: i64,
    /// Interleaved samples decoded but not yet handed out.
    pending: Vec<f32>,
    pending_offset: usize,
}

impl std::fmt::Debug for FileDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDecoder")
            .field("track_id", &self.track_id)
            .field("format", &self.format)
            .field("layout", &self.layout)
            .field("total_frames", &self.total_frames)
            .field("time_base", &self.time_base)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl FileDecoder {
    /// Probe `path` and prepare the default audio track for decoding.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PlayerError> {
        let path = path.as_ref();
        Self::open_inner(path).map_err(|source| PlayerError::DecoderOpenFailed {
            path: path.display().to_string(),
            source,
        })
    }

    fn open_inner(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .context("probe container")?;

        let reader = probed.format;
        let track = reader
            .default_track()
            .ok_or_else(|| anyhow!("no default audio track"))?;
        let track_id = track.id;
        let params: CodecParameters = track.codec_params.clone();

        let channels = params
            .channels
            .ok_or_else(|| anyhow!("unknown channel count"))?;
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| anyhow!("unknown sample rate"))?;

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .context("instantiate codec")?;

        Ok(Self {
            reader,
            decoder,
            track_id,
            format: AudioFormat {
                sample_rate,
                channels: channels.count() as u16,
            },
            layout: ChannelLayout(channels.bits() as u64),
            total_frames: params.n_frames.map(|n| n as i64),
            time_base: params.time_base,
            position: 0,
            pending: Vec::new(),
            pending_offset: 0,
        })
    }

    /// Decode packets until at least one sample is pending. Returns `false`
    /// at end of stream.
    fn refill_pending(&mut self) -> bool {
        loop {
            // Any read error here is treated as end of stream, matching
            // how Symphonia surfaces EOF.
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(_) => return false,
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(e) => {
                    // Corrupt packets are skipped, not fatal.
                    tracing::debug!(error = %e, "packet decode failed, skipping");
                    continue;
                }
            };
            if decoded.frames() == 0 {
                continue;
            }

            let spec = *decoded.spec();
            let mut interleaved = SymphoniaSampleBuffer::<f32>::new(decoded.frames() as u64, spec);
            interleaved.copy_interleaved_ref(decoded);

            self.pending.clear();
            self.pending_offset = 0;
            self.pending.extend_from_slice(interleaved.samples());
            return true;
        }
    }
}

impl Decoder for FileDecoder {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn channel_layout(&self) -> ChannelLayout {
        self.layout
    }

    fn total_frames(&self) -> Option<i64> {
        self.total_frames
    }

    fn supports_seeking(&self) -> bool {
        true
    }

    fn seek_to_frame(&mut self, frame: i64) -> Option<i64> {
        let rate = self.format.sample_rate as f64;
        let seconds = frame.max(0) as f64 / rate;
        let time = Time::new(seconds.trunc() as u64, seconds.fract());

        let seeked = match self.reader.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time,
                track_id: Some(self.track_id),
            },
        ) {
            Ok(seeked) => seeked,
            Err(e) => {
                tracing::warn!(frame, error = %e, "container seek failed");
                return None;
            }
        };

        self.decoder.reset();
        self.pending.clear();
        self.pending_offset = 0;

        // actual_ts is in the track's timebase; convert back to frames.
        let landed = match self.time_base {
            Some(tb) => {
                let t = tb.calc_time(seeked.actual_ts);
                ((t.seconds as f64 + t.frac) * rate).round() as i64
            }
            None => seeked.actual_ts as i64,
        };
        self.position = landed;
        Some(landed)
    }

    fn current_frame(&self) -> i64 {
        self.position
    }

    fn read_audio(&mut self, buf: &mut SampleBuffer, max_frames: usize) -> usize {
        let channels = self.format.channels as usize;
        let mut produced = 0;

        while produced < max_frames {
            if self.pending_offset >= self.pending.len() && !self.refill_pending() {
                break;
            }

            let available = (self.pending.len() - self.pending_offset) / channels;
            let take = available.min(max_frames - produced);
            if take == 0 {
                break;
            }

            for ch in 0..channels {
                let plane = buf.plane_mut(ch);
                for i in 0..take {
                    plane[produced + i] = self.pending[self.pending_offset + i * channels + ch];
                }
            }
            self.pending_offset += take * channels;
            produced += take;
        }

        self.position += produced as i64;
        produced
    }
}
