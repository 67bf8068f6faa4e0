//! CPAL-backed audio sink.
//!
//! Builds the device output stream and pumps the engine's [`RenderSource`]
//! from the CPAL callback:
//! - renders into preallocated planar scratch buffers
//! - interleaves and converts `f32` to the device sample format
//! - runs post-render accounting once per chunk
//!
//! The CPAL stream is not `Send`, so it lives on a dedicated host thread
//! driven over a command channel; the [`AudioSink`] methods are thin
//! request/acknowledge wrappers around it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use crate::decoder::{AudioFormat, ChannelLayout};
use crate::render::{PostRenderAction, RenderSource};
use crate::sink::{AudioSink, SinkError};

/// Frames rendered per callback chunk. Callbacks asking for more are served
/// in several chunks.
const SCRATCH_FRAMES: usize = 4096;

enum Command {
    SetFormat {
        format: AudioFormat,
        source: RenderSource,
        done: Sender<std::result::Result<(), String>>,
    },
    Start {
        done: Sender<std::result::Result<(), String>>,
    },
    Stop {
        done: Sender<std::result::Result<(), String>>,
    },
    Reset,
    Shutdown,
}

/// Audio sink playing through the default CPAL host.
pub struct CpalSink {
    cmd_tx: Sender<Command>,
    running: Arc<AtomicBool>,
    source: Mutex<Option<RenderSource>>,
}

impl CpalSink {
    /// Sink on the host's default output device.
    pub fn new() -> Self {
        Self::with_device(None)
    }

    /// Sink on the first output device whose name contains `device_name`
    /// (case-insensitive), falling back to an error at format time when
    /// nothing matches.
    pub fn with_device(device_name: Option<String>) -> Self {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let running = Arc::new(AtomicBool::new(false));

        let thread_running = Arc::clone(&running);
        thread::spawn(move || host_thread(cmd_rx, thread_running, device_name));

        Self {
            cmd_tx,
            running,
            source: Mutex::new(None),
        }
    }

    fn request(
        &self,
        make: impl FnOnce(Sender<std::result::Result<(), String>>) -> Command,
    ) -> std::result::Result<(), SinkError> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        self.cmd_tx
            .send(make(done_tx))
            .map_err(|_| SinkError("audio sink thread is gone".into()))?;
        done_rx
            .recv()
            .map_err(|_| SinkError("audio sink thread is gone".into()))?
            .map_err(SinkError)
    }
}

impl AudioSink for CpalSink {
    fn bind(&self, source: RenderSource) {
        *self.source.lock().unwrap() = Some(source);
    }

    fn set_format(
        &self,
        format: AudioFormat,
        _layout: ChannelLayout,
    ) -> std::result::Result<(), SinkError> {
        let source = self
            .source
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SinkError("no render source bound".into()))?;
        self.request(|done| Command::SetFormat { format, source, done })
    }

    fn start(&self) -> std::result::Result<(), SinkError> {
        self.request(|done| Command::Start { done })
    }

    fn stop(&self) -> std::result::Result<(), SinkError> {
        self.request(|done| Command::Stop { done })
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        let _ = self.cmd_tx.send(Command::Reset);
    }
}

impl Default for CpalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

fn host_thread(cmd_rx: Receiver<Command>, running: Arc<AtomicBool>, device_name: Option<String>) {
    // The stream is created, started, and dropped on this thread only.
    let mut stream: Option<cpal::Stream> = None;

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            Command::SetFormat { format, source, done } => {
                stream = None;
                running.store(false, Ordering::SeqCst);
                let result = match build_stream(
                    device_name.as_deref(),
                    format,
                    source,
                    Arc::clone(&running),
                ) {
                    Ok(built) => {
                        stream = Some(built);
                        Ok(())
                    }
                    Err(e) => Err(format!("{e:#}")),
                };
                let _ = done.send(result);
            }
            Command::Start { done } => {
                let result = match stream.as_ref() {
                    Some(s) => s.play().map_err(|e| e.to_string()),
                    None => Err("no output stream configured".to_string()),
                };
                if result.is_ok() {
                    running.store(true, Ordering::SeqCst);
                }
                let _ = done.send(result);
            }
            Command::Stop { done } => {
                let result = match stream.as_ref() {
                    Some(s) => s.pause().map_err(|e| e.to_string()),
                    None => Ok(()),
                };
                running.store(false, Ordering::SeqCst);
                let _ = done.send(result);
            }
            Command::Reset => {
                // Playback position lives in the engine's ring cursors; the
                // scratch planes are overwritten every pass, so there is no
                // device-side state to flush here.
            }
            Command::Shutdown => break,
        }
    }
}

fn build_stream(
    device_name: Option<&str>,
    format: AudioFormat,
    source: RenderSource,
    running: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = pick_device(&host, device_name)?;
    let supported = pick_output_config(&device, format)?;
    let sample_format = supported.sample_format();

    let config = cpal::StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    tracing::info!(
        device = %device.name().unwrap_or_else(|_| "unknown".into()),
        rate_hz = format.sample_rate,
        channels = format.channels,
        ?sample_format,
        "output stream configured"
    );

    match sample_format {
        cpal::SampleFormat::F32 => build_typed::<f32>(&device, &config, source, running),
        cpal::SampleFormat::I16 => build_typed::<i16>(&device, &config, source, running),
        cpal::SampleFormat::I32 => build_typed::<i32>(&device, &config, source, running),
        cpal::SampleFormat::U16 => build_typed::<u16>(&device, &config, source, running),
        other => Err(anyhow!("unsupported sample format: {other:?}")),
    }
}

/// Pick the first output device matching `needle` (case-insensitive), or
/// the host default.
fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let lowered = needle.to_lowercase();
        for device in host.output_devices().context("no output devices")? {
            let matched = device
                .name()
                .map(|n| n.to_lowercase().contains(&lowered))
                .unwrap_or(false);
            if matched {
                return Ok(device);
            }
        }
        return Err(anyhow!("no output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("no default output device"))
}

/// Choose a supported config carrying the stream's exact rate and channel
/// count, preferring float output. Sample-rate conversion belongs to the
/// device or an outer chain, not this crate.
fn pick_output_config(
    device: &cpal::Device,
    format: AudioFormat,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges = device
        .supported_output_configs()
        .context("query output configs")?;

    let mut best: Option<(u8, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        if range.channels() != format.channels {
            continue;
        }
        if range.min_sample_rate().0 > format.sample_rate
            || range.max_sample_rate().0 < format.sample_rate
        {
            continue;
        }
        let rank = sample_format_rank(range.sample_format());
        if best.as_ref().map_or(true, |(b, _)| rank < *b) {
            let cfg = range.with_sample_rate(cpal::SampleRate(format.sample_rate));
            best = Some((rank, cfg));
        }
    }

    best.map(|(_, cfg)| cfg).ok_or_else(|| {
        anyhow!(
            "no output config supports {} Hz / {} ch",
            format.sample_rate,
            format.channels
        )
    })
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 4,
    }
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    source: RenderSource,
    running: Arc<AtomicBool>,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut planes: Vec<Vec<f32>> = vec![vec![0.0; SCRATCH_FRAMES]; channels];

    let err_fn = |err| tracing::warn!("output stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let total_frames = data.len() / channels;
            let mut done = 0;
            while done < total_frames {
                let frames = (total_frames - done).min(SCRATCH_FRAMES);

                {
                    let mut refs: Vec<&mut [f32]> =
                        planes.iter_mut().map(|p| &mut p[..frames]).collect();
                    source.render(&mut refs, frames);
                }

                for frame in 0..frames {
                    let base = (done + frame) * channels;
                    for (ch, plane) in planes.iter().enumerate() {
                        data[base + ch] = T::from_sample(plane[frame]);
                    }
                }

                if source.post_render() == PostRenderAction::StreamEnded {
                    // The device keeps pulling silence until the controller
                    // stops it; only the running flag flips here.
                    running.store(false, Ordering::SeqCst);
                }

                done += frames;
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}
