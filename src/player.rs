//! The player controller: orchestration surface for the decode, render,
//! and collection threads.
//!
//! The controller owns the shared engine core and the collector's lifetime.
//! Decode workers are detached and chain themselves at end of stream; the
//! realtime thread is owned by the host sink. All public operations run on
//! the caller's thread and are cheap: the heavy lifting happens on the
//! pipeline threads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

use crate::collector;
use crate::config::EngineConfig;
use crate::decoder::{AudioFormat, ChannelLayout, Decoder, EventsHandle};
use crate::error::{PlayerError, Result};
use crate::render::RenderSource;
use crate::ring::RingBuffer;
use crate::sink::AudioSink;
use crate::state::{ActiveDecoderTable, DecoderState};
use crate::sync::Semaphore;
use crate::worker;

/// A decoder accepted by the controller but not yet claimed by a worker.
pub(crate) struct PendingDecoder {
    pub(crate) decoder: Box<dyn Decoder>,
    pub(crate) events: Option<EventsHandle>,
}

/// The stream format fixed by the first `play`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BoundFormat {
    pub(crate) format: AudioFormat,
    pub(crate) layout: ChannelLayout,
}

/// State shared by every pipeline thread.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    /// Allocated at the first format bind; never reconfigured afterwards.
    pub(crate) ring: OnceLock<RingBuffer>,
    pub(crate) bound: Mutex<Option<BoundFormat>>,
    pub(crate) table: ActiveDecoderTable,
    /// FIFO of accepted decoders. Never touched by the realtime thread.
    pub(crate) queue: Mutex<VecDeque<PendingDecoder>>,
    /// Frames stored into the ring over the whole play session.
    pub(crate) frames_decoded: AtomicI64,
    /// Frames handed to the render callback over the whole play session.
    pub(crate) frames_rendered: AtomicI64,
    /// Absolute frame index the next admitted decoder starts at.
    pub(crate) next_timestamp: AtomicI64,
    /// Frames moved by the most recent render pass. Written only on the
    /// realtime thread; read back by post-render accounting there.
    pub(crate) frames_rendered_last_pass: AtomicI64,
    pub(crate) decoder_sem: Semaphore,
    pub(crate) collector_sem: Semaphore,
    pub(crate) keep_collecting: AtomicBool,
    pub(crate) playing: AtomicBool,
    /// Workers spawned and not yet exited. Raised before each worker
    /// thread starts, so "idle" (nothing live, nothing queued, no worker
    /// in flight) is observable without racing a worker's startup.
    pub(crate) workers_active: AtomicUsize,
    /// Worker-side handle for resetting the downstream chain on seek.
    pub(crate) sink: OnceLock<Arc<dyn AudioSink>>,
}

impl Shared {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            ring: OnceLock::new(),
            bound: Mutex::new(None),
            table: ActiveDecoderTable::new(),
            queue: Mutex::new(VecDeque::new()),
            frames_decoded: AtomicI64::new(0),
            frames_rendered: AtomicI64::new(0),
            next_timestamp: AtomicI64::new(0),
            frames_rendered_last_pass: AtomicI64::new(0),
            decoder_sem: Semaphore::new(),
            collector_sem: Semaphore::new(),
            keep_collecting: AtomicBool::new(true),
            playing: AtomicBool::new(false),
            workers_active: AtomicUsize::new(0),
            sink: OnceLock::new(),
        }
    }

    fn reset_counters(&self) {
        self.frames_decoded.store(0, Ordering::SeqCst);
        self.frames_rendered.store(0, Ordering::SeqCst);
        self.next_timestamp.store(0, Ordering::SeqCst);
        self.frames_rendered_last_pass.store(0, Ordering::SeqCst);
    }
}

/// Gapless audio player.
///
/// Feed it decoders; it concatenates them into one uninterrupted stream.
/// `play` replaces whatever is active, `enqueue` appends a format-matched
/// successor for gapless handoff.
pub struct Player {
    shared: Arc<Shared>,
    sink: Arc<dyn AudioSink>,
    collector: Option<JoinHandle<()>>,
}

impl Player {
    /// Build a player around an audio sink. Binds the realtime render
    /// source into the sink and launches the collector thread.
    pub fn new(config: EngineConfig, sink: Arc<dyn AudioSink>) -> Result<Self> {
        let shared = Arc::new(Shared::new(config));
        let _ = shared.sink.set(Arc::clone(&sink));

        sink.bind(RenderSource { shared: Arc::clone(&shared) });

        let collector =
            collector::spawn(Arc::clone(&shared)).map_err(PlayerError::WorkerSpawnFailed)?;

        Ok(Self {
            shared,
            sink,
            collector: Some(collector),
        })
    }

    /// Replace the active stream with `decoder` and start playback.
    pub fn play(&self, decoder: Box<dyn Decoder>) -> Result<()> {
        self.play_with_events(decoder, None)
    }

    /// [`play`](Self::play) with notification hooks attached.
    pub fn play_with_events(
        &self,
        decoder: Box<dyn Decoder>,
        events: Option<EventsHandle>,
    ) -> Result<()> {
        if self.sink.is_running() {
            self.sink
                .stop()
                .map_err(|e| PlayerError::SinkFailed(e.to_string()))?;
        }

        self.stop_active_decoders();
        self.sink.reset();
        self.shared.reset_counters();

        let format = decoder.format();
        let layout = decoder.channel_layout();

        // Bind (or verify) the stream format. The ring's channel count is
        // fixed for the player's lifetime; reconfiguring it under a live
        // render callback is not supported.
        {
            let mut bound = self.shared.bound.lock().unwrap();
            if let Some(existing) = bound.as_ref() {
                if existing.format.channels != format.channels {
                    return Err(PlayerError::FormatMismatch {
                        expected: existing.format,
                        actual: format,
                        decoder,
                    });
                }
            }
            self.shared.ring.get_or_init(|| {
                RingBuffer::new(format.channels as usize, self.shared.config.capacity_frames)
            });
            *bound = Some(BoundFormat { format, layout });
        }

        self.sink
            .set_format(format, layout)
            .map_err(|e| PlayerError::SinkFailed(e.to_string()))?;

        self.shared
            .queue
            .lock()
            .unwrap()
            .push_front(PendingDecoder { decoder, events });

        worker::spawn(Arc::clone(&self.shared))?;

        self.shared.playing.store(true, Ordering::SeqCst);
        self.sink
            .start()
            .map_err(|e| PlayerError::SinkFailed(e.to_string()))?;

        Ok(())
    }

    /// Append `decoder` for gapless playback after everything already
    /// accepted. Degrades to [`play`](Self::play) when the player is idle.
    ///
    /// The decoder must match the bound sample rate and channel count, and
    /// (by default) the bound channel layout; rejections return it to the
    /// caller inside the error.
    pub fn enqueue(&self, decoder: Box<dyn Decoder>) -> Result<()> {
        self.enqueue_with_events(decoder, None)
    }

    /// [`enqueue`](Self::enqueue) with notification hooks attached.
    pub fn enqueue_with_events(
        &self,
        decoder: Box<dyn Decoder>,
        events: Option<EventsHandle>,
    ) -> Result<()> {
        let idle = self.shared.table.current().is_none()
            && self.shared.queue.lock().unwrap().is_empty()
            && self.shared.workers_active.load(Ordering::SeqCst) == 0;
        if idle {
            return self.play_with_events(decoder, events);
        }

        let bound = *self.shared.bound.lock().unwrap();
        let Some(bound) = bound else {
            return self.play_with_events(decoder, events);
        };

        let format = decoder.format();
        if format.sample_rate != bound.format.sample_rate
            || format.channels != bound.format.channels
        {
            return Err(PlayerError::FormatMismatch {
                expected: bound.format,
                actual: format,
                decoder,
            });
        }
        if self.shared.config.require_channel_layout_match
            && decoder.channel_layout() != bound.layout
        {
            return Err(PlayerError::ChannelLayoutMismatch { decoder });
        }

        self.shared
            .queue
            .lock()
            .unwrap()
            .push_back(PendingDecoder { decoder, events });

        // If every live decoder has already finished producing, no worker
        // is left to notice the queue at end of stream; chain one here.
        // A racing worker is harmless: whichever finds the queue empty
        // exits without side effects.
        if !self.shared.table.any_decoding() {
            worker::spawn(Arc::clone(&self.shared))?;
        }

        Ok(())
    }

    /// Drop every queued decoder. Active decoders are untouched.
    pub fn clear_queue(&self) {
        self.shared.queue.lock().unwrap().clear();
    }

    /// Request a seek of the current decoder to `frame`. The seek resolves
    /// asynchronously on the decode worker; in-flight ring contents are
    /// discarded.
    pub fn seek_to_frame(&self, frame: i64) -> Result<()> {
        let state = self.current_state().ok_or(PlayerError::NothingPlaying)?;
        if !state.seekable() {
            return Err(PlayerError::SeekUnsupported);
        }
        state.request_seek(frame.max(0));
        self.shared.decoder_sem.signal();
        Ok(())
    }

    /// Seek forward by `seconds` at the current decoder's sample rate.
    pub fn seek_forward(&self, seconds: f64) -> Result<()> {
        let state = self.current_state().ok_or(PlayerError::NothingPlaying)?;
        let rate = state.format().sample_rate as f64;
        let current = state.seek_target().unwrap_or_else(|| state.frames_rendered());
        let desired = current.saturating_add((seconds * rate) as i64);
        self.seek_to_frame(clamp_to_total(desired, state.total_frames()))
    }

    /// Seek backward by `seconds` at the current decoder's sample rate.
    pub fn seek_backward(&self, seconds: f64) -> Result<()> {
        let state = self.current_state().ok_or(PlayerError::NothingPlaying)?;
        let rate = state.format().sample_rate as f64;
        let current = state.seek_target().unwrap_or_else(|| state.frames_rendered());
        let desired = current.saturating_sub((seconds * rate) as i64);
        self.seek_to_frame(desired.max(0))
    }

    /// Seek to an absolute position in seconds within the current decoder.
    pub fn seek_to_time(&self, seconds: f64) -> Result<()> {
        let state = self.current_state().ok_or(PlayerError::NothingPlaying)?;
        let rate = state.format().sample_rate as f64;
        let desired = ((seconds * rate) as i64).max(0);
        self.seek_to_frame(clamp_to_total(desired, state.total_frames()))
    }

    /// Playback position within the current decoder, in frames. A pending
    /// seek target reports as the position. `None` when nothing is live.
    pub fn current_frame(&self) -> Option<i64> {
        let state = self.current_state()?;
        Some(state.seek_target().unwrap_or_else(|| state.frames_rendered()))
    }

    /// Frame total of the current decoder; `None` when nothing is live or
    /// the stream length is still unknown.
    pub fn total_frames(&self) -> Option<i64> {
        self.current_state()?.total_frames()
    }

    /// Playback position within the current decoder, in seconds.
    pub fn current_time(&self) -> Option<f64> {
        let state = self.current_state()?;
        let frame = state.seek_target().unwrap_or_else(|| state.frames_rendered());
        Some(frame as f64 / state.format().sample_rate as f64)
    }

    /// Duration of the current decoder, in seconds.
    pub fn total_time(&self) -> Option<f64> {
        let state = self.current_state()?;
        let total = state.total_frames()?;
        Some(total as f64 / state.format().sample_rate as f64)
    }

    /// Resume (or begin) pulling audio through the sink.
    pub fn start(&self) -> Result<()> {
        self.shared.playing.store(true, Ordering::SeqCst);
        self.sink
            .start()
            .map_err(|e| PlayerError::SinkFailed(e.to_string()))
    }

    /// Stop pulling audio without discarding any pipeline state.
    pub fn pause(&self) -> Result<()> {
        self.sink
            .stop()
            .map_err(|e| PlayerError::SinkFailed(e.to_string()))
    }

    /// Tear the stream down: cancel active decoders, flush the sink, and
    /// zero every counter.
    pub fn stop(&self) -> Result<()> {
        self.pause()?;
        self.stop_active_decoders();
        self.sink.reset();
        self.shared.reset_counters();
        self.shared.playing.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::SeqCst) && self.sink.is_running()
    }

    /// The state the render cursor is currently inside.
    fn current_state(&self) -> Option<Arc<DecoderState>> {
        self.shared.table.current()
    }

    /// Cancel every live decoder and wake both pipeline threads so the
    /// workers exit and the collector reaps.
    fn stop_active_decoders(&self) {
        self.shared.table.stop_all();
        self.shared.decoder_sem.signal();
        self.shared.collector_sem.signal();
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        let _ = self.sink.stop();

        self.shared.table.stop_all();
        self.shared.decoder_sem.signal();

        self.shared.keep_collecting.store(false, Ordering::SeqCst);
        self.shared.collector_sem.signal();
        if let Some(collector) = self.collector.take() {
            let _ = collector.join();
        }

        // The collector swept on its way out; clear whatever raced past it
        // and drop any decoders still queued.
        self.shared.table.clear();
        self.shared.queue.lock().unwrap().clear();
    }
}

fn clamp_to_total(desired: i64, total: Option<i64>) -> i64 {
    match total {
        Some(total) => desired.min(total),
        None => desired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{PlaybackEvents, SampleBuffer};
    use crate::render::{PostRenderAction, RenderOutcome};
    use crate::sink::SinkError;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Deterministic in-memory decoder. Sample value at decoder frame `i`
    /// is `base + i`, identical on every channel, so continuity across
    /// decoder boundaries is checkable to the sample.
    struct ScriptedDecoder {
        format: AudioFormat,
        layout: ChannelLayout,
        total: i64,
        declared_total: Option<i64>,
        seekable: bool,
        position: i64,
        base: f32,
    }

    impl ScriptedDecoder {
        fn new(total: i64, base: f32) -> Self {
            Self {
                format: AudioFormat { sample_rate: 44_100, channels: 2 },
                layout: ChannelLayout::STEREO,
                total,
                declared_total: Some(total),
                seekable: true,
                position: 0,
                base,
            }
        }

        fn with_format(mut self, sample_rate: u32, channels: u16) -> Self {
            self.format = AudioFormat { sample_rate, channels };
            self
        }

        fn with_layout(mut self, layout: ChannelLayout) -> Self {
            self.layout = layout;
            self
        }

        fn non_seekable(mut self) -> Self {
            self.seekable = false;
            self
        }
    }

    impl Decoder for ScriptedDecoder {
        fn format(&self) -> AudioFormat {
            self.format
        }
        fn channel_layout(&self) -> ChannelLayout {
            self.layout
        }
        fn total_frames(&self) -> Option<i64> {
            self.declared_total
        }
        fn supports_seeking(&self) -> bool {
            self.seekable
        }
        fn seek_to_frame(&mut self, frame: i64) -> Option<i64> {
            if !self.seekable {
                return None;
            }
            // Container seeks are not instant; a little latency keeps the
            // pending-target window observable.
            thread::sleep(Duration::from_millis(10));
            self.position = frame.clamp(0, self.total);
            Some(self.position)
        }
        fn current_frame(&self) -> i64 {
            self.position
        }
        fn read_audio(&mut self, buf: &mut SampleBuffer, max_frames: usize) -> usize {
            let remaining = (self.total - self.position).max(0) as usize;
            let frames = remaining.min(max_frames);
            for ch in 0..buf.channels() {
                for i in 0..frames {
                    buf.plane_mut(ch)[i] = self.base + (self.position + i as i64) as f32;
                }
            }
            self.position += frames as i64;
            frames
        }
    }

    /// Counts notification firings.
    #[derive(Default)]
    struct Recorder {
        decoding_started: AtomicUsize,
        decoding_finished: AtomicUsize,
        rendering_started: AtomicUsize,
        rendering_finished: AtomicUsize,
    }

    impl Recorder {
        fn counts(&self) -> (usize, usize, usize, usize) {
            (
                self.decoding_started.load(Ordering::SeqCst),
                self.decoding_finished.load(Ordering::SeqCst),
                self.rendering_started.load(Ordering::SeqCst),
                self.rendering_finished.load(Ordering::SeqCst),
            )
        }
    }

    impl PlaybackEvents for Recorder {
        fn decoding_started(&self) {
            self.decoding_started.fetch_add(1, Ordering::SeqCst);
        }
        fn decoding_finished(&self) {
            self.decoding_finished.fetch_add(1, Ordering::SeqCst);
        }
        fn rendering_started(&self) {
            self.rendering_started.fetch_add(1, Ordering::SeqCst);
        }
        fn rendering_finished(&self) {
            self.rendering_finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A sink pumped by the test instead of an audio device.
    struct TestSink {
        channels: usize,
        source: Mutex<Option<RenderSource>>,
        running: AtomicBool,
        resets: AtomicUsize,
        formats_set: Mutex<Vec<AudioFormat>>,
    }

    impl TestSink {
        fn new(channels: usize) -> Arc<Self> {
            Arc::new(Self {
                channels,
                source: Mutex::new(None),
                running: AtomicBool::new(false),
                resets: AtomicUsize::new(0),
                formats_set: Mutex::new(Vec::new()),
            })
        }

        /// Run one render callback plus post-render accounting, as the
        /// realtime thread would.
        fn render_pass(&self, frames: usize) -> (Vec<Vec<f32>>, RenderOutcome, PostRenderAction) {
            let source = self.source.lock().unwrap().clone().expect("source bound");
            let mut planes = vec![vec![-1.0f32; frames]; self.channels];
            let outcome = {
                let mut refs: Vec<&mut [f32]> =
                    planes.iter_mut().map(|p| p.as_mut_slice()).collect();
                source.render(&mut refs, frames)
            };
            let action = source.post_render();
            (planes, outcome, action)
        }

        fn reset_count(&self) -> usize {
            self.resets.load(Ordering::SeqCst)
        }
    }

    impl AudioSink for TestSink {
        fn bind(&self, source: RenderSource) {
            *self.source.lock().unwrap() = Some(source);
        }
        fn set_format(&self, format: AudioFormat, _layout: ChannelLayout) -> std::result::Result<(), SinkError> {
            self.formats_set.lock().unwrap().push(format);
            Ok(())
        }
        fn start(&self) -> std::result::Result<(), SinkError> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn stop(&self) -> std::result::Result<(), SinkError> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
        fn reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn assert_counter_invariants(shared: &Shared) {
        let decoded = shared.frames_decoded.load(Ordering::SeqCst);
        let rendered = shared.frames_rendered.load(Ordering::SeqCst);
        assert!(rendered >= 0, "rendered cursor went negative: {rendered}");
        assert!(
            rendered <= decoded,
            "rendered {rendered} overtook decoded {decoded}"
        );
        assert!(
            decoded - rendered <= shared.config.capacity_frames as i64,
            "ring overfilled: {} frames in flight",
            decoded - rendered
        );
    }

    #[test]
    fn silent_start_renders_zeros_without_moving_the_cursor() {
        let sink = TestSink::new(2);
        let player = Player::new(EngineConfig::default(), sink.clone()).unwrap();

        let (planes, outcome, action) = sink.render_pass(512);

        assert_eq!(outcome, RenderOutcome::Silence);
        assert_eq!(action, PostRenderAction::Continue);
        assert!(planes.iter().all(|p| p.iter().all(|&s| s == 0.0)));
        assert_eq!(player.shared.frames_rendered.load(Ordering::SeqCst), 0);
        assert_eq!(player.current_frame(), None);
    }

    #[test]
    fn single_decoder_drains_exactly_and_is_collected() {
        let sink = TestSink::new(2);
        let player = Player::new(EngineConfig::default(), sink.clone()).unwrap();
        let events = Arc::new(Recorder::default());

        player
            .play_with_events(Box::new(ScriptedDecoder::new(4096, 0.0)), Some(events.clone()))
            .unwrap();

        // The whole stream fits in the ring, so the worker decodes to EOS
        // and advances the next starting timestamp before exiting.
        wait_until("decoder EOS", || {
            player.shared.next_timestamp.load(Ordering::SeqCst) == 4096
        });
        assert_eq!(player.shared.frames_decoded.load(Ordering::SeqCst), 4096);
        assert_eq!(player.total_frames(), Some(4096));

        for pass in 0..4usize {
            let (planes, outcome, action) = sink.render_pass(1024);
            assert_eq!(outcome, RenderOutcome::Rendered(1024), "pass {pass}");
            for i in 0..1024 {
                assert_eq!(planes[0][i], (pass * 1024 + i) as f32);
            }
            if pass < 3 {
                assert_eq!(action, PostRenderAction::Continue);
            } else {
                assert_eq!(action, PostRenderAction::StreamEnded);
            }
        }

        assert_eq!(events.counts(), (1, 1, 1, 1));

        wait_until("collector reclaims the state", || {
            player.shared.table.is_empty()
        });
        assert_eq!(player.current_frame(), None);
        assert!(!player.is_playing());
        assert_eq!(player.shared.frames_decoded.load(Ordering::SeqCst), 0);
        assert_eq!(player.shared.frames_rendered.load(Ordering::SeqCst), 0);
        assert_eq!(player.shared.next_timestamp.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn gapless_handoff_is_sample_exact_across_the_boundary() {
        let sink = TestSink::new(2);
        let player = Player::new(EngineConfig::default(), sink.clone()).unwrap();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());

        player
            .play_with_events(Box::new(ScriptedDecoder::new(1000, 0.0)), Some(first.clone()))
            .unwrap();
        player
            .enqueue_with_events(
                Box::new(ScriptedDecoder::new(500, 10_000.0)),
                Some(second.clone()),
            )
            .unwrap();

        wait_until("both decoders EOS", || {
            player.shared.next_timestamp.load(Ordering::SeqCst) == 1500
        });
        assert_eq!(player.shared.frames_decoded.load(Ordering::SeqCst), 1500);

        // Pass 1: frames [0, 512) all from the first decoder.
        let (planes, outcome, _) = sink.render_pass(512);
        assert_eq!(outcome, RenderOutcome::Rendered(512));
        for i in 0..512 {
            assert_eq!(planes[0][i], i as f32);
        }
        assert_eq!(first.counts().2, 1, "first decoder rendering started");
        assert_eq!(first.counts().3, 0);

        // Pass 2 straddles the boundary: 488 frames finish the first
        // decoder, 24 frames open the second, no silence in between.
        let (planes, outcome, action) = sink.render_pass(512);
        assert_eq!(outcome, RenderOutcome::Rendered(512));
        assert_eq!(action, PostRenderAction::Continue);
        for i in 0..488 {
            assert_eq!(planes[0][i], (512 + i) as f32);
        }
        for i in 0..24 {
            assert_eq!(planes[1][488 + i], 10_000.0 + i as f32);
        }
        assert_eq!(first.counts().3, 1, "first decoder finished in pass 2");
        assert_eq!(second.counts().2, 1, "second decoder started in pass 2");

        // Pass 3 drains the remaining 476 frames; the tail is zero-filled.
        let (planes, outcome, action) = sink.render_pass(512);
        assert_eq!(outcome, RenderOutcome::Rendered(476));
        assert_eq!(action, PostRenderAction::StreamEnded);
        for i in 0..476 {
            assert_eq!(planes[0][i], 10_024.0 + i as f32);
        }
        assert!(planes[0][476..].iter().all(|&s| s == 0.0));

        assert_eq!(first.counts(), (1, 1, 1, 1));
        assert_eq!(second.counts(), (1, 1, 1, 1));

        wait_until("both states collected", || player.shared.table.is_empty());
    }

    #[test]
    fn seek_under_playback_rewrites_counters_and_resumes_from_target() {
        let sink = TestSink::new(2);
        let player = Player::new(EngineConfig::default(), sink.clone()).unwrap();

        player
            .play(Box::new(ScriptedDecoder::new(100_000, 0.0)))
            .unwrap();

        // Render forward to roughly the 20k mark, letting the worker refill
        // behind us. Passes only run with a full pass of audio available,
        // which keeps both cursors chunk-aligned.
        let mut passes = 0;
        while player.shared.frames_rendered.load(Ordering::SeqCst) < 20_000 {
            let available = player.shared.frames_decoded.load(Ordering::SeqCst)
                - player.shared.frames_rendered.load(Ordering::SeqCst);
            if available < 1024 {
                thread::sleep(Duration::from_millis(1));
            } else {
                let (_, outcome, _) = sink.render_pass(1024);
                assert_eq!(outcome, RenderOutcome::Rendered(1024));
                assert_counter_invariants(&player.shared);
            }
            passes += 1;
            assert!(passes < 10_000, "render never reached the 20k mark");
        }

        // Let the worker top the ring off and park on the semaphore so the
        // seek transit below happens at a quiet point.
        let capacity = player.shared.config.capacity_frames as i64;
        wait_until("ring refills to capacity", || {
            let shared = &player.shared;
            shared.frames_decoded.load(Ordering::SeqCst)
                - shared.frames_rendered.load(Ordering::SeqCst)
                == capacity
        });

        let state = player.current_state().unwrap();
        player.seek_to_frame(5000).unwrap();
        assert_eq!(player.current_frame(), Some(5000), "pending target reports");

        // The worker only reaches the seek once a whole chunk of ring
        // space is free; one more pass opens it.
        sink.render_pass(2048);
        wait_until("seek transits on the worker", || {
            state.seek_target().is_none() && sink.reset_count() > 0
        });

        assert_eq!(state.frames_rendered(), 5000);

        // The skipped span was folded into both global counters and the
        // ring was flushed: decode and render cursors meet at the target.
        wait_until("worker decodes past the target", || {
            player.shared.frames_decoded.load(Ordering::SeqCst)
                > player.shared.frames_rendered.load(Ordering::SeqCst)
        });
        assert_eq!(
            player.shared.frames_rendered.load(Ordering::SeqCst),
            5000,
            "render cursor snapped to the landed frame"
        );

        let (planes, outcome, _) = sink.render_pass(512);
        assert_eq!(outcome, RenderOutcome::Rendered(512));
        for i in 0..512 {
            assert_eq!(planes[0][i], 5000.0 + i as f32);
        }
        assert_eq!(player.current_frame(), Some(5512));

        player.stop().unwrap();
    }

    #[test]
    fn mismatched_enqueue_is_rejected_and_playback_continues() {
        let sink = TestSink::new(2);
        let player = Player::new(EngineConfig::default(), sink.clone()).unwrap();

        player
            .play(Box::new(ScriptedDecoder::new(100_000, 0.0)))
            .unwrap();
        wait_until("first decoder starts producing", || {
            player.shared.frames_decoded.load(Ordering::SeqCst) > 0
        });

        // Different sample rate.
        let err = player
            .enqueue(Box::new(
                ScriptedDecoder::new(1000, 0.0).with_format(48_000, 2),
            ))
            .unwrap_err();
        assert!(matches!(err, PlayerError::FormatMismatch { .. }));

        // Same rate and channel count, different layout.
        let err = player
            .enqueue(Box::new(
                ScriptedDecoder::new(1000, 0.0).with_layout(ChannelLayout(0b101)),
            ))
            .unwrap_err();
        assert!(matches!(err, PlayerError::ChannelLayoutMismatch { .. }));

        assert_eq!(player.shared.queue.lock().unwrap().len(), 0);
        assert!(player.is_playing());
        // Only the initial play programmed the sink.
        assert_eq!(sink.formats_set.lock().unwrap().len(), 1);
        let (_, outcome, _) = sink.render_pass(512);
        assert_eq!(outcome, RenderOutcome::Rendered(512));

        player.stop().unwrap();
    }

    #[test]
    fn stop_clears_counters_workers_and_states() {
        let sink = TestSink::new(2);
        let player = Player::new(EngineConfig::default(), sink.clone()).unwrap();

        player
            .play(Box::new(ScriptedDecoder::new(1_000_000, 0.0)))
            .unwrap();

        // Let the worker fill the ring completely so it parks on the
        // semaphore; stop() then wakes it into a clean exit.
        let capacity = player.shared.config.capacity_frames as i64;
        wait_until("ring fills", || {
            player.shared.frames_decoded.load(Ordering::SeqCst) == capacity
        });
        sink.render_pass(2048);
        wait_until("worker tops the ring back up", || {
            let shared = &player.shared;
            shared.frames_decoded.load(Ordering::SeqCst)
                - shared.frames_rendered.load(Ordering::SeqCst)
                == capacity
        });

        player.stop().unwrap();

        assert_eq!(player.shared.frames_decoded.load(Ordering::SeqCst), 0);
        assert_eq!(player.shared.frames_rendered.load(Ordering::SeqCst), 0);
        assert_eq!(player.shared.next_timestamp.load(Ordering::SeqCst), 0);
        assert!(!player.is_playing());
        assert!(!sink.is_running());

        wait_until("all states collected", || player.shared.table.is_empty());
        assert_eq!(player.current_frame(), None);

        // The render callback sees an empty pipeline again.
        let (_, outcome, _) = sink.render_pass(512);
        assert_eq!(outcome, RenderOutcome::Silence);
    }

    #[test]
    fn seek_on_non_seekable_decoder_is_rejected() {
        let sink = TestSink::new(2);
        let player = Player::new(EngineConfig::default(), sink.clone()).unwrap();

        player
            .play(Box::new(ScriptedDecoder::new(100_000, 0.0).non_seekable()))
            .unwrap();
        wait_until("decoder admitted", || player.current_frame().is_some());

        assert!(matches!(
            player.seek_to_frame(5000),
            Err(PlayerError::SeekUnsupported)
        ));

        player.stop().unwrap();
    }

    #[test]
    fn seek_with_nothing_playing_is_rejected() {
        let sink = TestSink::new(2);
        let player = Player::new(EngineConfig::default(), sink).unwrap();
        assert!(matches!(
            player.seek_to_frame(0),
            Err(PlayerError::NothingPlaying)
        ));
    }

    #[test]
    fn time_based_seeks_clamp_and_convert() {
        let sink = TestSink::new(2);
        let player = Player::new(EngineConfig::default(), sink.clone()).unwrap();

        player
            .play(Box::new(ScriptedDecoder::new(44_100, 0.0)))
            .unwrap();
        wait_until("decoder admitted", || player.current_frame().is_some());
        // With the ring full the worker parks, so published targets stay
        // pending and observable.
        wait_until("ring fills", || {
            player.shared.frames_decoded.load(Ordering::SeqCst)
                == player.shared.config.capacity_frames as i64
        });
        let state = player.current_state().unwrap();

        // 10 s forward from frame 0 clamps to the one-second total.
        player.seek_forward(10.0).unwrap();
        assert_eq!(state.seek_target(), Some(44_100));

        // Absolute half-second lands mid-stream.
        player.seek_to_time(0.5).unwrap();
        assert_eq!(state.seek_target(), Some(22_050));

        // Far backward clamps to zero.
        player.seek_backward(100.0).unwrap();
        assert_eq!(state.seek_target(), Some(0));

        player.stop().unwrap();
    }

    #[test]
    fn counter_invariants_hold_under_concurrent_render() {
        let sink = TestSink::new(2);
        let player = Player::new(EngineConfig::default(), sink.clone()).unwrap();

        player
            .play(Box::new(ScriptedDecoder::new(200_000, 0.0)))
            .unwrap();

        // Pump render passes while the worker decodes underneath.
        let mut rendered_any = false;
        for _ in 0..300 {
            let (_, outcome, _) = sink.render_pass(512);
            rendered_any |= matches!(outcome, RenderOutcome::Rendered(_));
            assert_counter_invariants(&player.shared);
        }
        assert!(rendered_any);

        player.stop().unwrap();
    }

    #[test]
    fn clear_queue_leaves_the_active_decoder_alone() {
        let sink = TestSink::new(2);
        let player = Player::new(EngineConfig::default(), sink.clone()).unwrap();

        player
            .play(Box::new(ScriptedDecoder::new(1_000_000, 0.0)))
            .unwrap();
        wait_until("first decoder starts producing", || {
            player.shared.frames_decoded.load(Ordering::SeqCst) > 0
        });

        player
            .enqueue(Box::new(ScriptedDecoder::new(1000, 0.0)))
            .unwrap();
        assert_eq!(player.shared.queue.lock().unwrap().len(), 1);

        player.clear_queue();
        assert_eq!(player.shared.queue.lock().unwrap().len(), 0);
        assert!(player.current_frame().is_some());

        player.stop().unwrap();
    }

    #[test]
    fn enqueue_after_decode_finished_still_chains_gaplessly() {
        let sink = TestSink::new(2);
        let player = Player::new(EngineConfig::default(), sink.clone()).unwrap();

        player
            .play(Box::new(ScriptedDecoder::new(1000, 0.0)))
            .unwrap();
        // The first worker is certainly done producing by the time this
        // enqueue lands, so the controller must chain the worker itself.
        wait_until("first decoder EOS", || {
            player.shared.next_timestamp.load(Ordering::SeqCst) == 1000
        });

        player
            .enqueue(Box::new(ScriptedDecoder::new(500, 10_000.0)))
            .unwrap();
        wait_until("second decoder EOS", || {
            player.shared.next_timestamp.load(Ordering::SeqCst) == 1500
        });

        // Frame 1000 is the first decoder's last plus one, value-continuous
        // with the second decoder's frame 0.
        let (planes, outcome, _) = sink.render_pass(1024);
        assert_eq!(outcome, RenderOutcome::Rendered(1024));
        assert_eq!(planes[0][999], 999.0);
        assert_eq!(planes[0][1000], 10_000.0);
    }
}
