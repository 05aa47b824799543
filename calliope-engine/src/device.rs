//! The generic software-synthesis device: one backend, one event source,
//! one authoritative sample clock.
//!
//! The device owns the render loop. Each render cycle converts the time it is
//! about to render into the source's tick budget, pulls due records, hands
//! them to the backend, then asks the backend for exactly the frames covering
//! the gap to the next event. Event dispatch and rendering are strictly
//! sequential; the backend is never entered twice concurrently.
//!
//! Design goals
//! - No allocations on the steady-state render path: a fixed event-word
//!   buffer sized at `open` and a reusable long-payload scratch
//! - Event-to-frame conversion through a u128 numerator/remainder accumulator,
//!   so arbitrarily long playback never drifts off the sample clock
//! - `close` is safe from any state, any number of times

use calliope_core::stream::EventSource;
use calliope_core::wire::{
    event_kind, event_param, short_param1, short_param2, short_status, unpack_bytes,
    words_for_bytes, EVENT_LONG, EVENT_NOP, EVENT_SHORT, EVENT_TEMPO,
};

use crate::backend::{SynthBackend, CHANNELS};
use crate::error::DeviceError;

/// Words of pre-pulled event stream the device holds between render slices.
/// Also bounds the largest long-event payload a source can deliver.
const EVENT_BUFFER_WORDS: usize = 4096;

/// Default per-channel volume, reapplied on open and on every restart.
const DEFAULT_CHANNEL_VOLUME: u8 = 100;

/// MIDI channel count tracked by the device.
const MIDI_CHANNELS: usize = 16;

/// Lifecycle of a device: Closed -> Open -> Running -> Closed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    Open,
    Running,
}

/// A software-synthesis playback device.
///
/// Generic over nothing: backends arrive as trait objects picked at
/// construction time, sources arrive at [`play`](Self::play). One device owns
/// one backend exclusively for its whole life.
pub struct SoftSynthDevice {
    backend: Box<dyn SynthBackend>,
    state: DeviceState,
    sample_rate: u32,

    source: Option<Box<dyn EventSource>>,
    looping: bool,
    ended: bool,

    /// Per-channel CC7 volumes; informational mirror of the stream state.
    channel_volumes: [u8; MIDI_CHANNELS],

    // pre-pulled stream words and the cursor into them
    events: Vec<u32>,
    ev_pos: usize,
    ev_len: usize,
    long_scratch: Vec<u8>,

    /// Frames until the record at `ev_pos` is due; `None` when not yet
    /// converted (conversion touches the drift accumulator exactly once).
    pending_frames: Option<u64>,
    /// Remainder numerator of the tick-to-frame conversion, in units of
    /// tick x tempo x sample_rate.
    clock_frac: u128,
}

impl SoftSynthDevice {
    /// Wrap a backend. The device starts Closed; call [`open`](Self::open).
    pub fn new(backend: Box<dyn SynthBackend>, sample_rate: u32) -> Self {
        Self {
            backend,
            state: DeviceState::Closed,
            sample_rate: sample_rate.max(1),
            source: None,
            looping: false,
            ended: false,
            channel_volumes: [DEFAULT_CHANNEL_VOLUME; MIDI_CHANNELS],
            events: Vec::new(),
            ev_pos: 0,
            ev_len: 0,
            long_scratch: Vec::new(),
            pending_frames: None,
            clock_frac: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> DeviceState {
        self.state
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// True once a one-shot stream has run out of events. Looping playback
    /// never ends by itself.
    #[inline]
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Per-channel CC7 volumes as last seen in the stream.
    #[inline]
    pub fn channel_volumes(&self) -> &[u8; MIDI_CHANNELS] {
        &self.channel_volumes
    }

    /// Open the backend and reset channel state. Idempotent while open.
    pub fn open(&mut self) -> Result<(), DeviceError> {
        if self.state == DeviceState::Closed {
            self.backend.open()?;
            self.events.resize(EVENT_BUFFER_WORDS, 0);
            self.reset_channel_state();
            self.state = DeviceState::Open;
        }
        Ok(())
    }

    /// Begin playback of `source`. The stream must be valid and the device
    /// open (not already running).
    pub fn play(
        &mut self,
        source: Box<dyn EventSource>,
        looping: bool,
    ) -> Result<(), DeviceError> {
        if self.state != DeviceState::Open {
            return Err(DeviceError::WrongState {
                expected: DeviceState::Open,
                actual: self.state,
            });
        }
        if !source.is_valid() {
            return Err(DeviceError::InvalidSource);
        }
        self.source = Some(source);
        self.looping = looping;
        self.ended = false;
        self.ev_pos = 0;
        self.ev_len = 0;
        self.pending_frames = None;
        self.clock_frac = 0;
        self.reset_channel_state();
        self.state = DeviceState::Running;
        Ok(())
    }

    /// Rewind the active stream to its start: cursor, tempo seed, channel
    /// volumes, and the sample-clock remainder all reset.
    pub fn rewind(&mut self) -> Result<(), DeviceError> {
        if self.state != DeviceState::Running {
            return Err(DeviceError::WrongState {
                expected: DeviceState::Running,
                actual: self.state,
            });
        }
        if let Some(source) = self.source.as_mut() {
            source.restart();
        }
        self.reset_channel_state();
        self.ev_pos = 0;
        self.ev_len = 0;
        self.pending_frames = None;
        self.clock_frac = 0;
        self.ended = false;
        Ok(())
    }

    /// Switch between looping and one-shot playback mid-stream.
    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
        if looping {
            self.ended = false;
        }
    }

    /// Stop consuming events and drop the source. The device returns to Open
    /// and can `play` again.
    pub fn stop(&mut self) {
        if self.state == DeviceState::Running {
            self.source = None;
            self.ev_pos = 0;
            self.ev_len = 0;
            self.pending_frames = None;
            self.state = DeviceState::Open;
        }
    }

    /// Release the backend. Safe in any state, any number of times; never
    /// called concurrently with `render` by contract.
    pub fn close(&mut self) {
        self.stop();
        self.backend.close();
        self.state = DeviceState::Closed;
    }

    /// Produce `buffer.len() / 2` frames of interleaved stereo audio.
    ///
    /// Always fills the whole buffer: while Running it renders the backend
    /// (synthesis tail included after a one-shot stream ends); in any other
    /// state it fills silence. Returns the frame count written.
    pub fn render(&mut self, buffer: &mut [f32]) -> usize {
        let frames = buffer.len() / CHANNELS;
        let buffer = &mut buffer[..frames * CHANNELS];
        if self.state != DeviceState::Running {
            buffer.fill(0.0);
            return frames;
        }

        let mut done = 0;
        while done < frames {
            let remaining = (frames - done) as u64;
            if self.pending_frames.unwrap_or(0) == 0 {
                self.service_events(remaining);
            }
            let gap = self.pending_frames.unwrap_or(remaining).min(remaining);
            let slice = &mut buffer[done * CHANNELS..(done + gap as usize) * CHANNELS];
            self.backend.render(slice);
            if let Some(pending) = self.pending_frames.as_mut() {
                *pending -= gap;
            }
            done += gap as usize;
        }
        frames
    }

    /// Dispatch every record due now and schedule the next one. `budget`
    /// frames bound how much new stream data is pulled in this cycle.
    fn service_events(&mut self, budget: u64) {
        let mut restarts = 0u32;
        loop {
            if self.ev_pos >= self.ev_len {
                if !self.pump(budget, &mut restarts) {
                    return;
                }
            }
            match self.pending_frames {
                // freshly visible head record: convert its delta once
                None => {
                    let delta = self.events[self.ev_pos];
                    self.pending_frames = Some(self.ticks_to_frames(delta));
                }
                Some(0) => {
                    self.dispatch_head();
                    self.pending_frames = None;
                }
                Some(_) => return,
            }
        }
    }

    /// Refill the event buffer from the source. Returns false when nothing
    /// further will arrive in this cycle (stream ended or source stuck).
    ///
    /// Scheduling is driven by deltas, so pulling records ahead of the render
    /// clock is harmless; arriving late is not. When the granted budget has
    /// not caught up with already-consumed ticks the request is retried with
    /// a doubled budget until records flow again.
    fn pump(&mut self, budget: u64, restarts: &mut u32) -> bool {
        let base_us = ((budget.max(1) * 1_000_000) / self.sample_rate as u64).max(1);
        let mut budget_us = base_us;
        for _ in 0..48 {
            let Some(source) = self.source.as_mut() else {
                return false;
            };
            if source.check_done() {
                if self.looping {
                    // a zero-duration stream would restart forever in one cycle
                    *restarts += 1;
                    if *restarts > 1 {
                        self.pending_frames = Some(budget.max(1));
                        return false;
                    }
                    source.restart();
                    self.reset_channel_state();
                    budget_us = base_us;
                    continue;
                }
                self.ended = true;
                self.pending_frames = None;
                return false;
            }
            self.ev_len = source.make_events(&mut self.events, budget_us);
            self.ev_pos = 0;
            if self.ev_len > 0 {
                return true;
            }
            budget_us = budget_us.saturating_mul(2);
        }
        // only reachable when a record cannot fit the event buffer at all
        log::warn!("event source stalled (record larger than the event buffer?); stopping stream");
        self.ended = true;
        self.pending_frames = None;
        false
    }

    /// Consume the record at `ev_pos` and route it.
    fn dispatch_head(&mut self) {
        let event = self.events[self.ev_pos + 2];
        self.ev_pos += 3;
        match event_kind(event) {
            EVENT_SHORT => {
                let status = short_status(event);
                let param1 = short_param1(event);
                let param2 = short_param2(event);
                // CC7 mirror for channel-volume queries
                if status & 0xF0 == 0xB0 && param1 == 0x07 {
                    self.channel_volumes[(status & 0x0F) as usize] = param2.min(127);
                }
                self.backend.handle_short_event(status, param1, param2);
            }
            EVENT_TEMPO => {
                let tempo = event_param(event);
                if tempo != 0 {
                    if let Some(source) = self.source.as_mut() {
                        source.set_tempo(tempo);
                    }
                }
            }
            EVENT_NOP => {}
            EVENT_LONG => {
                let byte_len = event_param(event) as usize;
                let words = words_for_bytes(byte_len);
                let end = (self.ev_pos + words).min(self.ev_len);
                if byte_len > 0 && self.ev_pos + words <= self.ev_len {
                    let (payload, scratch) = (&self.events[self.ev_pos..end], &mut self.long_scratch);
                    unpack_bytes(payload, byte_len, scratch);
                    self.backend.handle_long_event(&self.long_scratch);
                }
                self.ev_pos = end;
            }
            other => {
                log::debug!("ignoring unknown stream event kind {other:#04x}");
            }
        }
    }

    /// Convert `ticks` of source time to frames, carrying the remainder so
    /// repeated conversions sum exactly.
    fn ticks_to_frames(&mut self, ticks: u32) -> u64 {
        let Some(source) = self.source.as_ref() else {
            return 0;
        };
        let numerator = self.clock_frac
            + ticks as u128 * source.tempo() as u128 * self.sample_rate as u128;
        let denominator = source.division() as u128 * 1_000_000;
        self.clock_frac = numerator % denominator;
        (numerator / denominator) as u64
    }

    fn reset_channel_state(&mut self) {
        self.channel_volumes = [DEFAULT_CHANNEL_VOLUME; MIDI_CHANNELS];
    }
}

impl Drop for SoftSynthDevice {
    fn drop(&mut self) {
        self.close();
    }
}

// ----------------------------- Tests -------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use calliope_core::stream::{BufferSource, StreamEvent};
    use std::sync::{Arc, Mutex};

    /// What a recording backend saw, in order.
    #[derive(Debug, PartialEq)]
    enum Call {
        Open,
        Short(u8, u8, u8),
        Long(Vec<u8>),
        Render(usize),
        Close,
    }

    #[derive(Default)]
    struct Recorder(Arc<Mutex<Vec<Call>>>);

    impl Recorder {
        fn new() -> (Self, Arc<Mutex<Vec<Call>>>) {
            let log = Arc::new(Mutex::new(Vec::new()));
            (Self(log.clone()), log)
        }
    }

    impl SynthBackend for Recorder {
        fn open(&mut self) -> Result<(), DeviceError> {
            self.0.lock().unwrap().push(Call::Open);
            Ok(())
        }
        fn handle_short_event(&mut self, status: u8, param1: u8, param2: u8) {
            self.0.lock().unwrap().push(Call::Short(status, param1, param2));
        }
        fn handle_long_event(&mut self, data: &[u8]) {
            self.0.lock().unwrap().push(Call::Long(data.to_vec()));
        }
        fn render(&mut self, buffer: &mut [f32]) -> usize {
            buffer.fill(0.25);
            self.0.lock().unwrap().push(Call::Render(buffer.len() / CHANNELS));
            buffer.len() / CHANNELS
        }
        fn close(&mut self) {
            self.0.lock().unwrap().push(Call::Close);
        }
    }

    fn device_with_recorder(sample_rate: u32) -> (SoftSynthDevice, Arc<Mutex<Vec<Call>>>) {
        let (backend, log) = Recorder::new();
        (SoftSynthDevice::new(Box::new(backend), sample_rate), log)
    }

    // division 120 at default tempo and 48 kHz: one tick is exactly
    // 48000 * 500000 / (120 * 1e6) = 200 frames, so 3 ticks = 600 frames
    fn three_tick_source() -> BufferSource {
        BufferSource::new(
            120,
            &[
                StreamEvent::short(0, 0x90, 60, 100),
                StreamEvent::short(3, 0x80, 60, 0),
            ],
        )
    }

    #[test]
    fn state_machine_walk() {
        let (mut dev, log) = device_with_recorder(48_000);
        assert_eq!(dev.state(), DeviceState::Closed);

        dev.open().unwrap();
        dev.open().unwrap(); // idempotent while open
        assert_eq!(dev.state(), DeviceState::Open);

        dev.play(Box::new(three_tick_source()), false).unwrap();
        assert_eq!(dev.state(), DeviceState::Running);

        // playing again while running is a state error
        let err = dev.play(Box::new(three_tick_source()), false);
        assert!(matches!(err, Err(DeviceError::WrongState { .. })));

        dev.close();
        dev.close(); // safe to repeat
        assert_eq!(dev.state(), DeviceState::Closed);
        assert_eq!(
            log.lock().unwrap().iter().filter(|c| matches!(c, Call::Open)).count(),
            1
        );
        assert!(log.lock().unwrap().iter().filter(|c| matches!(c, Call::Close)).count() >= 2);
    }

    #[test]
    fn rejects_invalid_source() {
        let (mut dev, _) = device_with_recorder(48_000);
        dev.open().unwrap();
        let song = calliope_core::mids::MidsSong::load(&[1, 2, 3]);
        let err = dev.play(Box::new(song), false);
        assert!(matches!(err, Err(DeviceError::InvalidSource)));
        assert_eq!(dev.state(), DeviceState::Open);
    }

    #[test]
    fn render_while_closed_is_silence() {
        let (mut dev, log) = device_with_recorder(48_000);
        let mut buf = vec![1.0f32; 64];
        assert_eq!(dev.render(&mut buf), 32);
        assert!(buf.iter().all(|&s| s == 0.0));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn events_land_on_exact_frame_boundaries() {
        let (mut dev, log) = device_with_recorder(48_000);
        dev.open().unwrap();
        dev.play(Box::new(three_tick_source()), false).unwrap();

        // 8000 frames: note-on at frame 0, note-off due at frame 600
        let mut buf = vec![0.0f32; 8000 * CHANNELS];
        assert_eq!(dev.render(&mut buf), 8000);

        let calls = log.lock().unwrap();
        let tail: Vec<_> = calls.iter().skip(1).collect(); // skip Open
        assert_eq!(*tail[0], Call::Short(0x90, 60, 100));
        assert_eq!(*tail[1], Call::Render(600));
        assert_eq!(*tail[2], Call::Short(0x80, 60, 0));
        assert_eq!(*tail[3], Call::Render(7400));
        assert!(dev.is_ended());
    }

    #[test]
    fn fractional_ticks_carry_across_events() {
        // At 44.1 kHz one tick is 183.75 frames. Three one-tick gaps must
        // accumulate to floor(3 * 183.75) = 551 frames, not 3 * 183 = 549:
        // the remainder carries across conversions. Chunked rendering must
        // not change the boundary either.
        let source = BufferSource::new(
            120,
            &[
                StreamEvent::short(0, 0x90, 60, 100),
                StreamEvent::short(1, 0xB0, 0x0A, 1),
                StreamEvent::short(1, 0xB0, 0x0A, 2),
                StreamEvent::short(1, 0x80, 60, 0),
            ],
        );
        let (mut dev, log) = device_with_recorder(44_100);
        dev.open().unwrap();
        dev.play(Box::new(source), false).unwrap();

        let mut buf = vec![0.0f32; 33 * CHANNELS];
        for _ in 0..40 {
            dev.render(&mut buf);
        }

        let calls = log.lock().unwrap();
        let mut frames_before_off = 0usize;
        for call in calls.iter() {
            match call {
                Call::Render(n) => frames_before_off += n,
                Call::Short(0x80, ..) => break,
                _ => {}
            }
        }
        assert_eq!(frames_before_off, 551);
    }

    #[test]
    fn tempo_events_rescale_following_gaps() {
        // Same 3-tick gap, but a tempo event halves the tempo first: at
        // 250000 us/qn one tick is 48000*250000/(120*1e6) = 100 frames.
        let mut words = vec![0, 0, calliope_core::wire::pack_event(EVENT_TEMPO, 250_000)];
        for event in [
            StreamEvent::short(0, 0x90, 60, 100),
            StreamEvent::short(3, 0x80, 60, 0),
        ] {
            event.encode_into(&mut words);
        }
        let source = BufferSource::from_words(120, words);

        let (mut dev, log) = device_with_recorder(48_000);
        dev.open().unwrap();
        dev.play(Box::new(source), false).unwrap();

        let mut buf = vec![0.0f32; 1000 * CHANNELS];
        dev.render(&mut buf);

        let calls = log.lock().unwrap();
        let mut frames_before_off = 0usize;
        for call in calls.iter() {
            match call {
                Call::Render(n) => frames_before_off += n,
                Call::Short(0x80, ..) => break,
                _ => {}
            }
        }
        assert_eq!(frames_before_off, 300);
    }

    #[test]
    fn long_events_reach_backend_whole() {
        let payload = vec![0xF0, 1, 2, 3, 4, 5, 6, 0xF7];
        let source = BufferSource::new(
            96,
            &[
                StreamEvent::long(0, payload.clone()),
                StreamEvent::long(0, Vec::new()), // zero-length: absorbed
                StreamEvent::short(0, 0x90, 60, 100),
            ],
        );
        let (mut dev, log) = device_with_recorder(44_100);
        dev.open().unwrap();
        dev.play(Box::new(source), false).unwrap();

        let mut buf = vec![0.0f32; 64];
        dev.render(&mut buf);

        let calls = log.lock().unwrap();
        let longs: Vec<_> = calls.iter().filter(|c| matches!(c, Call::Long(_))).collect();
        assert_eq!(longs.len(), 1);
        assert_eq!(*longs[0], Call::Long(payload));
        assert!(calls.iter().any(|c| matches!(c, Call::Short(0x90, 60, 100))));
    }

    #[test]
    fn cc7_updates_channel_volume_mirror() {
        let source = BufferSource::new(
            96,
            &[
                StreamEvent::short(0, 0xB3, 0x07, 42),
                StreamEvent::short(1, 0x90, 60, 100),
            ],
        );
        let (mut dev, _) = device_with_recorder(44_100);
        dev.open().unwrap();
        dev.play(Box::new(source), true).unwrap();

        let mut buf = vec![0.0f32; 2048 * CHANNELS];
        dev.render(&mut buf);
        assert_eq!(dev.channel_volumes()[3], 42);
    }

    #[test]
    fn looping_restarts_and_resets_channel_volumes() {
        // One pass is 1 tick ≈ 230 frames at 44.1 kHz with division 96;
        // rendering far more forces several loop passes.
        let source = BufferSource::new(
            96,
            &[
                StreamEvent::short(0, 0xB0, 0x07, 15),
                StreamEvent::short(1, 0x90, 60, 100),
            ],
        );
        let (mut dev, log) = device_with_recorder(44_100);
        dev.open().unwrap();
        dev.play(Box::new(source), true).unwrap();

        let mut buf = vec![0.0f32; 4096 * CHANNELS];
        dev.render(&mut buf);
        assert!(!dev.is_ended());

        let note_ons = log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, Call::Short(0x90, ..)))
            .count();
        assert!(note_ons >= 2, "expected a loop restart, saw {note_ons} passes");
    }

    #[test]
    fn one_shot_ends_but_keeps_rendering_tail() {
        let (mut dev, _) = device_with_recorder(48_000);
        dev.open().unwrap();
        dev.play(Box::new(three_tick_source()), false).unwrap();

        let mut buf = vec![0.0f32; 7000 * CHANNELS];
        assert_eq!(dev.render(&mut buf), 7000);
        assert!(dev.is_ended());
        assert_eq!(dev.state(), DeviceState::Running);

        // tail keeps coming from the backend, full buffers every time
        assert_eq!(dev.render(&mut buf), 7000);
        assert!(buf.iter().all(|&s| s == 0.25));
    }
}
