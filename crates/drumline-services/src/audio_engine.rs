//! Audio engine running the transport process cycle

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use drumline_core::{
    ClockContext, ClockRole, ClockSync, DrumlineError, ExternalClock, Instrument, NoteScheduler, NoteSink,
    NoteSource, PlaybackMode, PatternModeKind, Preferences, ScheduleContext, ScheduledNote, SharedTransport,
    Song, TempoMarker, TempoPlan, TickFrameConverter, Transport, TransportState, RelocationDelay,
};
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::audio_io::{AudioOutputError, RealtimeOutputStream, default_device_info};
use crate::controller::Controller;
use crate::render::ClickVoices;

/// Capacity of the engine event channel
pub const EVENT_CAPACITY: usize = 256;

/// Seed of the humanization random generator
const HUMANIZE_SEED: u64 = 0x6472_756d;

#[derive(Debug, Error)]
pub enum AudioEngineError {
    #[error("Audio output error: {0}")]
    Output(#[from] AudioOutputError),
    #[error("Engine already running")]
    AlreadyRunning,
    #[error("Engine not running")]
    NotRunning,
    #[error("Song error: {0}")]
    Song(#[from] DrumlineError),
}

/// Where the current tempo comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempoSource {
    Song,
    Timeline,
    External,
}

/// Notifications for the UI, sent without blocking the audio thread
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StateChanged(TransportState),
    Relocated { frame: i64 },
    TempoChanged { bpm: f32 },
    TimelineUpdated,
    TimelineActivation(bool),
    LoopModeChanged(bool),
    PatternSelected(usize),
    RoleChanged(ClockRole),
    SongLoaded,
    SongEnded,
}

/// A note handed to the renderer, at its absolute frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayedNote {
    pub frame: i64,
    pub tick: u64,
    pub source: NoteSource,
    pub velocity: f32,
    pub column: i32,
}

/// Everything the process cycle touches, guarded by the engine lock
pub(crate) struct EngineCore {
    pub(crate) song: Song,
    pub(crate) prefs: Preferences,
    pub(crate) sample_rate: u32,
    pub(crate) transport: Transport,
    pub(crate) converter: TickFrameConverter,
    pub(crate) scheduler: NoteScheduler,
    pub(crate) clock: Option<ExternalClock>,
    /// Tempo applied at the next cycle boundary
    pub(crate) next_bpm: Option<f32>,
    pub(crate) selected_pattern: usize,
    pub(crate) stacked_patterns: Vec<usize>,
    /// Stacked patterns switched on or off at the next pattern boundary
    pub(crate) pending_stack_toggles: Vec<usize>,
    playing_patterns: Vec<usize>,
    last_pattern_start: Option<u64>,
    voices: ClickVoices,
    note_tap: Option<Sender<PlayedNote>>,
    events: Sender<EngineEvent>,
    last_state: TransportState,
    last_bpm: f32,
    last_role: ClockRole,
}

impl EngineCore {
    fn new(mut song: Song, prefs: Preferences, events: Sender<EngineEvent>) -> Self {
        prepare_song(&mut song, &prefs);
        let sample_rate = prefs.sample_rate;
        let pattern_capacity = song.patterns.len().max(1);

        let mut core = Self {
            converter: TickFrameConverter::for_song(&song, sample_rate, TempoPlan::Constant(song.bpm)),
            scheduler: NoteScheduler::new(prefs.note_queue_capacity, HUMANIZE_SEED),
            transport: Transport::new(),
            clock: None,
            next_bpm: None,
            selected_pattern: 0,
            stacked_patterns: Vec::with_capacity(pattern_capacity),
            pending_stack_toggles: Vec::with_capacity(pattern_capacity),
            playing_patterns: Vec::with_capacity(pattern_capacity),
            last_pattern_start: None,
            voices: ClickVoices::new(sample_rate),
            note_tap: None,
            events,
            last_state: TransportState::Stopped,
            last_bpm: song.bpm,
            last_role: ClockRole::None,
            sample_rate,
            prefs,
            song,
        };
        core.update_playing_patterns();
        core.handle_tempo_change();
        core
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        if self.events.try_send(event).is_err() {
            trace!("Event channel full, dropping event");
        }
    }

    /// The timeline governs the tempo only when activated, in song mode
    /// and while no external leader is followed.
    pub(crate) fn is_timeline_enabled(&self) -> bool {
        self.prefs.use_timeline
            && self.song.timeline_activated
            && self.song.mode == PlaybackMode::Song
            && !self.is_following()
    }

    fn is_following(&self) -> bool {
        self.clock.as_ref().is_some_and(|c| c.is_following())
    }

    pub(crate) fn tempo_source(&self) -> TempoSource {
        if self.is_following() {
            TempoSource::External
        } else if self.is_timeline_enabled() {
            TempoSource::Timeline
        } else {
            TempoSource::Song
        }
    }

    fn tempo_plan(&self) -> TempoPlan {
        match self.tempo_source() {
            TempoSource::External => {
                let bpm = self.clock.as_ref().map_or(self.song.bpm, |c| c.external_bpm());
                TempoPlan::Constant(bpm)
            }
            TempoSource::Timeline => TempoPlan::Timeline,
            TempoSource::Song => TempoPlan::Constant(self.song.bpm),
        }
    }

    pub(crate) fn pattern_length(&self) -> u32 {
        self.song.longest_pattern_length(&self.playing_patterns)
    }

    /// Rebuild the tempo segments while keeping the tick position: the frame
    /// is recomputed and queued notes are re-timed. A pending relocation keeps
    /// its tick as well.
    pub(crate) fn handle_tempo_change(&mut self) {
        let tick = self.converter.frame_to_tick(self.transport.frame()) + self.transport.position().tick_mismatch;
        let target_tick = self.transport.pending_relocation_tick(&self.converter);
        let plan = self.tempo_plan();
        self.converter.rebuild(&self.song, self.sample_rate, plan);

        let (frame, mismatch) = self.converter.tick_to_frame(tick);
        self.transport.set_frame(frame, mismatch);
        if let Some(target_tick) = target_tick {
            let (target, target_mismatch) = self.converter.tick_to_frame(target_tick);
            if self.transport.pending_relocation() != Some(target) {
                debug!(target_tick, target, "Pending relocation moved with the tempo");
                if let Some(clock) = self.clock.as_mut() {
                    clock.request_locate(target);
                }
            }
            self.transport.retarget_relocation(target, target_mismatch);
        }
        self.scheduler.retime(&self.converter);

        let pattern_length = self.pattern_length();
        self.transport.refresh(&self.converter, &self.song, pattern_length);
        debug!(tick, frame, ?plan, "Tempo map changed, transport re-synced");
    }

    pub(crate) fn set_sample_rate(&mut self, sample_rate: u32) {
        if sample_rate == self.sample_rate {
            return;
        }
        info!(from = self.sample_rate, to = sample_rate, "Sample rate changed");
        self.sample_rate = sample_rate;
        self.voices.set_sample_rate(sample_rate);
        self.handle_tempo_change();
    }

    /// Frame of the song end when playback stops there
    pub(crate) fn song_end_frame(&self) -> Option<i64> {
        let size = self.song.size_in_ticks();
        let bounded = self.song.mode == PlaybackMode::Song && !self.song.loop_enabled && size > 0;
        bounded.then(|| self.converter.tick_to_frame(size as f64).0)
    }

    pub(crate) fn relocate(&mut self, frame: i64) {
        self.relocate_with_mismatch(frame, 0.0);
    }

    fn relocate_with_mismatch(&mut self, frame: i64, tick_mismatch: f64) {
        let end = self.song_end_frame();
        let delay = if self.clock.is_some() { RelocationDelay::Shared } else { RelocationDelay::Local };
        self.transport.relocate_with_mismatch(frame, tick_mismatch, end, delay);

        if let (Some(clock), Some(target)) = (self.clock.as_mut(), self.transport.pending_relocation()) {
            clock.request_locate(target);
        }
    }

    pub(crate) fn relocate_to_tick(&mut self, tick: f64) {
        let (frame, mismatch) = self.converter.tick_to_frame(tick);
        self.relocate_with_mismatch(frame, mismatch);
    }

    pub(crate) fn start(&mut self) {
        self.transport.start();
        if let Some(clock) = self.clock.as_mut() {
            clock.request_start();
        }
    }

    pub(crate) fn stop(&mut self) {
        self.transport.stop();
        if let Some(clock) = self.clock.as_mut() {
            clock.request_stop();
        }
    }

    /// Replace the song, resetting the transport.
    pub(crate) fn load_song(&mut self, mut song: Song) {
        prepare_song(&mut song, &self.prefs);
        let capacity = song.patterns.len().max(1);
        self.song = song;
        self.transport.reset();
        self.scheduler.clear();
        self.voices.silence();
        self.next_bpm = None;
        self.selected_pattern = 0;
        self.stacked_patterns.clear();
        self.stacked_patterns.reserve(capacity);
        self.pending_stack_toggles.clear();
        self.pending_stack_toggles.reserve(capacity);
        self.playing_patterns.reserve(capacity);
        self.last_pattern_start = None;

        self.converter = TickFrameConverter::for_song(&self.song, self.sample_rate, TempoPlan::Constant(self.song.bpm));
        self.update_playing_patterns();
        self.handle_tempo_change();
        if let Some(clock) = self.clock.as_mut() {
            clock.request_locate(0);
        }
        info!(song = %self.song.name, columns = self.song.columns.len(), "Song loaded");
        self.emit(EngineEvent::SongLoaded);
    }

    pub(crate) fn update_playing_patterns(&mut self) {
        self.playing_patterns.clear();
        match self.prefs.pattern_mode {
            PatternModeKind::Selected => {
                if self.selected_pattern < self.song.patterns.len() {
                    self.playing_patterns.push(self.selected_pattern);
                }
            }
            PatternModeKind::Stacked => self.playing_patterns.extend_from_slice(&self.stacked_patterns),
        }
    }

    /// Apply stacked pattern toggles once a new pattern pass started or the
    /// transport is stopped.
    fn apply_stack_toggles(&mut self) {
        if self.song.mode != PlaybackMode::Pattern {
            return;
        }
        let start = self.transport.position().pattern_start_tick;
        let boundary = !self.transport.is_rolling() || self.last_pattern_start.is_some_and(|s| s != start);
        self.last_pattern_start = Some(start);

        if boundary {
            self.flush_stack_toggles();
        }
    }

    /// Apply all pending stacked pattern toggles now.
    pub(crate) fn flush_stack_toggles(&mut self) {
        if self.pending_stack_toggles.is_empty() {
            return;
        }
        let mut pending = std::mem::take(&mut self.pending_stack_toggles);
        for &pattern in &pending {
            self.flip_stacked(pattern);
        }
        pending.clear();
        self.pending_stack_toggles = pending;
        self.update_playing_patterns();
    }

    fn flip_stacked(&mut self, pattern: usize) {
        if let Some(idx) = self.stacked_patterns.iter().position(|&p| p == pattern) {
            self.stacked_patterns.remove(idx);
        } else {
            self.stacked_patterns.push(pattern);
        }
    }

    /// Toggle a stacked pattern. Outside pattern playback there is no
    /// pattern boundary to wait for, so the toggle applies at once.
    pub(crate) fn toggle_stacked_pattern(&mut self, pattern: usize) {
        if self.song.mode == PlaybackMode::Pattern {
            self.pending_stack_toggles.push(pattern);
        } else {
            self.flip_stacked(pattern);
            self.update_playing_patterns();
        }
    }

    fn reconcile_clock(&mut self) {
        let Some(clock) = self.clock.as_mut() else {
            return;
        };
        let ctx = ClockContext {
            song: &self.song,
            converter: &self.converter,
            pattern_length: self.song.longest_pattern_length(&self.playing_patterns),
        };
        let sync = clock.reconcile(self.transport.frame(), self.transport.play_state(), &ctx);
        let role = clock.role();

        match sync {
            ClockSync::NoChange => {}
            ClockSync::Reconciled(reconciled) => {
                if reconciled.bpm.is_some() {
                    self.handle_tempo_change();
                }
                let moved = reconciled.frame != self.transport.frame();
                self.transport.snap(reconciled.frame, reconciled.play_state);
                if moved {
                    self.scheduler.clear();
                    self.emit(EngineEvent::Relocated { frame: reconciled.frame });
                }
            }
            ClockSync::RoleLost => self.handle_tempo_change(),
        }

        if role != self.last_role {
            self.last_role = role;
            self.emit(EngineEvent::RoleChanged(role));
        }
    }

    fn reached_song_end(&self) -> bool {
        self.song.mode == PlaybackMode::Song
            && !self.song.loop_enabled
            && self.song.size_in_ticks() > 0
            && self.transport.position().column < 0
    }

    /// One process cycle: clock reconciliation, transport advance, note
    /// scheduling and rendering.
    pub(crate) fn process(&mut self, buffer: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = (buffer.len() / channels) as u32;
        buffer.fill(0.0);

        if let Some(bpm) = self.next_bpm.take() {
            self.song.bpm = bpm;
            self.handle_tempo_change();
        }

        self.reconcile_clock();

        let window = self.transport.begin_cycle(frames);
        if window.relocated {
            self.scheduler.clear();
            self.emit(EngineEvent::Relocated { frame: window.start });
        }
        if !window.rolling {
            self.scheduler.clear();
        }

        let state = self.transport.state();
        if state != self.last_state {
            self.last_state = state;
            self.emit(EngineEvent::StateChanged(state));
        }

        let pattern_length = self.pattern_length();
        self.transport.refresh(&self.converter, &self.song, pattern_length);
        self.apply_stack_toggles();

        let bpm = self.transport.position().bpm;
        if (bpm - self.last_bpm).abs() > f32::EPSILON {
            self.last_bpm = bpm;
            self.emit(EngineEvent::TempoChanged { bpm });
        }

        if window.rolling {
            let ctx = ScheduleContext {
                song: &self.song,
                converter: &self.converter,
                playing_patterns: &self.playing_patterns,
                metronome: self.prefs.metronome,
            };
            self.scheduler.schedule(&window, &ctx);

            let mut sink = CycleSink {
                voices: &mut self.voices,
                tap: self.note_tap.as_ref(),
                instruments: &self.song.instruments,
                window_start: window.start,
                metronome_volume: self.prefs.metronome_volume,
            };
            self.scheduler.drain_due(&window, &mut sink);

            if self.reached_song_end() {
                info!(frame = window.start, "Reached song end");
                self.stop();
                self.relocate(0);
                self.scheduler.clear();
                self.emit(EngineEvent::SongEnded);
            }
        }

        self.voices.render(buffer, channels);
        self.transport.end_cycle();

        let pattern_length = self.pattern_length();
        self.transport.refresh(&self.converter, &self.song, pattern_length);
    }
}

/// Clamp song values and apply preferences affecting the song
fn prepare_song(song: &mut Song, prefs: &Preferences) {
    let removed = song.repair();
    if removed > 0 {
        warn!(removed, song = %song.name, "Dropped references to missing entities");
    }
    if prefs.loop_mode {
        song.loop_enabled = true;
    }
}

/// Routes due notes to the click voices and the optional note tap
struct CycleSink<'a> {
    voices: &'a mut ClickVoices,
    tap: Option<&'a Sender<PlayedNote>>,
    instruments: &'a [Instrument],
    window_start: i64,
    metronome_volume: f32,
}

impl NoteSink for CycleSink<'_> {
    fn note_on(&mut self, note: &ScheduledNote, offset: u32) {
        let (frequency, gain) = match note.source {
            NoteSource::Instrument(id) => {
                let index = self.instruments.iter().position(|i| i.id == id).unwrap_or(0);
                (110.0 * (1.0 + index as f32 * 0.75), note.velocity)
            }
            NoteSource::Metronome { accent } => {
                let frequency = if accent { 1760.0 } else { 880.0 };
                (frequency, note.velocity * self.metronome_volume)
            }
        };
        self.voices.trigger(offset, frequency, gain);

        if let Some(tap) = self.tap {
            let _ = tap.try_send(PlayedNote {
                frame: self.window_start + offset as i64,
                tick: note.tick,
                source: note.source,
                velocity: note.velocity,
                column: note.column,
            });
        }
    }
}

/// Audio engine state shared between UI and audio thread
pub struct EngineState {
    /// Playhead frame the next cycle starts at
    pub frame: AtomicI64,
    pub playing: AtomicBool,
    /// Cycles output as silence because the engine lock was busy
    pub skipped_cycles: AtomicU64,
    bpm_bits: AtomicU32,
    tick_bits: AtomicU64,
    column: AtomicI32,
    lock_timeout: Duration,
    core: Mutex<EngineCore>,
}

impl EngineState {
    fn new(song: Song, prefs: Preferences, events: Sender<EngineEvent>) -> Self {
        let lock_timeout = Duration::from_millis(prefs.lock_timeout_ms);
        let core = EngineCore::new(song, prefs, events);
        let state = Self {
            frame: AtomicI64::new(0),
            playing: AtomicBool::new(false),
            skipped_cycles: AtomicU64::new(0),
            bpm_bits: AtomicU32::new(0),
            tick_bits: AtomicU64::new(0),
            column: AtomicI32::new(-1),
            lock_timeout,
            core: Mutex::new(core),
        };
        state.publish(&state.core.lock());
        state
    }

    /// Blocking access for non-real-time callers
    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineCore> {
        self.core.lock()
    }

    /// Run one process cycle on an interleaved buffer. Outputs silence and
    /// returns false when the engine lock could not be taken in time.
    pub fn process(&self, buffer: &mut [f32], channels: u16) -> bool {
        let Some(mut core) = self.core.try_lock_for(self.lock_timeout) else {
            buffer.fill(0.0);
            self.skipped_cycles.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        core.process(buffer, channels as usize);
        self.publish(&core);
        true
    }

    fn publish(&self, core: &EngineCore) {
        let position = core.transport.position();
        self.frame.store(position.frame, Ordering::SeqCst);
        self.playing.store(core.transport.is_rolling(), Ordering::SeqCst);
        self.bpm_bits.store(position.bpm.to_bits(), Ordering::Relaxed);
        self.tick_bits.store(position.tick.to_bits(), Ordering::Relaxed);
        self.column.store(position.column, Ordering::Relaxed);
    }

    pub fn bpm(&self) -> f32 {
        f32::from_bits(self.bpm_bits.load(Ordering::Relaxed))
    }

    pub fn tick(&self) -> f64 {
        f64::from_bits(self.tick_bits.load(Ordering::Relaxed))
    }

    pub fn column(&self) -> i32 {
        self.column.load(Ordering::Relaxed)
    }
}

/// Audio engine for drum song playback
pub struct AudioEngine {
    state: Arc<EngineState>,
    events: Receiver<EngineEvent>,
    stream: Option<RealtimeOutputStream>,
}

impl AudioEngine {
    pub fn new(song: Song, prefs: Preferences) -> Self {
        let (tx, rx) = bounded(EVENT_CAPACITY);
        Self {
            state: Arc::new(EngineState::new(song, prefs, tx)),
            events: rx,
            stream: None,
        }
    }

    /// Get shared state for UI access
    pub fn state(&self) -> Arc<EngineState> {
        self.state.clone()
    }

    /// Receiver of engine events
    pub fn events(&self) -> Receiver<EngineEvent> {
        self.events.clone()
    }

    /// Command surface for scripting and UI
    pub fn controller(&self) -> Controller {
        Controller::new(self.state.clone())
    }

    /// Start the audio device
    pub fn start(&mut self) -> Result<(), AudioEngineError> {
        if self.stream.is_some() {
            return Err(AudioEngineError::AlreadyRunning);
        }

        let (device, sample_rate, channels) = default_device_info()?;
        self.state.lock().set_sample_rate(sample_rate);

        let state = self.state.clone();
        let stream = RealtimeOutputStream::start(move |buffer, _sample_rate, channels| {
            state.process(buffer, channels);
        })?;

        self.stream = Some(stream);
        info!(%device, sample_rate, channels, "Audio engine started");
        Ok(())
    }

    /// Stop the audio device
    pub fn stop(&mut self) -> Result<(), AudioEngineError> {
        let stream = self.stream.take().ok_or(AudioEngineError::NotRunning)?;
        stream.stop();
        info!("Audio engine stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    /// Run one cycle without an audio device
    pub fn process(&self, buffer: &mut [f32], channels: u16) -> bool {
        self.state.process(buffer, channels)
    }

    /// Receive every note handed to the renderer. At most `capacity` notes
    /// are buffered; further notes are not reported until the receiver
    /// catches up.
    pub fn tap_notes(&self, capacity: usize) -> Receiver<PlayedNote> {
        let (tx, rx) = bounded(capacity);
        self.state.lock().note_tap = Some(tx);
        rx
    }

    /// Synchronize with a shared transport, optionally as leader. Returns
    /// whether the leader role was granted (always false when not asked).
    pub fn enable_external_transport(&self, transport: Box<dyn SharedTransport>, leader: bool) -> bool {
        let mut core = self.state.lock();
        let mut clock = ExternalClock::new(transport);
        let granted = leader && clock.register_leader();
        core.clock = Some(clock);
        info!(leader = granted, "External transport enabled");
        granted
    }

    /// Leave the shared transport, releasing the leader role if held.
    pub fn disable_external_transport(&self) {
        let mut core = self.state.lock();
        if core.clock.take().is_some() {
            core.handle_tempo_change();
            core.last_role = ClockRole::None;
            core.emit(EngineEvent::RoleChanged(ClockRole::None));
            info!("External transport disabled");
        }
    }

    /// Current playhead frame
    pub fn position(&self) -> i64 {
        self.state.frame.load(Ordering::SeqCst)
    }

    pub fn is_playing(&self) -> bool {
        self.state.playing.load(Ordering::SeqCst)
    }

    pub fn current_bpm(&self) -> f32 {
        self.state.bpm()
    }

    pub fn current_tick(&self) -> f64 {
        self.state.tick()
    }

    pub fn current_column(&self) -> i32 {
        self.state.column()
    }

    pub fn skipped_cycles(&self) -> u64 {
        self.state.skipped_cycles.load(Ordering::Relaxed)
    }

    pub fn transport_state(&self) -> TransportState {
        self.state.lock().transport.state()
    }

    pub fn sample_rate(&self) -> u32 {
        self.state.lock().sample_rate
    }

    pub fn tempo_source(&self) -> TempoSource {
        self.state.lock().tempo_source()
    }

    pub fn clock_role(&self) -> ClockRole {
        self.state.lock().clock.as_ref().map_or(ClockRole::None, |c| c.role())
    }

    /// Tempo of the followed leader, NaN when not following
    pub fn external_bpm(&self) -> f32 {
        self.state.lock().clock.as_ref().map_or(f32::NAN, |c| c.external_bpm())
    }

    pub fn is_timeline_activated(&self) -> bool {
        self.state.lock().song.timeline_activated
    }

    pub fn is_timeline_enabled(&self) -> bool {
        self.state.lock().is_timeline_enabled()
    }

    pub fn tempo_at_bar(&self, bar: i32) -> f32 {
        let core = self.state.lock();
        core.song.timeline.tempo_at_bar(bar, core.song.bpm)
    }

    pub fn tag_at_bar(&self, bar: u32, sticky: bool) -> Option<String> {
        self.state.lock().song.timeline.tag_at_bar(bar, sticky).map(str::to_owned)
    }

    pub fn tempo_markers(&self) -> Vec<TempoMarker> {
        let core = self.state.lock();
        core.song.timeline.all_tempo_markers(core.song.bpm)
    }

    /// Read access to the song (locks the engine)
    pub fn with_song<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Song) -> R,
    {
        f(&self.state.lock().song)
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drumline_core::{PlayState, Pattern};

    const CHANNELS: u16 = 2;

    fn engine_with(song: Song, buffer_size: u32) -> (AudioEngine, Vec<f32>) {
        let prefs = Preferences {
            sample_rate: 48000,
            buffer_size,
            ..Default::default()
        };
        let buffer = vec![0.0; buffer_size as usize * CHANNELS as usize];
        (AudioEngine::new(song, prefs), buffer)
    }

    fn cycles(engine: &AudioEngine, buffer: &mut [f32], count: usize) {
        for _ in 0..count {
            assert!(engine.process(buffer, CHANNELS));
        }
    }

    #[test]
    fn test_start_advances_by_buffer_size() {
        let (engine, mut buffer) = engine_with(Song::demo(), 512);
        engine.controller().start();
        cycles(&engine, &mut buffer, 3);

        assert!(engine.is_playing());
        assert_eq!(engine.position(), 3 * 512);
        assert_eq!(engine.transport_state(), TransportState::Rolling);
    }

    #[test]
    fn test_renders_sound_when_rolling() {
        let (engine, mut buffer) = engine_with(Song::demo(), 512);
        engine.controller().start();
        engine.process(&mut buffer, CHANNELS);
        // Kick and hi-hat at tick 0
        assert!(buffer.iter().any(|s| *s != 0.0));
    }

    #[test]
    fn test_deferred_bpm_applies_at_cycle_boundary() {
        let (engine, mut buffer) = engine_with(Song::demo(), 512);
        let controller = engine.controller();
        controller.set_bpm(90.0);
        assert_eq!(engine.with_song(|s| s.bpm), 120.0);

        engine.process(&mut buffer, CHANNELS);
        assert_eq!(engine.with_song(|s| s.bpm), 90.0);
        assert_eq!(engine.current_bpm(), 90.0);
    }

    #[test]
    fn test_tempo_change_keeps_tick() {
        let (engine, mut buffer) = engine_with(Song::demo(), 500);
        let controller = engine.controller();
        controller.start();
        // 120 bpm at 48 kHz is 500 frames per tick
        cycles(&engine, &mut buffer, 96);
        assert_eq!(engine.current_tick(), 96.0);

        controller.set_bpm(60.0);
        engine.process(&mut buffer, CHANNELS);
        // One cycle at half the tempo moves half a tick
        assert_eq!(engine.current_tick(), 96.5);
        assert_eq!(engine.position(), 96 * 1000 + 500);
    }

    #[test]
    fn test_song_end_stops_and_rewinds() {
        let mut song = Song::new("short", 120.0);
        let pattern = song.add_pattern(Pattern::new("p", 48));
        song.columns = vec![vec![pattern]];
        let (engine, mut buffer) = engine_with(song, 1000);
        let events = engine.events();
        engine.controller().start();

        // 48 ticks of 500 frames are 24 cycles
        cycles(&engine, &mut buffer, 30);
        assert!(!engine.is_playing());
        assert_eq!(engine.position(), 0);
        assert!(events.try_iter().any(|e| e == EngineEvent::SongEnded));
    }

    #[test]
    fn test_busy_lock_skips_cycle() {
        let (engine, mut buffer) = engine_with(Song::demo(), 256);
        let state = engine.state();
        let guard = state.lock();
        buffer.fill(1.0);
        assert!(!engine.process(&mut buffer, CHANNELS));
        drop(guard);

        assert!(buffer.iter().all(|s| *s == 0.0));
        assert_eq!(engine.skipped_cycles(), 1);
    }

    #[test]
    fn test_state_change_events() {
        let (engine, mut buffer) = engine_with(Song::demo(), 256);
        let events = engine.events();
        let controller = engine.controller();
        controller.start();
        engine.process(&mut buffer, CHANNELS);
        controller.stop();
        engine.process(&mut buffer, CHANNELS);

        let states: Vec<_> = events
            .try_iter()
            .filter_map(|e| match e {
                EngineEvent::StateChanged(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![TransportState::Rolling, TransportState::Stopped]);
        assert_eq!(engine.state().lock().transport.play_state(), PlayState::Stopped);
    }
}
