//! Command surface used by scripting, MIDI actions and the UI
//!
//! Every command takes the engine lock. Transport commands are recorded and
//! take effect at the next cycle boundary.

use std::sync::Arc;

use drumline_core::{DrumlineError, PatternModeKind, PlaybackMode, Result, Song, clamp_bpm};
use tracing::{info, warn};

use crate::audio_engine::{EngineEvent, EngineState};

/// Handle issuing commands to a running engine
#[derive(Clone)]
pub struct Controller {
    state: Arc<EngineState>,
}

impl Controller {
    pub(crate) fn new(state: Arc<EngineState>) -> Self {
        Self { state }
    }

    /// Place a tempo marker, replacing any marker already on `bar`.
    pub fn add_tempo_marker(&self, bar: u32, bpm: f32) {
        let mut core = self.state.lock();
        core.song.timeline.replace_tempo_marker(bar, bpm);
        core.handle_tempo_change();
        info!(bar, bpm, "Tempo marker set");
        core.emit(EngineEvent::TimelineUpdated);
    }

    pub fn delete_tempo_marker(&self, bar: u32) {
        let mut core = self.state.lock();
        core.song.timeline.delete_tempo_marker(bar);
        core.handle_tempo_change();
        info!(bar, "Tempo marker deleted");
        core.emit(EngineEvent::TimelineUpdated);
    }

    /// Place a tag, replacing any tag already on `bar`.
    pub fn add_tag(&self, bar: u32, text: &str) {
        let mut core = self.state.lock();
        core.song.timeline.replace_tag(bar, text);
        core.emit(EngineEvent::TimelineUpdated);
    }

    pub fn delete_tag(&self, bar: u32) {
        let mut core = self.state.lock();
        core.song.timeline.delete_tag(bar);
        core.emit(EngineEvent::TimelineUpdated);
    }

    pub fn start(&self) {
        self.state.lock().start();
    }

    pub fn stop(&self) {
        self.state.lock().stop();
    }

    /// Start when stopped, stop when rolling.
    pub fn toggle_play(&self) {
        let mut core = self.state.lock();
        if core.transport.is_rolling() {
            core.stop();
        } else {
            core.start();
        }
    }

    /// Jump to `frame` at the next cycle boundary.
    pub fn relocate(&self, frame: i64) {
        self.state.lock().relocate(frame);
    }

    /// Jump to the start of `column`, -1 meaning the song start.
    pub fn locate_to_column(&self, column: i32) -> Result<()> {
        let mut core = self.state.lock();
        let tick = core.song.tick_for_column(column)?;
        core.relocate_to_tick(tick as f64);
        Ok(())
    }

    /// Change the song tempo at the next cycle boundary.
    pub fn set_bpm(&self, bpm: f32) {
        self.state.lock().next_bpm = Some(clamp_bpm(bpm));
    }

    /// Tempo the song will have after pending changes
    pub fn song_bpm(&self) -> f32 {
        let core = self.state.lock();
        core.next_bpm.unwrap_or(core.song.bpm)
    }

    pub fn activate_timeline(&self, activate: bool) {
        let mut core = self.state.lock();
        if core.song.timeline_activated == activate {
            return;
        }
        core.song.timeline_activated = activate;
        core.handle_tempo_change();
        info!(activate, "Timeline activation changed");
        core.emit(EngineEvent::TimelineActivation(activate));
    }

    pub fn set_loop_mode(&self, enabled: bool) {
        let mut core = self.state.lock();
        if core.song.loop_enabled == enabled {
            return;
        }
        core.song.loop_enabled = enabled;
        core.handle_tempo_change();
        core.emit(EngineEvent::LoopModeChanged(enabled));
    }

    pub fn is_loop_enabled(&self) -> bool {
        self.state.lock().song.loop_enabled
    }

    pub fn set_playback_mode(&self, mode: PlaybackMode) {
        let mut core = self.state.lock();
        if core.song.mode == mode {
            return;
        }
        core.song.mode = mode;
        if mode != PlaybackMode::Pattern {
            core.flush_stack_toggles();
        }
        core.handle_tempo_change();
        info!(?mode, "Playback mode changed");
    }

    pub fn set_metronome(&self, enabled: bool) {
        self.state.lock().prefs.metronome = enabled;
    }

    pub fn is_metronome_enabled(&self) -> bool {
        self.state.lock().prefs.metronome
    }

    /// Select the pattern played in selected-pattern mode.
    pub fn select_pattern(&self, pattern: usize) -> Result<()> {
        let mut core = self.state.lock();
        if pattern >= core.song.patterns.len() {
            return Err(DrumlineError::PatternNotFound(pattern));
        }
        core.selected_pattern = pattern;
        core.update_playing_patterns();
        core.emit(EngineEvent::PatternSelected(pattern));
        Ok(())
    }

    /// Select the pattern after the current one, wrapping around.
    pub fn select_next_pattern(&self) -> Result<usize> {
        let next = {
            let core = self.state.lock();
            let count = core.song.patterns.len();
            if count == 0 {
                return Err(DrumlineError::PatternNotFound(0));
            }
            (core.selected_pattern + 1) % count
        };
        self.select_pattern(next)?;
        Ok(next)
    }

    pub fn selected_pattern(&self) -> usize {
        self.state.lock().selected_pattern
    }

    /// Switch a pattern on or off in stacked mode. Applied at the next
    /// pattern boundary during pattern playback, immediately otherwise.
    pub fn toggle_stacked_pattern(&self, pattern: usize) -> Result<()> {
        let mut core = self.state.lock();
        if pattern >= core.song.patterns.len() {
            return Err(DrumlineError::PatternNotFound(pattern));
        }
        if core.prefs.pattern_mode != PatternModeKind::Stacked {
            warn!(pattern, "Stacked toggle outside stacked pattern mode");
        }
        core.toggle_stacked_pattern(pattern);
        Ok(())
    }

    pub fn stacked_patterns(&self) -> Vec<usize> {
        self.state.lock().stacked_patterns.clone()
    }

    pub fn set_pattern_mode(&self, kind: PatternModeKind) {
        let mut core = self.state.lock();
        core.prefs.pattern_mode = kind;
        core.update_playing_patterns();
    }

    /// Replace the song, stopping playback at its start.
    pub fn load_song(&self, song: Song) {
        self.state.lock().load_song(song);
    }
}

#[cfg(test)]
mod tests {
    use drumline_core::{Preferences, TransportState};

    use crate::audio_engine::{AudioEngine, TempoSource};

    use super::*;

    fn engine() -> AudioEngine {
        let prefs = Preferences {
            sample_rate: 48000,
            buffer_size: 256,
            ..Default::default()
        };
        AudioEngine::new(Song::demo(), prefs)
    }

    fn cycle(engine: &AudioEngine) {
        let mut buffer = vec![0.0f32; 512];
        engine.process(&mut buffer, 2);
    }

    #[test]
    fn test_add_tempo_marker_replaces_same_bar() {
        let engine = engine();
        let controller = engine.controller();
        controller.add_tempo_marker(2, 100.0);
        controller.add_tempo_marker(2, 140.0);

        let markers = engine.tempo_markers();
        // Synthesized bar 0 marker plus the single bar 2 marker
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[1].bpm, 140.0);
        assert_eq!(engine.tempo_at_bar(3), 140.0);
        assert_eq!(engine.tempo_at_bar(1), 120.0);
    }

    #[test]
    fn test_timeline_activation_switches_tempo_source() {
        let engine = engine();
        let controller = engine.controller();
        controller.add_tempo_marker(0, 90.0);
        assert_eq!(engine.tempo_source(), TempoSource::Song);

        controller.activate_timeline(true);
        assert_eq!(engine.tempo_source(), TempoSource::Timeline);
        cycle(&engine);
        assert_eq!(engine.current_bpm(), 90.0);

        controller.set_playback_mode(PlaybackMode::Pattern);
        assert!(!engine.is_timeline_enabled());
        assert!(engine.is_timeline_activated());
    }

    #[test]
    fn test_tags() {
        let engine = engine();
        let controller = engine.controller();
        controller.add_tag(1, "Verse");
        controller.add_tag(1, "Chorus");
        assert_eq!(engine.tag_at_bar(1, false).as_deref(), Some("Chorus"));
        assert_eq!(engine.tag_at_bar(3, true).as_deref(), Some("Chorus"));

        controller.delete_tag(1);
        assert_eq!(engine.tag_at_bar(3, true), None);
    }

    #[test]
    fn test_locate_to_column() {
        let engine = engine();
        let controller = engine.controller();
        controller.locate_to_column(2).unwrap();
        cycle(&engine);
        // Column 2 starts at tick 384, 500 frames per tick
        assert_eq!(engine.current_column(), 2);
        assert_eq!(engine.position(), 384 * 500);

        assert!(matches!(
            controller.locate_to_column(9),
            Err(DrumlineError::ColumnOutOfRange { .. })
        ));
        controller.set_loop_mode(true);
        controller.locate_to_column(5).unwrap();
        cycle(&engine);
        assert_eq!(engine.current_column(), 1);
    }

    #[test]
    fn test_relocate_clamps_to_song_end() {
        let engine = engine();
        let controller = engine.controller();
        controller.relocate(i64::MAX / 2);
        cycle(&engine);
        assert_eq!(engine.position(), 768 * 500);

        controller.relocate(-5);
        cycle(&engine);
        assert_eq!(engine.position(), 0);
    }

    #[test]
    fn test_toggle_play() {
        let engine = engine();
        let controller = engine.controller();
        controller.toggle_play();
        cycle(&engine);
        assert_eq!(engine.transport_state(), TransportState::Rolling);
        controller.toggle_play();
        cycle(&engine);
        assert_eq!(engine.transport_state(), TransportState::Stopped);
    }

    #[test]
    fn test_pattern_selection() {
        let engine = engine();
        let controller = engine.controller();
        assert_eq!(controller.select_next_pattern().unwrap(), 1);
        assert_eq!(controller.select_next_pattern().unwrap(), 0);
        assert!(controller.select_pattern(7).is_err());
    }

    #[test]
    fn test_stacked_toggle_waits_for_boundary() {
        let engine = engine();
        let controller = engine.controller();
        controller.set_pattern_mode(PatternModeKind::Stacked);
        controller.set_playback_mode(PlaybackMode::Pattern);

        // Stopped transport applies toggles right away
        controller.toggle_stacked_pattern(0).unwrap();
        cycle(&engine);
        assert_eq!(controller.stacked_patterns(), vec![0]);

        controller.start();
        cycle(&engine);
        controller.toggle_stacked_pattern(1).unwrap();
        cycle(&engine);
        assert_eq!(controller.stacked_patterns(), vec![0]);

        // Pattern of 192 ticks at 500 frames per tick, 256 frames per cycle
        for _ in 0..400 {
            cycle(&engine);
        }
        assert_eq!(controller.stacked_patterns(), vec![0, 1]);
    }

    #[test]
    fn test_stacked_toggle_outside_pattern_playback_is_immediate() {
        let engine = engine();
        let controller = engine.controller();
        controller.set_pattern_mode(PatternModeKind::Stacked);

        controller.toggle_stacked_pattern(1).unwrap();
        assert_eq!(controller.stacked_patterns(), vec![1]);
        controller.toggle_stacked_pattern(1).unwrap();
        controller.toggle_stacked_pattern(0).unwrap();
        assert_eq!(controller.stacked_patterns(), vec![0]);

        // Nothing left over to replay once pattern playback starts
        controller.set_playback_mode(PlaybackMode::Pattern);
        cycle(&engine);
        assert_eq!(controller.stacked_patterns(), vec![0]);
    }

    #[test]
    fn test_zero_length_pattern_in_pattern_mode() {
        let mut song = Song::demo();
        song.patterns[0].length = 0;
        let json = serde_json::to_string(&song).unwrap();

        let engine = engine();
        let controller = engine.controller();
        controller.load_song(serde_json::from_str(&json).unwrap());
        controller.set_playback_mode(PlaybackMode::Pattern);
        controller.start();
        for _ in 0..4 {
            cycle(&engine);
        }
        assert!(engine.is_playing());
        assert_eq!(engine.position(), 4 * 256);
    }

    #[test]
    fn test_pending_column_relocation_survives_bpm_change() {
        let engine = engine();
        let controller = engine.controller();
        controller.locate_to_column(2).unwrap();
        controller.set_bpm(60.0);
        cycle(&engine);
        // Tick 384 at 1000 frames per tick
        assert_eq!(engine.current_column(), 2);
        assert_eq!(engine.position(), 384 * 1000);
    }

    #[test]
    fn test_pending_column_relocation_survives_marker_edit() {
        let engine = engine();
        let controller = engine.controller();
        controller.activate_timeline(true);
        controller.locate_to_column(3).unwrap();
        controller.add_tempo_marker(0, 240.0);
        cycle(&engine);
        // Tick 576 at 250 frames per tick
        assert_eq!(engine.current_column(), 3);
        assert_eq!(engine.position(), 576 * 250);
    }

    #[test]
    fn test_pending_column_relocation_survives_timeline_activation() {
        let engine = engine();
        let controller = engine.controller();
        controller.add_tempo_marker(0, 60.0);
        controller.start();
        cycle(&engine);
        controller.locate_to_column(1).unwrap();
        controller.activate_timeline(true);
        cycle(&engine);
        // Resolved at the cycle start, then advanced by one cycle
        assert_eq!(engine.current_column(), 1);
        assert_eq!(engine.position(), 192 * 1000 + 256);
        assert!(engine.is_playing());
    }

    #[test]
    fn test_load_song_resets_transport() {
        let engine = engine();
        let controller = engine.controller();
        controller.start();
        for _ in 0..10 {
            cycle(&engine);
        }
        controller.load_song(Song::demo());
        cycle(&engine);
        assert_eq!(engine.position(), 0);
        assert!(!engine.is_playing());
    }
}
