//! Transport state machine and playhead position

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::conversion::TickFrameConverter;
use crate::song::{PlaybackMode, Song};

/// Whether the playhead moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlayState {
    #[default]
    Stopped,
    Rolling,
}

/// Transport state as reported to the outside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransportState {
    #[default]
    Stopped,
    Rolling,
    /// A relocation is waiting for its cycle boundary
    Relocating,
}

/// How many cycle boundaries a relocation waits before it resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationDelay {
    /// The engine owns the position
    Local,
    /// An external shared transport owns the position and has to catch up
    Shared,
}

impl RelocationDelay {
    pub fn cycles(self) -> u8 {
        match self {
            Self::Local => 1,
            Self::Shared => 2,
        }
    }
}

/// Playhead position with its musical interpretation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransportPosition {
    pub frame: i64,
    pub tick: f64,
    /// Rounding difference left over when the frame was derived from a tick
    pub tick_mismatch: f64,
    pub bpm: f32,
    /// Frames per tick
    pub tick_size: f64,
    /// Column the tick lies in, -1 outside the song
    pub column: i32,
    /// Tick at which the playing column or pattern started
    pub pattern_start_tick: u64,
    /// Tick position inside the playing column or pattern
    pub pattern_tick_position: u64,
}

impl Default for TransportPosition {
    fn default() -> Self {
        Self {
            frame: 0,
            tick: 0.0,
            tick_mismatch: 0.0,
            bpm: 120.0,
            tick_size: 0.0,
            column: -1,
            pattern_start_tick: 0,
            pattern_tick_position: 0,
        }
    }
}

/// Frame interval handled by one process cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleWindow {
    pub start: i64,
    pub frames: u32,
    pub rolling: bool,
    /// A relocation resolved at the start of this cycle
    pub relocated: bool,
}

impl CycleWindow {
    pub fn end(&self) -> i64 {
        self.start + self.frames as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PendingRelocation {
    target: i64,
    tick_mismatch: f64,
    cycles_left: u8,
}

/// Transport state machine.
///
/// Start, stop and relocation requests are recorded and applied at the next
/// cycle boundary by [`Transport::begin_cycle`].
#[derive(Debug, Clone, Default)]
pub struct Transport {
    play_state: PlayState,
    requested: Option<PlayState>,
    relocation: Option<PendingRelocation>,
    position: TransportPosition,
    current_cycle: Option<CycleWindow>,
}

impl Transport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TransportState {
        match (self.relocation, self.play_state) {
            (Some(_), _) => TransportState::Relocating,
            (None, PlayState::Stopped) => TransportState::Stopped,
            (None, PlayState::Rolling) => TransportState::Rolling,
        }
    }

    pub fn play_state(&self) -> PlayState {
        self.play_state
    }

    pub fn is_rolling(&self) -> bool {
        self.play_state == PlayState::Rolling
    }

    pub fn position(&self) -> &TransportPosition {
        &self.position
    }

    pub fn frame(&self) -> i64 {
        self.position.frame
    }

    pub fn pending_relocation(&self) -> Option<i64> {
        self.relocation.map(|r| r.target)
    }

    /// Tick the pending relocation lands on under `converter`
    pub fn pending_relocation_tick(&self, converter: &TickFrameConverter) -> Option<f64> {
        self.relocation
            .map(|r| converter.frame_to_tick(r.target) + r.tick_mismatch)
    }

    /// Start rolling at the next cycle boundary.
    pub fn start(&mut self) {
        self.requested = Some(PlayState::Rolling);
    }

    /// Stop at the next cycle boundary. The frame is retained.
    pub fn stop(&mut self) {
        self.requested = Some(PlayState::Stopped);
    }

    /// Request a jump to `frame`.
    ///
    /// Negative targets clamp to 0 and targets past `end` (the song end under
    /// non-looping song playback) clamp to `end`. A newer request replaces a
    /// pending one.
    pub fn relocate(&mut self, frame: i64, end: Option<i64>, delay: RelocationDelay) {
        self.relocate_with_mismatch(frame, 0.0, end, delay);
    }

    /// Like [`Transport::relocate`] for a target derived from a tick, with
    /// the rounding mismatch reported by the converter. A clamped target
    /// drops the mismatch.
    pub fn relocate_with_mismatch(&mut self, frame: i64, tick_mismatch: f64, end: Option<i64>, delay: RelocationDelay) {
        let mut target = frame;
        let mut tick_mismatch = tick_mismatch;
        if target < 0 {
            warn!(frame, "Relocation target before song start, using 0");
            target = 0;
            tick_mismatch = 0.0;
        }
        if let Some(end) = end
            && target > end
        {
            warn!(frame, end, "Relocation target past song end, using song end");
            target = end.max(0);
            tick_mismatch = 0.0;
        }

        debug!(target, cycles = delay.cycles(), "Relocation requested");
        self.relocation = Some(PendingRelocation {
            target,
            tick_mismatch,
            cycles_left: delay.cycles(),
        });
    }

    /// Move the target of a pending relocation, keeping its remaining delay.
    /// Used when the tempo changes before the relocation resolved.
    pub fn retarget_relocation(&mut self, frame: i64, tick_mismatch: f64) -> bool {
        let Some(relocation) = self.relocation.as_mut() else {
            return false;
        };
        relocation.target = frame.max(0);
        relocation.tick_mismatch = tick_mismatch;
        true
    }

    /// Apply pending requests and hand out the window of the upcoming cycle.
    pub fn begin_cycle(&mut self, frames: u32) -> CycleWindow {
        if let Some(state) = self.requested.take() {
            self.play_state = state;
        }

        let mut relocated = false;
        if let Some(relocation) = self.relocation.as_mut() {
            relocation.cycles_left = relocation.cycles_left.saturating_sub(1);
            if relocation.cycles_left == 0 {
                self.position.frame = relocation.target;
                self.position.tick_mismatch = relocation.tick_mismatch;
                self.relocation = None;
                relocated = true;
            }
        }

        let window = CycleWindow {
            start: self.position.frame,
            frames,
            rolling: self.is_rolling(),
            relocated,
        };
        self.current_cycle = Some(window);
        window
    }

    /// Move the playhead past the cycle handed out by `begin_cycle`.
    pub fn end_cycle(&mut self) {
        let Some(window) = self.current_cycle.take() else {
            return;
        };
        // A snap or stop issued during the cycle wins over the advance
        if window.rolling && self.is_rolling() && self.position.frame == window.start {
            self.position.frame = window.end();
        }
    }

    /// Move the playhead immediately, e.g. when an external transport
    /// reports a different position. Pending relocations are dropped.
    pub fn snap(&mut self, frame: i64, play_state: PlayState) {
        self.position.frame = frame.max(0);
        self.position.tick_mismatch = 0.0;
        self.play_state = play_state;
        self.requested = None;
        self.relocation = None;
    }

    /// Replace the frame while keeping play state and pending requests.
    /// Used when the tempo changes under a fixed tick position.
    pub fn set_frame(&mut self, frame: i64, tick_mismatch: f64) {
        self.position.frame = frame.max(0);
        self.position.tick_mismatch = tick_mismatch;
    }

    /// Back to a stopped transport at frame 0.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Recompute tick, tempo and column information for the current frame.
    ///
    /// `pattern_length` is the length of the playing patterns, used in
    /// pattern mode.
    pub fn refresh(&mut self, converter: &TickFrameConverter, song: &Song, pattern_length: u32) {
        let position = &mut self.position;
        position.tick = converter.frame_to_tick(position.frame) + position.tick_mismatch;
        let segment = converter.segment_at_tick(position.tick);
        position.bpm = segment.bpm;
        position.tick_size = segment.tick_size;

        let tick = position.tick.max(0.0).floor() as u64;
        match song.mode {
            PlaybackMode::Song => match song.column_for_tick(tick, song.loop_enabled) {
                Some((column, start)) => {
                    position.column = column as i32;
                    position.pattern_start_tick = start;
                    position.pattern_tick_position = tick - start;
                }
                None => {
                    position.column = -1;
                    position.pattern_start_tick = tick;
                    position.pattern_tick_position = 0;
                }
            },
            PlaybackMode::Pattern => {
                let length = pattern_length.max(1) as u64;
                position.column = 0;
                position.pattern_start_tick = tick - tick % length;
                position.pattern_tick_position = tick % length;
            }
        }
    }
}
