//! Song arrangement: patterns chained into columns, plus the timeline

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DrumlineError, Result};
use crate::pattern::{DEFAULT_RESOLUTION, Instrument, InstrumentId, MAX_NOTES, Note, Pattern};
use crate::timeline::{Timeline, clamp_bpm};

/// Playback mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackMode {
    /// Loop the playing patterns
    Pattern,
    /// Play through the column sequence
    Song,
}

impl Default for PlaybackMode {
    fn default() -> Self {
        Self::Song
    }
}

/// A drum song.
///
/// Columns form the song arrangement: each column plays a set of patterns
/// side by side and lasts as long as its longest pattern. A column is one
/// bar as far as tempo markers and tags are concerned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Song {
    pub name: String,
    /// Song tempo, used whenever the timeline does not provide one
    pub bpm: f32,
    /// Ticks per quarter note
    #[serde(default = "default_resolution")]
    pub resolution: u32,
    #[serde(default)]
    pub instruments: Vec<Instrument>,
    #[serde(default)]
    pub patterns: Vec<Pattern>,
    /// Pattern indices played per column
    #[serde(default)]
    pub columns: Vec<Vec<usize>>,
    #[serde(default)]
    pub timeline: Timeline,
    #[serde(default)]
    pub timeline_activated: bool,
    #[serde(default)]
    pub mode: PlaybackMode,
    #[serde(default)]
    pub loop_enabled: bool,
    /// Random timing humanization amount in [0, 1]
    #[serde(default)]
    pub humanize_time: f32,
    /// Swing amount in [0, 1] applied to off-beat sixteenths
    #[serde(default)]
    pub swing: f32,
}

fn default_resolution() -> u32 {
    DEFAULT_RESOLUTION
}

impl Default for Song {
    fn default() -> Self {
        Self {
            name: String::from("Untitled"),
            bpm: 120.0,
            resolution: DEFAULT_RESOLUTION,
            instruments: Vec::new(),
            patterns: Vec::new(),
            columns: Vec::new(),
            timeline: Timeline::new(),
            timeline_activated: false,
            mode: PlaybackMode::Song,
            loop_enabled: false,
            humanize_time: 0.0,
            swing: 0.0,
        }
    }
}

impl Song {
    pub fn new(name: impl Into<String>, bpm: f32) -> Self {
        Self {
            name: name.into(),
            bpm: clamp_bpm(bpm),
            ..Default::default()
        }
    }

    pub fn add_instrument(&mut self, name: impl Into<String>) -> InstrumentId {
        let next = self.instruments.iter().map(|i| i.id.0).max().map_or(1, |id| id + 1);
        let id = InstrumentId(next);
        self.instruments.push(Instrument {
            id,
            name: name.into(),
            muted: false,
        });
        id
    }

    pub fn instrument(&self, id: InstrumentId) -> Option<&Instrument> {
        self.instruments.iter().find(|i| i.id == id)
    }

    pub fn add_pattern(&mut self, pattern: Pattern) -> usize {
        self.patterns.push(pattern);
        self.patterns.len() - 1
    }

    /// Append a column playing `patterns`. Unknown pattern indices are rejected.
    pub fn add_column(&mut self, patterns: Vec<usize>) -> Result<usize> {
        if let Some(&missing) = patterns.iter().find(|&&p| p >= self.patterns.len()) {
            return Err(DrumlineError::PatternNotFound(missing));
        }
        self.columns.push(patterns);
        Ok(self.columns.len() - 1)
    }

    /// Length in ticks of a column: its longest pattern, or `MAX_NOTES` when empty.
    pub fn column_length(&self, column: usize) -> u32 {
        self.columns
            .get(column)
            .and_then(|c| c.iter().filter_map(|&p| self.patterns.get(p)).map(|p| p.length.max(1)).max())
            .unwrap_or(MAX_NOTES)
    }

    /// Longest of the given patterns, `MAX_NOTES` when none is given.
    pub fn longest_pattern_length(&self, patterns: &[usize]) -> u32 {
        patterns
            .iter()
            .filter_map(|&p| self.patterns.get(p))
            .map(|p| p.length.max(1))
            .max()
            .unwrap_or(MAX_NOTES)
    }

    /// Total length of one pass through all columns
    pub fn size_in_ticks(&self) -> u64 {
        (0..self.columns.len()).map(|c| self.column_length(c) as u64).sum()
    }

    /// Tick at which `column` starts. Column -1 denotes the song start.
    pub fn tick_for_column(&self, column: i32) -> Result<u64> {
        if self.columns.is_empty() {
            return Err(DrumlineError::EmptySong);
        }
        if column < 0 {
            return Ok(0);
        }

        let mut column = column as usize;
        if column >= self.columns.len() {
            if !self.loop_enabled {
                return Err(DrumlineError::ColumnOutOfRange {
                    column: column as i32,
                    columns: self.columns.len(),
                });
            }
            column %= self.columns.len();
        }

        Ok((0..column).map(|c| self.column_length(c) as u64).sum())
    }

    /// Column containing `tick` and the tick that column starts at.
    ///
    /// With `loop_enabled` ticks past the song end wrap around and the
    /// returned start tick lies in the same pass as `tick`.
    pub fn column_for_tick(&self, tick: u64, loop_enabled: bool) -> Option<(usize, u64)> {
        let size = self.size_in_ticks();
        if size == 0 {
            return None;
        }

        let (offset, local) = if tick >= size {
            if !loop_enabled {
                return None;
            }
            ((tick / size) * size, tick % size)
        } else {
            (0, tick)
        };

        let mut start = 0u64;
        for column in 0..self.columns.len() {
            let length = self.column_length(column) as u64;
            if local < start + length {
                return Some((column, offset + start));
            }
            start += length;
        }
        None
    }

    /// Drop notes pointing to unknown instruments and columns pointing to
    /// unknown patterns, and restore ordering invariants. Returns the number
    /// of removed items.
    pub fn repair(&mut self) -> usize {
        self.bpm = clamp_bpm(self.bpm);
        if self.resolution == 0 {
            warn!("Song resolution of 0 ticks, using default");
            self.resolution = DEFAULT_RESOLUTION;
        }
        self.humanize_time = self.humanize_time.clamp(0.0, 1.0);
        self.swing = self.swing.clamp(0.0, 1.0);
        self.timeline.normalize();

        let known: Vec<InstrumentId> = self.instruments.iter().map(|i| i.id).collect();
        let mut removed = 0;
        for pattern in &mut self.patterns {
            if pattern.length == 0 {
                warn!(pattern = %pattern.name, "Pattern of 0 ticks, using 1");
                pattern.length = 1;
            }
            pattern.sort_notes();
            let dropped = pattern.retain_notes(|n| known.contains(&n.instrument));
            if dropped > 0 {
                warn!(pattern = %pattern.name, dropped, "Skipping notes with unknown instruments");
            }
            removed += dropped;
        }

        let pattern_count = self.patterns.len();
        for (idx, column) in self.columns.iter_mut().enumerate() {
            let before = column.len();
            column.retain(|&p| p < pattern_count);
            let dropped = before - column.len();
            if dropped > 0 {
                warn!(column = idx, dropped, "Skipping unknown patterns in column");
            }
            removed += dropped;
        }

        removed
    }

    /// Small four-column rock beat
    pub fn demo() -> Self {
        let mut song = Song::new("Demo", 120.0);
        let kick = song.add_instrument("Kick");
        let snare = song.add_instrument("Snare");
        let hihat = song.add_instrument("Hi-Hat");
        let beat = song.resolution;

        let mut groove = Pattern::new("Groove", MAX_NOTES);
        for step in 0..8 {
            groove.add_note(Note::new(hihat, step * beat / 2).with_velocity(0.6));
        }
        groove.add_note(Note::new(kick, 0));
        groove.add_note(Note::new(kick, 2 * beat));
        groove.add_note(Note::new(snare, beat));
        groove.add_note(Note::new(snare, 3 * beat).with_lead_lag(0.3));

        let mut fill = Pattern::new("Fill", MAX_NOTES);
        for step in 0..16 {
            fill.add_note(Note::new(snare, step * beat / 4).with_velocity(0.5 + step as f32 / 32.0));
        }

        let groove = song.add_pattern(groove);
        let fill = song.add_pattern(fill);
        song.columns = vec![vec![groove], vec![groove], vec![groove], vec![fill]];
        song
    }
}
