//! Drum patterns, notes and instruments

use serde::{Deserialize, Serialize};

/// Default ticks per quarter note
pub const DEFAULT_RESOLUTION: u32 = 48;

/// Length in ticks of a default pattern, also used for empty columns
pub const MAX_NOTES: u32 = 192;

/// Stable handle of an instrument within a song
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrumentId(pub u64);

/// Drumkit instrument a note triggers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub name: String,
    #[serde(default)]
    pub muted: bool,
}

/// A single hit inside a pattern
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub instrument: InstrumentId,
    /// Position in ticks from the pattern start
    pub position: u32,
    #[serde(default = "default_velocity")]
    pub velocity: f32,
    /// Deterministic timing offset in [-1, 1], scaled by the lead/lag range
    #[serde(default)]
    pub lead_lag: f32,
}

fn default_velocity() -> f32 {
    0.8
}

impl Note {
    pub fn new(instrument: InstrumentId, position: u32) -> Self {
        Self {
            instrument,
            position,
            velocity: default_velocity(),
            lead_lag: 0.0,
        }
    }

    pub fn with_velocity(mut self, velocity: f32) -> Self {
        self.velocity = velocity.clamp(0.0, 1.0);
        self
    }

    pub fn with_lead_lag(mut self, lead_lag: f32) -> Self {
        self.lead_lag = lead_lag.clamp(-1.0, 1.0);
        self
    }
}

/// Pattern of notes, `length` ticks long
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub name: String,
    /// Length in ticks
    pub length: u32,
    /// Note value of one beat (4 = quarter)
    #[serde(default = "default_denominator")]
    pub denominator: u32,
    /// Notes sorted by position
    #[serde(default)]
    notes: Vec<Note>,
}

fn default_denominator() -> u32 {
    4
}

impl Default for Pattern {
    fn default() -> Self {
        Self::new("Pattern", MAX_NOTES)
    }
}

impl Pattern {
    pub fn new(name: impl Into<String>, length: u32) -> Self {
        Self {
            name: name.into(),
            length: length.max(1),
            denominator: default_denominator(),
            notes: Vec::new(),
        }
    }

    /// Insert a note, keeping notes ordered by position.
    pub fn add_note(&mut self, note: Note) {
        let idx = self.notes.partition_point(|n| n.position <= note.position);
        self.notes.insert(idx, note);
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    /// Notes starting exactly at `tick`
    pub fn notes_at(&self, tick: u32) -> &[Note] {
        let start = self.notes.partition_point(|n| n.position < tick);
        let end = self.notes.partition_point(|n| n.position <= tick);
        &self.notes[start..end]
    }

    /// Number of notes the pattern plays per pass (notes past the end never sound)
    pub fn audible_note_count(&self) -> usize {
        self.notes.iter().filter(|n| n.position < self.length).count()
    }

    /// Drop notes for which `keep` returns false, returning how many were removed.
    pub fn retain_notes<F>(&mut self, keep: F) -> usize
    where
        F: FnMut(&Note) -> bool,
    {
        let before = self.notes.len();
        self.notes.retain(keep);
        before - self.notes.len()
    }

    pub(crate) fn sort_notes(&mut self) {
        self.notes.sort_by_key(|n| n.position);
    }
}
