//! Timeline holding tempo markers and tags keyed by bar

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Lowest tempo the engine will play at
pub const MIN_BPM: f32 = 10.0;
/// Highest tempo the engine will play at
pub const MAX_BPM: f32 = 400.0;

/// Clamp a tempo into `[MIN_BPM, MAX_BPM]`, logging when the input was out of range.
pub fn clamp_bpm(bpm: f32) -> f32 {
    if bpm.is_nan() {
        warn!(bound = MIN_BPM, "Provided bpm is not a number, assigning lower bound");
        MIN_BPM
    } else if bpm < MIN_BPM {
        warn!(bpm, bound = MIN_BPM, "Provided bpm is too low, assigning lower bound");
        MIN_BPM
    } else if bpm > MAX_BPM {
        warn!(bpm, bound = MAX_BPM, "Provided bpm is too high, assigning upper bound");
        MAX_BPM
    } else {
        bpm
    }
}

/// Tempo change taking effect at the start of `bar`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoMarker {
    pub bar: u32,
    pub bpm: f32,
}

/// Text label attached to a bar
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub bar: u32,
    pub text: String,
}

/// Tempo map and tags of a song.
///
/// Both lists are kept sorted by bar. The sort is stable, so should two
/// markers ever share a bar the one added last is the one `tempo_at_bar`
/// reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    tempo_markers: Vec<TempoMarker>,
    #[serde(default)]
    tags: Vec<Tag>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tempo marker and re-sort. The bpm is clamped into range.
    ///
    /// Does not remove an existing marker at the same bar; callers wanting
    /// replace semantics use [`Timeline::replace_tempo_marker`].
    pub fn add_tempo_marker(&mut self, bar: u32, bpm: f32) {
        let bpm = clamp_bpm(bpm);
        self.tempo_markers.push(TempoMarker { bar, bpm });
        self.sort_tempo_markers();
    }

    /// Remove any marker at `bar`, then add the new one.
    pub fn replace_tempo_marker(&mut self, bar: u32, bpm: f32) {
        self.delete_tempo_marker(bar);
        self.add_tempo_marker(bar, bpm);
    }

    /// Remove all markers located at `bar`.
    pub fn delete_tempo_marker(&mut self, bar: u32) {
        self.tempo_markers.retain(|m| m.bar != bar);
        self.sort_tempo_markers();
    }

    /// Tempo in effect at `bar`.
    ///
    /// A negative bar (the engine reports -1 while stopped) is treated as
    /// bar 0. Bars in front of a first marker not sitting on bar 0 use the
    /// song's `fallback_bpm`.
    pub fn tempo_at_bar(&self, bar: i32, fallback_bpm: f32) -> f32 {
        let Some(first) = self.tempo_markers.first() else {
            return fallback_bpm;
        };

        let bar = bar.max(0) as u32;
        if self.is_first_tempo_marker_special() && bar < first.bar {
            return fallback_bpm;
        }

        self.tempo_markers
            .iter()
            .take_while(|m| m.bar <= bar)
            .last()
            .map_or(fallback_bpm, |m| m.bpm)
    }

    /// Whether bar 0 has no explicit marker, so the song tempo governs
    /// everything in front of the first marker.
    pub fn is_first_tempo_marker_special(&self) -> bool {
        self.tempo_markers.first().is_none_or(|m| m.bar != 0)
    }

    /// All markers as shown to the user, with a synthesized bar-0 marker
    /// carrying `fallback_bpm` when no explicit one exists.
    pub fn all_tempo_markers(&self, fallback_bpm: f32) -> Vec<TempoMarker> {
        let mut markers = Vec::with_capacity(self.tempo_markers.len() + 1);
        if self.is_first_tempo_marker_special() {
            markers.push(TempoMarker { bar: 0, bpm: fallback_bpm });
        }
        markers.extend_from_slice(&self.tempo_markers);
        markers
    }

    /// Stored markers, without the synthesized bar-0 entry
    pub fn tempo_markers(&self) -> &[TempoMarker] {
        &self.tempo_markers
    }

    pub fn has_tempo_markers(&self) -> bool {
        !self.tempo_markers.is_empty()
    }

    pub fn add_tag(&mut self, bar: u32, text: impl Into<String>) {
        self.tags.push(Tag { bar, text: text.into() });
        self.sort_tags();
    }

    /// Remove any tag at `bar`, then add the new one.
    pub fn replace_tag(&mut self, bar: u32, text: impl Into<String>) {
        self.delete_tag(bar);
        self.add_tag(bar, text);
    }

    pub fn delete_tag(&mut self, bar: u32) {
        self.tags.retain(|t| t.bar != bar);
        self.sort_tags();
    }

    /// Tag text for `bar`.
    ///
    /// With `sticky` the closest tag at or before `bar` is returned,
    /// otherwise only a tag placed exactly on `bar`.
    pub fn tag_at_bar(&self, bar: u32, sticky: bool) -> Option<&str> {
        let tag = if sticky {
            self.tags.iter().take_while(|t| t.bar <= bar).last()
        } else {
            self.tags.iter().rfind(|t| t.bar == bar)
        };
        tag.map(|t| t.text.as_str())
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Restore the sort order after deserialization.
    pub(crate) fn normalize(&mut self) {
        for marker in &mut self.tempo_markers {
            marker.bpm = clamp_bpm(marker.bpm);
        }
        self.sort_tempo_markers();
        self.sort_tags();
    }

    fn sort_tempo_markers(&mut self) {
        self.tempo_markers.sort_by_key(|m| m.bar);
    }

    fn sort_tags(&mut self) {
        self.tags.sort_by_key(|t| t.bar);
    }
}
