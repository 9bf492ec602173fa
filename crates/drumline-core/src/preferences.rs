//! User preferences relevant to playback

use serde::{Deserialize, Serialize};

use crate::error::{DrumlineError, Result};
use crate::scheduler::DEFAULT_QUEUE_CAPACITY;

/// Which patterns play in pattern mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternModeKind {
    /// Only the selected pattern
    #[default]
    Selected,
    /// A set of patterns toggled on and off, changes applied at the next
    /// pattern boundary
    Stacked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub sample_rate: u32,
    /// Frames per process cycle
    pub buffer_size: u32,
    /// Enable loop mode on every loaded song
    pub loop_mode: bool,
    pub pattern_mode: PatternModeKind,
    pub metronome: bool,
    pub metronome_volume: f32,
    /// Honour tempo markers of activated timelines
    pub use_timeline: bool,
    /// Synchronize with a shared transport
    pub external_transport: bool,
    /// Ask for the leader role when synchronizing
    pub timebase_leader: bool,
    /// Longest wait for the engine lock inside the audio callback
    pub lock_timeout_ms: u64,
    pub note_queue_capacity: usize,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            buffer_size: 1024,
            loop_mode: false,
            pattern_mode: PatternModeKind::Selected,
            metronome: false,
            metronome_volume: 0.5,
            use_timeline: true,
            external_transport: false,
            timebase_leader: false,
            lock_timeout_ms: 5,
            note_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Preferences {
    /// Reject values the engine cannot run with and clamp soft ones.
    pub fn validate(mut self) -> Result<Self> {
        if !(8_000..=384_000).contains(&self.sample_rate) {
            return Err(DrumlineError::InvalidConfig(format!(
                "sample rate {} outside 8000..=384000",
                self.sample_rate
            )));
        }
        if !(16..=16_384).contains(&self.buffer_size) {
            return Err(DrumlineError::InvalidConfig(format!(
                "buffer size {} outside 16..=16384",
                self.buffer_size
            )));
        }
        if self.note_queue_capacity == 0 {
            return Err(DrumlineError::InvalidConfig("note queue capacity of 0".into()));
        }
        self.metronome_volume = self.metronome_volume.clamp(0.0, 1.0);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let prefs = Preferences::default().validate().unwrap();
        assert_eq!(prefs.sample_rate, 44100);
        assert_eq!(prefs.buffer_size, 1024);
        assert_eq!(prefs.pattern_mode, PatternModeKind::Selected);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let prefs = Preferences {
            buffer_size: 3,
            ..Default::default()
        };
        assert!(matches!(prefs.validate(), Err(DrumlineError::InvalidConfig(_))));

        let prefs = Preferences {
            sample_rate: 0,
            ..Default::default()
        };
        assert!(prefs.validate().is_err());
    }

    #[test]
    fn test_volume_clamped() {
        let prefs = Preferences {
            metronome_volume: 4.0,
            ..Default::default()
        };
        assert_eq!(prefs.validate().unwrap().metronome_volume, 1.0);
    }
}
