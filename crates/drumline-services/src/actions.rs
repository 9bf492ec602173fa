//! MIDI-triggered actions
//!
//! Action names are resolved into [`Action`] once, when the action map is
//! built; incoming MIDI messages are then dispatched with a table lookup.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use drumline_core::DrumlineError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::controller::Controller;

/// Tempo step of `BPM_INCR`/`BPM_DECR` when the binding has no parameter
const DEFAULT_BPM_STEP: f32 = 1.0;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("Trigger {0} bound twice")]
    DuplicateTrigger(MidiTrigger),
    #[error("Action failed: {0}")]
    Engine(#[from] DrumlineError),
}

/// Engine command reachable from a MIDI controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Play,
    Stop,
    PlayStopToggle,
    BpmIncr,
    BpmDecr,
    SelectNextPattern,
    SelectPattern,
    LocateToColumn,
    TimelineActivation,
    LoopToggle,
    MetronomeToggle,
}

impl Action {
    pub const ALL: [Action; 11] = [
        Action::Play,
        Action::Stop,
        Action::PlayStopToggle,
        Action::BpmIncr,
        Action::BpmDecr,
        Action::SelectNextPattern,
        Action::SelectPattern,
        Action::LocateToColumn,
        Action::TimelineActivation,
        Action::LoopToggle,
        Action::MetronomeToggle,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Action::Play => "PLAY",
            Action::Stop => "STOP",
            Action::PlayStopToggle => "PLAY/STOP_TOGGLE",
            Action::BpmIncr => "BPM_INCR",
            Action::BpmDecr => "BPM_DECR",
            Action::SelectNextPattern => "SELECT_NEXT_PATTERN",
            Action::SelectPattern => "SELECT_ONLY_NEXT_PATTERN",
            Action::LocateToColumn => "LOCATE_TO_COLUMN",
            Action::TimelineActivation => "TIMELINE_ACTIVATION",
            Action::LoopToggle => "LOOP_TOGGLE",
            Action::MetronomeToggle => "TOGGLE_METRONOME",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Action {
    type Err = ActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Action::ALL
            .into_iter()
            .find(|a| a.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| ActionError::UnknownAction(name.to_string()))
    }
}

/// MIDI message an action is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MidiTrigger {
    Note(u8),
    Cc(u8),
}

impl fmt::Display for MidiTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MidiTrigger::Note(n) => write!(f, "note {n}"),
            MidiTrigger::Cc(c) => write!(f, "cc {c}"),
        }
    }
}

/// Action binding as stored in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEntry {
    pub trigger: MidiTrigger,
    pub action: String,
    /// Action specific parameter, e.g. the tempo step or a column
    #[serde(default)]
    pub param: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Binding {
    action: Action,
    param: Option<i32>,
}

/// Resolved trigger to action table
#[derive(Debug, Clone, Default)]
pub struct ActionMap {
    bindings: HashMap<MidiTrigger, Binding>,
}

impl ActionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve configuration entries. Unknown names and duplicate triggers
    /// are rejected.
    pub fn from_entries<I>(entries: I) -> Result<Self, ActionError>
    where
        I: IntoIterator<Item = ActionEntry>,
    {
        let mut map = Self::new();
        for entry in entries {
            let action = entry.action.parse()?;
            map.bind(entry.trigger, action, entry.param)?;
        }
        Ok(map)
    }

    pub fn bind(&mut self, trigger: MidiTrigger, action: Action, param: Option<i32>) -> Result<(), ActionError> {
        if self.bindings.contains_key(&trigger) {
            return Err(ActionError::DuplicateTrigger(trigger));
        }
        self.bindings.insert(trigger, Binding { action, param });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn action_for(&self, trigger: MidiTrigger) -> Option<Action> {
        self.bindings.get(&trigger).map(|b| b.action)
    }

    /// Run the action bound to `trigger`. `value` is the note velocity or
    /// controller value. Returns whether an action was bound.
    pub fn dispatch(&self, trigger: MidiTrigger, value: u8, controller: &Controller) -> Result<bool, ActionError> {
        let Some(binding) = self.bindings.get(&trigger) else {
            return Ok(false);
        };
        debug!(%trigger, action = %binding.action, value, "Dispatching action");

        match binding.action {
            Action::Play => controller.start(),
            Action::Stop => controller.stop(),
            Action::PlayStopToggle => controller.toggle_play(),
            Action::BpmIncr | Action::BpmDecr => {
                let step = binding.param.map_or(DEFAULT_BPM_STEP, |p| p as f32);
                let step = if binding.action == Action::BpmDecr { -step } else { step };
                controller.set_bpm(controller.song_bpm() + step);
            }
            Action::SelectNextPattern => {
                controller.select_next_pattern()?;
            }
            Action::SelectPattern => {
                let pattern = binding.param.unwrap_or(value as i32);
                if pattern < 0 {
                    warn!(pattern, "Negative pattern index, ignoring");
                    return Ok(true);
                }
                controller.select_pattern(pattern as usize)?;
            }
            Action::LocateToColumn => {
                let column = binding.param.unwrap_or(value as i32);
                controller.locate_to_column(column)?;
            }
            Action::TimelineActivation => {
                let activate = value > 63;
                controller.activate_timeline(activate);
            }
            Action::LoopToggle => controller.set_loop_mode(!controller.is_loop_enabled()),
            Action::MetronomeToggle => controller.set_metronome(!controller.is_metronome_enabled()),
        }
        Ok(true)
    }
}
