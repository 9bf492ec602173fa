//! drumline-services: Audio engine, drivers and command layer

pub mod actions;
pub mod audio_engine;
pub mod audio_io;
pub mod controller;
pub mod offline;
mod render;
pub mod shared_transport;

pub use actions::{Action, ActionEntry, ActionError, ActionMap, MidiTrigger};
pub use audio_engine::{AudioEngine, AudioEngineError, EngineEvent, EngineState, PlayedNote, TempoSource};
pub use audio_io::{AudioOutputError, RealtimeOutputStream, default_device_info};
pub use controller::Controller;
pub use offline::{OfflineDriver, OfflineReport};
pub use shared_transport::{SimulatedClient, SimulatedTransport};
