//! drumline-core: Timing domain of the drumline sequencer

pub mod clock;
pub mod conversion;
mod error;
pub mod pattern;
mod preferences;
pub mod scheduler;
pub mod song;
mod timeline;
pub mod transport;

pub use clock::{
    Bbt, ClockContext, ClockRole, ClockSync, ExternalClock, ExternalPosition, Reconciled, SharedTransport,
    LEADER_TRACKING_CYCLES,
};
pub use conversion::{TempoPlan, TempoSegment, TickFrameConverter, FRAME_EPSILON, TICK_EPSILON};
pub use error::{DrumlineError, Result};
pub use pattern::{Instrument, InstrumentId, Note, Pattern, DEFAULT_RESOLUTION, MAX_NOTES};
pub use preferences::{PatternModeKind, Preferences};
pub use scheduler::{NoteScheduler, NoteSink, NoteSource, ScheduleContext, ScheduledNote, TickInterval};
pub use song::{PlaybackMode, Song};
pub use timeline::{clamp_bpm, Tag, TempoMarker, Timeline, MAX_BPM, MIN_BPM};
pub use transport::{CycleWindow, PlayState, RelocationDelay, Transport, TransportPosition, TransportState};
