//! Offline driver: runs process cycles without an audio device
//!
//! Used for headless simulation and tests. When a simulated shared transport
//! is attached, every cycle is wrapped in the server's begin/end cycle calls
//! the way a transport server would drive its clients.

use crossbeam_channel::Receiver;
use drumline_core::{ClockRole, TransportState};
use tracing::trace;

use crate::audio_engine::{AudioEngine, PlayedNote};
use crate::shared_transport::SimulatedTransport;

/// Notes buffered by the driver's tap between two drains
const TAP_CAPACITY: usize = 1 << 16;

/// Summary of an offline run
#[derive(Debug, Clone, Default)]
pub struct OfflineReport {
    pub cycles: usize,
    /// Cycles skipped because the engine lock was busy
    pub skipped: u64,
    /// Playhead frame after the last cycle
    pub final_frame: i64,
    pub final_tick: f64,
    pub final_bpm: f32,
    pub final_state: TransportState,
    pub role: ClockRole,
    pub notes: Vec<PlayedNote>,
    /// Largest absolute sample rendered
    pub peak: f32,
}

impl OfflineReport {
    /// Extend with a report of the cycles that followed.
    pub fn append(&mut self, next: OfflineReport) {
        self.cycles += next.cycles;
        self.skipped += next.skipped;
        self.peak = self.peak.max(next.peak);
        self.notes.extend(next.notes);
        self.final_frame = next.final_frame;
        self.final_tick = next.final_tick;
        self.final_bpm = next.final_bpm;
        self.final_state = next.final_state;
        self.role = next.role;
    }
}

/// Drives an [`AudioEngine`] cycle by cycle
pub struct OfflineDriver<'a> {
    engine: &'a AudioEngine,
    shared: Option<SimulatedTransport>,
    notes: Receiver<PlayedNote>,
    buffer: Vec<f32>,
    channels: u16,
    frames: u32,
}

impl<'a> OfflineDriver<'a> {
    pub fn new(engine: &'a AudioEngine, buffer_size: u32, channels: u16) -> Self {
        let channels = channels.max(1);
        let frames = buffer_size.max(1);
        Self {
            notes: engine.tap_notes(TAP_CAPACITY),
            engine,
            shared: None,
            buffer: vec![0.0; frames as usize * channels as usize],
            channels,
            frames,
        }
    }

    /// Drive `shared` alongside the engine. The engine has to be connected
    /// to it through one of its clients.
    pub fn with_shared_transport(mut self, shared: SimulatedTransport) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn buffer_size(&self) -> u32 {
        self.frames
    }

    /// Samples of the last cycle, interleaved
    pub fn buffer(&self) -> &[f32] {
        &self.buffer
    }

    /// Run one cycle. Returns false when the engine skipped it.
    pub fn run_cycle(&mut self) -> bool {
        if let Some(shared) = &self.shared {
            shared.begin_cycle();
        }
        let processed = self.engine.process(&mut self.buffer, self.channels);
        if let Some(shared) = &self.shared {
            shared.end_cycle(self.frames);
        }
        processed
    }

    /// Run `cycles` cycles and collect what the engine played.
    pub fn run(&mut self, cycles: usize) -> OfflineReport {
        let mut report = OfflineReport::default();
        let skipped_before = self.engine.skipped_cycles();

        for _ in 0..cycles {
            self.run_cycle();
            report.notes.extend(self.notes.try_iter());
            let peak = self.buffer.iter().fold(0.0f32, |m, s| m.max(s.abs()));
            report.peak = report.peak.max(peak);
        }

        report.cycles = cycles;
        report.skipped = self.engine.skipped_cycles() - skipped_before;
        report.final_frame = self.engine.position();
        report.final_tick = self.engine.current_tick();
        report.final_bpm = self.engine.current_bpm();
        report.final_state = self.engine.transport_state();
        report.role = self.engine.clock_role();
        trace!(
            cycles,
            notes = report.notes.len(),
            frame = report.final_frame,
            "Offline run finished"
        );
        report
    }

    /// Run cycles until the transport stops or `max_cycles` ran.
    pub fn run_until_stopped(&mut self, max_cycles: usize) -> OfflineReport {
        let mut report = OfflineReport::default();
        for _ in 0..max_cycles {
            report.append(self.run(1));
            if !self.engine.is_playing() {
                break;
            }
        }
        report
    }
}
