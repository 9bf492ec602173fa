//! In-process shared transport
//!
//! Plays the role of a studio-wide transport server: clients see one shared
//! frame position, requests take effect at the server's next cycle and one
//! client at a time can be leader, answering the server's position requests
//! with bar/beat/tick information. Used by the offline driver and tests.

use std::sync::Arc;

use drumline_core::{Bbt, ExternalPosition, SharedTransport};
use parking_lot::Mutex;
use tracing::{debug, info};

/// Ticks per beat the server reports for its own leader tempo
const SERVER_TICKS_PER_BEAT: f64 = 1920.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leader {
    Client(u64),
    /// Some client outside this process
    Foreign,
}

#[derive(Debug)]
struct ServerState {
    sample_rate: u32,
    frame: i64,
    rolling: bool,
    connected: bool,
    pending_locate: Option<i64>,
    pending_rolling: Option<bool>,
    leader: Option<Leader>,
    /// Frame the leader has been asked to describe this cycle
    position_request: Option<i64>,
    leader_bbt: Option<Bbt>,
    /// Tempo of a foreign leader
    foreign_bpm: f32,
    next_client: u64,
}

/// Server side of the simulated shared transport
#[derive(Clone)]
pub struct SimulatedTransport {
    inner: Arc<Mutex<ServerState>>,
}

impl SimulatedTransport {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ServerState {
                sample_rate: sample_rate.max(1),
                frame: 0,
                rolling: false,
                connected: true,
                pending_locate: None,
                pending_rolling: None,
                leader: None,
                position_request: None,
                leader_bbt: None,
                foreign_bpm: f32::NAN,
                next_client: 1,
            })),
        }
    }

    /// Connect a new client
    pub fn client(&self) -> SimulatedClient {
        let mut state = self.inner.lock();
        let id = state.next_client;
        state.next_client += 1;
        SimulatedClient {
            id,
            inner: self.inner.clone(),
        }
    }

    /// Apply pending requests and ask the leader for the current position.
    /// Called before the clients process a cycle.
    pub fn begin_cycle(&self) {
        let mut state = self.inner.lock();
        if let Some(frame) = state.pending_locate.take() {
            debug!(frame, "Shared transport located");
            state.frame = frame;
        }
        if let Some(rolling) = state.pending_rolling.take() {
            state.rolling = rolling;
        }
        state.position_request = match state.leader {
            Some(Leader::Client(_)) => Some(state.frame),
            _ => None,
        };
    }

    /// Advance by `frames` when rolling. Called after the clients processed
    /// a cycle.
    pub fn end_cycle(&self, frames: u32) {
        let mut state = self.inner.lock();
        if state.rolling {
            state.frame += frames as i64;
        }
    }

    pub fn frame(&self) -> i64 {
        self.inner.lock().frame
    }

    pub fn is_rolling(&self) -> bool {
        self.inner.lock().rolling
    }

    pub fn locate(&self, frame: i64) {
        self.inner.lock().pending_locate = Some(frame.max(0));
    }

    pub fn set_rolling(&self, rolling: bool) {
        self.inner.lock().pending_rolling = Some(rolling);
    }

    /// Let a client outside this process take the leader role at `bpm`.
    pub fn install_foreign_leader(&self, bpm: f32) {
        let mut state = self.inner.lock();
        info!(bpm, "Foreign client took the leader role");
        state.leader = Some(Leader::Foreign);
        state.foreign_bpm = bpm;
        state.leader_bbt = None;
        state.position_request = None;
    }

    pub fn remove_foreign_leader(&self) {
        let mut state = self.inner.lock();
        if state.leader == Some(Leader::Foreign) {
            state.leader = None;
            state.foreign_bpm = f32::NAN;
        }
    }

    /// Id of the leading client, if one of ours leads
    pub fn leader_client(&self) -> Option<u64> {
        match self.inner.lock().leader {
            Some(Leader::Client(id)) => Some(id),
            _ => None,
        }
    }

    /// Position published by the leading client
    pub fn leader_bbt(&self) -> Option<Bbt> {
        self.inner.lock().leader_bbt
    }

    pub fn disconnect(&self) {
        self.inner.lock().connected = false;
    }

    pub fn reconnect(&self) {
        self.inner.lock().connected = true;
    }
}

fn foreign_bbt(frame: i64, sample_rate: u32, bpm: f32) -> Bbt {
    let frames_per_beat = sample_rate as f64 * 60.0 / bpm as f64;
    let beats = frame.max(0) as f64 / frames_per_beat;
    let whole = beats.floor();
    Bbt {
        bar: (whole as u64 / 4) as u32 + 1,
        beat: (whole as u64 % 4) as u32 + 1,
        tick: ((beats - whole) * SERVER_TICKS_PER_BEAT) as u32,
        ticks_per_beat: SERVER_TICKS_PER_BEAT,
        beats_per_bar: 4.0,
        bpm,
    }
}

/// Client connection to a [`SimulatedTransport`]
pub struct SimulatedClient {
    id: u64,
    inner: Arc<Mutex<ServerState>>,
}

impl SimulatedClient {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl SharedTransport for SimulatedClient {
    fn poll(&mut self) -> Option<ExternalPosition> {
        let state = self.inner.lock();
        if !state.connected {
            return None;
        }

        let (bpm, bbt) = match state.leader {
            Some(Leader::Foreign) => {
                let bbt = foreign_bbt(state.frame, state.sample_rate, state.foreign_bpm);
                (state.foreign_bpm, Some(bbt))
            }
            Some(Leader::Client(_)) => (state.leader_bbt.map_or(f32::NAN, |b| b.bpm), state.leader_bbt),
            None => (f32::NAN, None),
        };

        Some(ExternalPosition {
            frame: state.frame,
            rolling: state.rolling,
            bpm,
            bbt,
        })
    }

    fn take_position_request(&mut self) -> Option<i64> {
        let mut state = self.inner.lock();
        if state.connected && state.leader == Some(Leader::Client(self.id)) {
            state.position_request.take()
        } else {
            None
        }
    }

    fn publish_position(&mut self, bbt: Bbt) {
        let mut state = self.inner.lock();
        if state.leader == Some(Leader::Client(self.id)) {
            state.leader_bbt = Some(bbt);
        }
    }

    /// Registration is unconditional: an existing leader is replaced.
    fn register_leader(&mut self) -> bool {
        let mut state = self.inner.lock();
        if !state.connected {
            return false;
        }
        state.leader = Some(Leader::Client(self.id));
        state.leader_bbt = None;
        state.foreign_bpm = f32::NAN;
        true
    }

    fn release_leader(&mut self) {
        let mut state = self.inner.lock();
        if state.leader == Some(Leader::Client(self.id)) {
            state.leader = None;
            state.leader_bbt = None;
            state.position_request = None;
        }
    }

    fn request_locate(&mut self, frame: i64) {
        self.inner.lock().pending_locate = Some(frame.max(0));
    }

    fn request_start(&mut self) {
        self.inner.lock().pending_rolling = Some(true);
    }

    fn request_stop(&mut self) {
        self.inner.lock().pending_rolling = Some(false);
    }
}
