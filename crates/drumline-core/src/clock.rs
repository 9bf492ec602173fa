//! Synchronization with an external, studio-wide shared transport
//!
//! The engine either ignores the shared transport's tempo (role `None`),
//! supplies bar/beat/tick information to it (`Leader`) or follows another
//! client's tempo and position (`Follower`). [`ExternalClock::reconcile`] is
//! polled once per process cycle before the transport advances.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::conversion::{TickFrameConverter, compute_tick_size};
use crate::song::{PlaybackMode, Song};
use crate::timeline::clamp_bpm;
use crate::transport::PlayState;

/// Cycles the leader role survives without being asked for a position
pub const LEADER_TRACKING_CYCLES: u32 = 5;

/// Tempo differences below this are treated as jitter
pub const BPM_EPSILON: f32 = 1e-3;

/// Bar/beat/tick position with tempo, bars and beats counted from 1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbt {
    pub bar: u32,
    pub beat: u32,
    pub tick: u32,
    pub ticks_per_beat: f64,
    pub beats_per_bar: f32,
    pub bpm: f32,
}

/// Shared transport state as seen in one cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExternalPosition {
    pub frame: i64,
    pub rolling: bool,
    /// Tempo advertised by the leader, NaN without one
    pub bpm: f32,
    /// Present when some client acts as leader
    pub bbt: Option<Bbt>,
}

/// Client side of a studio-wide shared transport
pub trait SharedTransport: Send {
    /// Current shared position, `None` when disconnected
    fn poll(&mut self) -> Option<ExternalPosition>;

    /// Position request addressed to the leader, carrying the frame to describe
    fn take_position_request(&mut self) -> Option<i64>;

    /// Answer to a position request
    fn publish_position(&mut self, bbt: Bbt);

    /// Try to become leader. Returns whether the role was granted.
    fn register_leader(&mut self) -> bool;

    fn release_leader(&mut self);

    fn request_locate(&mut self, frame: i64);

    fn request_start(&mut self);

    fn request_stop(&mut self);
}

/// Relation of the engine to the shared transport's leader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClockRole {
    #[default]
    None,
    Leader,
    Follower,
}

/// Position the transport has to adopt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciled {
    pub frame: i64,
    pub play_state: PlayState,
    /// New leader tempo, set when it changed
    pub bpm: Option<f32>,
}

/// Outcome of one reconciliation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockSync {
    NoChange,
    Reconciled(Reconciled),
    /// Leader or follower role ended, the tempo map applies again
    RoleLost,
}

/// What the adapter needs to know about the local song
#[derive(Debug, Clone, Copy)]
pub struct ClockContext<'a> {
    pub song: &'a Song,
    pub converter: &'a TickFrameConverter,
    /// Length of the playing patterns, used in pattern mode
    pub pattern_length: u32,
}

/// External clock adapter
pub struct ExternalClock {
    transport: Box<dyn SharedTransport>,
    role: ClockRole,
    connected: bool,
    leader_counter: u32,
    external_bpm: f32,
    /// External frame minus local frame while following
    frame_offset: i64,
    last_known: Option<ExternalPosition>,
    mismatch_detected: bool,
}

impl ExternalClock {
    pub fn new(transport: Box<dyn SharedTransport>) -> Self {
        Self {
            transport,
            role: ClockRole::None,
            connected: true,
            leader_counter: 0,
            external_bpm: f32::NAN,
            frame_offset: 0,
            last_known: None,
            mismatch_detected: false,
        }
    }

    pub fn role(&self) -> ClockRole {
        self.role
    }

    pub fn is_following(&self) -> bool {
        self.role == ClockRole::Follower
    }

    /// Tempo of the followed leader, NaN when not following
    pub fn external_bpm(&self) -> f32 {
        self.external_bpm
    }

    pub fn last_known(&self) -> Option<&ExternalPosition> {
        self.last_known.as_ref()
    }

    /// Whether the last reconciliation had to snap the local position
    pub fn mismatch_detected(&self) -> bool {
        self.mismatch_detected
    }

    /// Ask for the leader role.
    pub fn register_leader(&mut self) -> bool {
        if !self.transport.register_leader() {
            warn!("Shared transport refused leader registration");
            return false;
        }

        info!("Registered as shared transport leader");
        self.role = ClockRole::Leader;
        self.leader_counter = LEADER_TRACKING_CYCLES;
        self.external_bpm = f32::NAN;
        self.frame_offset = 0;
        true
    }

    pub fn release_leader(&mut self) {
        if self.role == ClockRole::Leader {
            self.transport.release_leader();
            self.role = ClockRole::None;
            info!("Released shared transport leader role");
        }
    }

    /// Forward a relocation. While following, `frame` is a local frame.
    pub fn request_locate(&mut self, frame: i64) {
        let offset = if self.is_following() { self.frame_offset } else { 0 };
        self.transport.request_locate((frame + offset).max(0));
    }

    pub fn request_start(&mut self) {
        self.transport.request_start();
    }

    pub fn request_stop(&mut self) {
        self.transport.request_stop();
    }

    /// Compare the shared transport with the local prediction `frame` and
    /// `play_state` for the upcoming cycle.
    pub fn reconcile(&mut self, frame: i64, play_state: PlayState, ctx: &ClockContext<'_>) -> ClockSync {
        let Some(external) = self.transport.poll() else {
            if self.connected {
                warn!("Lost connection to shared transport");
                self.connected = false;
            }
            self.last_known = None;
            return self.demote();
        };
        if !self.connected {
            info!("Reconnected to shared transport");
            self.connected = true;
        }
        self.last_known = Some(external);

        if self.role == ClockRole::Leader {
            match self.transport.take_position_request() {
                Some(requested) => {
                    self.leader_counter = LEADER_TRACKING_CYCLES;
                    self.transport.publish_position(bbt_at_frame(requested, ctx));
                }
                None => {
                    self.leader_counter = self.leader_counter.saturating_sub(1);
                    if self.leader_counter == 0 {
                        warn!(cycles = LEADER_TRACKING_CYCLES, "No position requests, leader role lost");
                        return self.demote();
                    }
                }
            }
        }

        let mut bpm_change = None;
        if self.role != ClockRole::Leader {
            match external.bbt {
                Some(_) if external.bpm.is_finite() && external.bpm > 0.0 => {
                    if self.role != ClockRole::Follower {
                        info!(bpm = external.bpm, "Following shared transport leader");
                        self.role = ClockRole::Follower;
                    }
                    let bpm = clamp_bpm(external.bpm);
                    // NaN compares false, so the first leader tempo counts as a change
                    let unchanged = (bpm - self.external_bpm).abs() <= BPM_EPSILON;
                    if !unchanged {
                        self.external_bpm = bpm;
                        bpm_change = Some(bpm);
                    }
                }
                _ if self.role == ClockRole::Follower => {
                    warn!("Shared transport leader vanished");
                    return self.demote();
                }
                _ => {}
            }
        }

        let external_state = if external.rolling { PlayState::Rolling } else { PlayState::Stopped };
        let predicted = external.frame - if self.is_following() { self.frame_offset } else { 0 };
        if bpm_change.is_none() && external_state == play_state && predicted == frame {
            self.mismatch_detected = false;
            return ClockSync::NoChange;
        }

        let target = match external.bbt {
            Some(bbt) if self.is_following() => {
                let tick = tick_from_bbt(&bbt, ctx);
                let tick_size = compute_tick_size(ctx.converter.sample_rate(), self.external_bpm, ctx.song.resolution);
                let local = (tick * tick_size).round() as i64;
                self.frame_offset = external.frame - local;
                local
            }
            _ => {
                self.frame_offset = 0;
                external.frame
            }
        };

        debug!(
            local = frame,
            external = external.frame,
            target,
            rolling = external.rolling,
            "Snapping to shared transport position"
        );
        self.mismatch_detected = true;
        ClockSync::Reconciled(Reconciled {
            frame: target.max(0),
            play_state: external_state,
            bpm: bpm_change,
        })
    }

    fn demote(&mut self) -> ClockSync {
        let previous = self.role;
        self.role = ClockRole::None;
        self.external_bpm = f32::NAN;
        self.frame_offset = 0;
        self.leader_counter = 0;

        if previous == ClockRole::None {
            ClockSync::NoChange
        } else {
            info!(?previous, "Shared transport role dropped");
            ClockSync::RoleLost
        }
    }
}

impl Drop for ExternalClock {
    fn drop(&mut self) {
        self.release_leader();
    }
}

fn ticks_per_beat(ctx: &ClockContext<'_>) -> u32 {
    // Beats are quarter notes
    ctx.song.resolution.max(1)
}

/// Bar/beat/tick description of a local frame
pub fn bbt_at_frame(frame: i64, ctx: &ClockContext<'_>) -> Bbt {
    let tick = ctx.converter.frame_to_tick(frame);
    let whole = tick.floor().max(0.0) as u64;
    let beat_ticks = ticks_per_beat(ctx) as u64;

    let (bar, bar_start, bar_length) = match ctx.song.mode {
        PlaybackMode::Song => match ctx.song.column_for_tick(whole, ctx.song.loop_enabled) {
            Some((column, start)) => (column as u64, start, ctx.song.column_length(column) as u64),
            None => {
                let columns = ctx.song.columns.len() as u64;
                (columns, whole, beat_ticks * 4)
            }
        },
        PlaybackMode::Pattern => {
            let length = ctx.pattern_length.max(1) as u64;
            (whole / length, whole - whole % length, length)
        }
    };

    let in_bar = whole - bar_start;
    Bbt {
        bar: bar as u32 + 1,
        beat: (in_bar / beat_ticks) as u32 + 1,
        tick: (in_bar % beat_ticks) as u32,
        ticks_per_beat: beat_ticks as f64,
        beats_per_bar: bar_length as f32 / beat_ticks as f32,
        bpm: ctx.converter.bpm_at(tick),
    }
}

/// Local tick addressed by an external bar/beat/tick position
pub fn tick_from_bbt(bbt: &Bbt, ctx: &ClockContext<'_>) -> f64 {
    let bar = bbt.bar.saturating_sub(1);
    let bar_start = match ctx.song.mode {
        PlaybackMode::Song => ctx.song.tick_for_column(bar as i32).unwrap_or_else(|err| {
            warn!(bar, %err, "External bar outside the song, using song start");
            0
        }),
        PlaybackMode::Pattern => bar as u64 * ctx.pattern_length.max(1) as u64,
    };

    let resolution = ticks_per_beat(ctx) as f64;
    let external_ticks_per_beat = if bbt.ticks_per_beat > 0.0 { bbt.ticks_per_beat } else { resolution };
    let beat = bbt.beat.saturating_sub(1) as f64;
    bar_start as f64 + beat * resolution + bbt.tick as f64 * resolution / external_ticks_per_beat
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::TempoPlan;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Scripted {
        position: Option<ExternalPosition>,
        requests: Vec<i64>,
        published: Vec<Bbt>,
        grant_leader: bool,
        released: bool,
        locates: Vec<i64>,
    }

    #[derive(Clone, Default)]
    struct ScriptedTransport(Arc<Mutex<Scripted>>);

    impl SharedTransport for ScriptedTransport {
        fn poll(&mut self) -> Option<ExternalPosition> {
            self.0.lock().unwrap().position
        }
        fn take_position_request(&mut self) -> Option<i64> {
            self.0.lock().unwrap().requests.pop()
        }
        fn publish_position(&mut self, bbt: Bbt) {
            self.0.lock().unwrap().published.push(bbt);
        }
        fn register_leader(&mut self) -> bool {
            self.0.lock().unwrap().grant_leader
        }
        fn release_leader(&mut self) {
            self.0.lock().unwrap().released = true;
        }
        fn request_locate(&mut self, frame: i64) {
            self.0.lock().unwrap().locates.push(frame);
        }
        fn request_start(&mut self) {}
        fn request_stop(&mut self) {}
    }

    fn stopped_at(frame: i64) -> ExternalPosition {
        ExternalPosition {
            frame,
            rolling: false,
            bpm: f32::NAN,
            bbt: None,
        }
    }

    fn with_context<R>(f: impl FnOnce(&ClockContext<'_>) -> R) -> R {
        let song = Song::demo();
        let converter = TickFrameConverter::for_song(&song, 48000, TempoPlan::Constant(song.bpm));
        let ctx = ClockContext {
            song: &song,
            converter: &converter,
            pattern_length: 192,
        };
        f(&ctx)
    }

    #[test]
    fn test_matching_position_is_no_change() {
        let shared = ScriptedTransport::default();
        shared.0.lock().unwrap().position = Some(stopped_at(4096));
        let mut clock = ExternalClock::new(Box::new(shared));

        let sync = with_context(|ctx| clock.reconcile(4096, PlayState::Stopped, ctx));
        assert_eq!(sync, ClockSync::NoChange);
        assert_eq!(clock.role(), ClockRole::None);
        assert!(clock.external_bpm().is_nan());
    }

    #[test]
    fn test_mismatch_snaps_to_external_frame() {
        let shared = ScriptedTransport::default();
        shared.0.lock().unwrap().position = Some(ExternalPosition {
            rolling: true,
            ..stopped_at(4097)
        });
        let mut clock = ExternalClock::new(Box::new(shared));

        // A single frame of difference is a mismatch
        let sync = with_context(|ctx| clock.reconcile(4096, PlayState::Rolling, ctx));
        assert_eq!(
            sync,
            ClockSync::Reconciled(Reconciled {
                frame: 4097,
                play_state: PlayState::Rolling,
                bpm: None,
            })
        );
        assert!(clock.mismatch_detected());
    }

    #[test]
    fn test_leader_role_lost_after_missed_requests() {
        let shared = ScriptedTransport::default();
        {
            let mut inner = shared.0.lock().unwrap();
            inner.position = Some(stopped_at(0));
            inner.grant_leader = true;
            inner.requests.push(0);
        }
        let mut clock = ExternalClock::new(Box::new(shared.clone()));
        assert!(clock.register_leader());

        with_context(|ctx| {
            // The first cycle serves the request and publishes bar 1 beat 1
            assert_eq!(clock.reconcile(0, PlayState::Stopped, ctx), ClockSync::NoChange);
            for _ in 0..LEADER_TRACKING_CYCLES - 1 {
                assert_eq!(clock.reconcile(0, PlayState::Stopped, ctx), ClockSync::NoChange);
                assert_eq!(clock.role(), ClockRole::Leader);
            }
            assert_eq!(clock.reconcile(0, PlayState::Stopped, ctx), ClockSync::RoleLost);
        });

        assert_eq!(clock.role(), ClockRole::None);
        let published = shared.0.lock().unwrap().published.clone();
        assert_eq!(published.len(), 1);
        assert_eq!((published[0].bar, published[0].beat, published[0].tick), (1, 1, 0));
        assert_eq!(published[0].bpm, 120.0);
    }

    #[test]
    fn test_follower_uses_leader_tempo_and_bbt() {
        let shared = ScriptedTransport::default();
        shared.0.lock().unwrap().position = Some(ExternalPosition {
            frame: 1_000_000,
            rolling: true,
            bpm: 100.0,
            bbt: Some(Bbt {
                bar: 2,
                beat: 3,
                tick: 960,
                ticks_per_beat: 1920.0,
                beats_per_bar: 4.0,
                bpm: 100.0,
            }),
        });
        let mut clock = ExternalClock::new(Box::new(shared.clone()));

        let sync = with_context(|ctx| clock.reconcile(0, PlayState::Stopped, ctx));
        // Bar 2 starts at tick 192, two beats of 48 and half a beat more
        let tick = 192.0 + 96.0 + 24.0;
        let frame = (tick * compute_tick_size(48000, 100.0, 48)).round() as i64;
        assert_eq!(
            sync,
            ClockSync::Reconciled(Reconciled {
                frame,
                play_state: PlayState::Rolling,
                bpm: Some(100.0),
            })
        );
        assert_eq!(clock.role(), ClockRole::Follower);
        assert_eq!(clock.external_bpm(), 100.0);

        // The shared transport advances in step with the local one
        {
            let mut inner = shared.0.lock().unwrap();
            if let Some(position) = inner.position.as_mut() {
                position.frame += 512;
                // Jitter below the epsilon is ignored
                position.bpm = 100.0002;
            }
        }
        let sync = with_context(|ctx| clock.reconcile(frame + 512, PlayState::Rolling, ctx));
        assert_eq!(sync, ClockSync::NoChange);

        // Local relocations are translated back into shared frames
        clock.request_locate(frame);
        assert_eq!(shared.0.lock().unwrap().locates, vec![1_000_000]);
    }

    #[test]
    fn test_connection_loss_demotes_follower() {
        let shared = ScriptedTransport::default();
        shared.0.lock().unwrap().position = Some(ExternalPosition {
            frame: 0,
            rolling: false,
            bpm: 90.0,
            bbt: Some(Bbt {
                bar: 1,
                beat: 1,
                tick: 0,
                ticks_per_beat: 48.0,
                beats_per_bar: 4.0,
                bpm: 90.0,
            }),
        });
        let mut clock = ExternalClock::new(Box::new(shared.clone()));
        with_context(|ctx| clock.reconcile(0, PlayState::Stopped, ctx));
        assert!(clock.is_following());

        shared.0.lock().unwrap().position = None;
        let sync = with_context(|ctx| clock.reconcile(0, PlayState::Stopped, ctx));
        assert_eq!(sync, ClockSync::RoleLost);
        assert!(clock.external_bpm().is_nan());
        assert!(clock.last_known().is_none());
    }

    #[test]
    fn test_drop_releases_leader() {
        let shared = ScriptedTransport::default();
        shared.0.lock().unwrap().grant_leader = true;
        let mut clock = ExternalClock::new(Box::new(shared.clone()));
        assert!(clock.register_leader());
        drop(clock);
        assert!(shared.0.lock().unwrap().released);
    }

    #[test]
    fn test_bbt_round_trip_on_beats() {
        with_context(|ctx| {
            // Column 2, beat 3 of the demo song at 120 bpm, 500 frames per tick
            let frame = (2 * 192 + 2 * 48) * 500;
            let bbt = bbt_at_frame(frame, ctx);
            assert_eq!((bbt.bar, bbt.beat, bbt.tick), (3, 3, 0));
            assert_eq!(bbt.beats_per_bar, 4.0);
            assert_eq!(tick_from_bbt(&bbt, ctx), (2 * 192 + 2 * 48) as f64);
        });
    }
}
