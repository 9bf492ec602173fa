//! Note scheduling for the upcoming process cycle
//!
//! Each cycle the scheduler turns the frame window of the cycle, shifted by
//! the lookahead, into a tick interval and queues every note whose tick lies
//! in it. Tick intervals of consecutive cycles are contiguous: the next one
//! starts where the previous one ended, so a note is queued exactly once
//! even if the tempo changes in between.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tracing::{trace, warn};

use crate::conversion::TickFrameConverter;
use crate::pattern::InstrumentId;
use crate::song::{PlaybackMode, Song};
use crate::transport::CycleWindow;

/// Maximum lead/lag of a note in ticks
pub const LEAD_LAG_TICKS: f64 = 5.0;

/// Maximum random timing offset in frames at full humanization
pub const MAX_TIME_HUMANIZE: f64 = 2000.0;

/// Default number of notes the queue holds without reallocating
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Velocity of accented and regular metronome clicks
const METRONOME_VELOCITY: (f32, f32) = (1.0, 0.7);

/// Frames a note can be moved ahead of its grid position
pub fn lookahead_frames(tick_size: f64) -> i64 {
    (LEAD_LAG_TICKS * tick_size).ceil() as i64 + MAX_TIME_HUMANIZE as i64 + 1
}

/// What a queued note triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteSource {
    Instrument(InstrumentId),
    /// Click on a beat, accented on the first beat of a pattern
    Metronome { accent: bool },
}

/// A note placed on the frame axis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledNote {
    pub frame: i64,
    /// Grid tick the note belongs to
    pub tick: u64,
    pub source: NoteSource,
    pub velocity: f32,
    pub column: i32,
    /// Lead/lag and swing, scaled by the tick size at `tick`
    offset_ticks: f64,
    humanize_frames: f64,
}

/// Receiver of due notes, typically the sampler
pub trait NoteSink {
    /// `offset` is the frame within the current cycle the note starts at.
    fn note_on(&mut self, note: &ScheduledNote, offset: u32);
}

impl<F> NoteSink for F
where
    F: FnMut(&ScheduledNote, u32),
{
    fn note_on(&mut self, note: &ScheduledNote, offset: u32) {
        self(note, offset)
    }
}

#[derive(Debug, Clone, Copy)]
struct Queued {
    note: ScheduledNote,
    sequence: u64,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Reversed so the heap yields the earliest note first
    fn cmp(&self, other: &Self) -> Ordering {
        (other.note.frame, other.sequence).cmp(&(self.note.frame, self.sequence))
    }
}

/// Tick interval covered by one cycle, `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickInterval {
    pub start: f64,
    pub end: f64,
}

/// Song information needed for one scheduling pass
#[derive(Debug, Clone, Copy)]
pub struct ScheduleContext<'a> {
    pub song: &'a Song,
    pub converter: &'a TickFrameConverter,
    /// Patterns played in pattern mode
    pub playing_patterns: &'a [usize],
    pub metronome: bool,
}

impl ScheduleContext<'_> {
    fn pattern_mode_length(&self) -> u32 {
        self.song.longest_pattern_length(self.playing_patterns)
    }
}

/// Note queue fed once per cycle
pub struct NoteScheduler {
    queue: BinaryHeap<Queued>,
    capacity: usize,
    last_interval_end: Option<f64>,
    rng: fastrand::Rng,
    sequence: u64,
    dropped: u64,
}

impl NoteScheduler {
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self {
            queue: BinaryHeap::with_capacity(capacity),
            capacity,
            last_interval_end: None,
            rng: fastrand::Rng::with_seed(seed),
            sequence: 0,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Notes discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Forget queued notes and the previous tick interval, e.g. after a
    /// relocation or stop.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.last_interval_end = None;
    }

    /// Where the next tick interval will start, if it continues a previous one
    pub fn last_interval_end(&self) -> Option<f64> {
        self.last_interval_end
    }

    /// Tick interval covered by `window`.
    ///
    /// The lookahead is sized from the slowest tempo segment: a note leading
    /// into a slower segment sits up to `LEAD_LAG_TICKS` of its slow ticks
    /// ahead of its tick.
    fn tick_interval(&self, window: &CycleWindow, converter: &TickFrameConverter) -> TickInterval {
        let start_tick = converter.frame_to_tick(window.start);
        let lookahead = lookahead_frames(converter.max_tick_size());
        let end = converter.frame_to_tick(window.end() + lookahead);

        let start = match self.last_interval_end {
            Some(previous) => previous,
            // Fresh start: notes right at the playhead still sound
            None => start_tick,
        };
        TickInterval { start, end: end.max(start) }
    }

    /// Queue all notes of the tick interval belonging to `window`.
    pub fn schedule(&mut self, window: &CycleWindow, ctx: &ScheduleContext<'_>) -> TickInterval {
        let interval = self.tick_interval(window, ctx.converter);
        self.last_interval_end = Some(interval.end);

        let first = interval.start.ceil().max(0.0) as u64;
        let last = interval.end.ceil().max(0.0) as u64;
        for tick in first..last {
            match ctx.song.mode {
                PlaybackMode::Song => {
                    let Some((column, column_start)) = ctx.song.column_for_tick(tick, ctx.song.loop_enabled) else {
                        break;
                    };
                    let local = (tick - column_start) as u32;
                    let patterns = &ctx.song.columns[column];
                    let length = ctx.song.column_length(column);
                    self.queue_tick(tick, local, length, patterns, column as i32, ctx);
                }
                PlaybackMode::Pattern => {
                    let length = ctx.pattern_mode_length().max(1);
                    let local = (tick % length as u64) as u32;
                    self.queue_tick(tick, local, length, ctx.playing_patterns, 0, ctx);
                }
            }
        }

        trace!(start = interval.start, end = interval.end, queued = self.queue.len(), "Scheduled cycle");
        interval
    }

    fn queue_tick(
        &mut self,
        tick: u64,
        local: u32,
        length: u32,
        patterns: &[usize],
        column: i32,
        ctx: &ScheduleContext<'_>,
    ) {
        let song = ctx.song;
        let resolution = song.resolution.max(1);

        if ctx.metronome && local % resolution == 0 && local < length {
            let accent = local == 0;
            let velocity = if accent { METRONOME_VELOCITY.0 } else { METRONOME_VELOCITY.1 };
            self.push(tick, NoteSource::Metronome { accent }, velocity, column, 0.0, 0.0, ctx);
        }

        for &index in patterns {
            let Some(pattern) = song.patterns.get(index) else {
                continue;
            };
            if local >= pattern.length {
                continue;
            }

            for note in pattern.notes_at(local) {
                if song.instrument(note.instrument).is_some_and(|i| i.muted) {
                    continue;
                }

                let mut offset_ticks = note.lead_lag as f64 * LEAD_LAG_TICKS;
                if is_swung(local, resolution) {
                    offset_ticks += song.swing as f64 * resolution as f64 / 8.0;
                }
                let humanize_frames = if song.humanize_time > 0.0 {
                    (self.rng.f64() * 2.0 - 1.0) * song.humanize_time as f64 * MAX_TIME_HUMANIZE
                } else {
                    0.0
                };

                self.push(
                    tick,
                    NoteSource::Instrument(note.instrument),
                    note.velocity,
                    column,
                    offset_ticks,
                    humanize_frames,
                    ctx,
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn push(
        &mut self,
        tick: u64,
        source: NoteSource,
        velocity: f32,
        column: i32,
        offset_ticks: f64,
        humanize_frames: f64,
        ctx: &ScheduleContext<'_>,
    ) {
        if self.queue.len() >= self.capacity {
            self.dropped += 1;
            warn!(tick, capacity = self.capacity, "Note queue full, dropping note");
            return;
        }

        let mut note = ScheduledNote {
            frame: 0,
            tick,
            source,
            velocity,
            column,
            offset_ticks,
            humanize_frames,
        };
        note.frame = note_frame(&note, ctx.converter);
        self.sequence += 1;
        self.queue.push(Queued {
            note,
            sequence: self.sequence,
        });
    }

    /// Recompute the frame of every queued note after the tempo changed.
    /// Keeps the allocation of the queue.
    pub fn retime(&mut self, converter: &TickFrameConverter) {
        let mut notes = std::mem::take(&mut self.queue).into_vec();
        for queued in &mut notes {
            queued.note.frame = note_frame(&queued.note, converter);
        }
        self.queue = BinaryHeap::from(notes);
    }

    /// Hand every note starting before `window.end()` to `sink`.
    pub fn drain_due<S>(&mut self, window: &CycleWindow, sink: &mut S) -> usize
    where
        S: NoteSink + ?Sized,
    {
        let mut count = 0;
        while let Some(top) = self.queue.peek() {
            if top.note.frame >= window.end() {
                break;
            }
            let Some(queued) = self.queue.pop() else {
                break;
            };
            let offset = (queued.note.frame - window.start).clamp(0, window.frames as i64) as u32;
            sink.note_on(&queued.note, offset);
            count += 1;
        }
        count
    }
}

/// Off-beat sixteenth positions are delayed by swing
fn is_swung(local: u32, resolution: u32) -> bool {
    let sixteenth = (resolution / 4).max(1);
    let eighth = (resolution / 2).max(1);
    local % sixteenth == 0 && local % eighth != 0
}

fn note_frame(note: &ScheduledNote, converter: &TickFrameConverter) -> i64 {
    let tick = note.tick as f64;
    let (frame, _) = converter.tick_to_frame(tick);
    let offset = note.offset_ticks * converter.tick_size_at(tick) + note.humanize_frames;
    (frame + offset.round() as i64).max(0)
}
