//! Conversion between sample frames and musical ticks
//!
//! The tempo may change at every column boundary when the timeline is
//! active, so the mapping is piecewise linear. The converter precomputes one
//! segment per tempo region; in loop mode the segment table repeats with the
//! length of the song as period.

use tracing::warn;

use crate::song::Song;

/// Tolerated difference in frames after converting frame -> tick -> frame
pub const FRAME_EPSILON: i64 = 1;

/// Tolerated difference in ticks between a tick and its frame round trip
/// once the reported mismatch is added back
pub const TICK_EPSILON: f64 = 1e-6;

/// Number of frames making up one tick
pub fn compute_tick_size(sample_rate: u32, bpm: f32, resolution: u32) -> f64 {
    sample_rate as f64 * 60.0 / bpm as f64 / resolution as f64
}

/// Where the tempo of the upcoming segments comes from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TempoPlan {
    /// One tempo for the whole song
    Constant(f32),
    /// Tempo markers of the song's timeline, one region per column
    Timeline,
}

/// Region of constant tempo
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoSegment {
    pub start_tick: f64,
    pub start_frame: f64,
    pub bpm: f32,
    /// Frames per tick
    pub tick_size: f64,
}

/// Piecewise-linear frame/tick mapping
#[derive(Debug, Clone)]
pub struct TickFrameConverter {
    sample_rate: u32,
    resolution: u32,
    segments: Vec<TempoSegment>,
    /// Song length in (ticks, frames) when positions wrap around
    period: Option<(f64, f64)>,
}

impl TickFrameConverter {
    /// Converter running at a constant tempo
    pub fn new(sample_rate: u32, resolution: u32, bpm: f32) -> Self {
        let mut converter = Self {
            sample_rate: sample_rate.max(1),
            resolution: resolution.max(1),
            segments: Vec::with_capacity(1),
            period: None,
        };
        converter.set_constant(bpm);
        converter
    }

    /// Converter for `song` following `plan`
    pub fn for_song(song: &Song, sample_rate: u32, plan: TempoPlan) -> Self {
        let mut converter = Self::new(sample_rate, song.resolution, song.bpm);
        converter.segments.reserve(song.columns.len());
        converter.rebuild(song, sample_rate, plan);
        converter
    }

    /// Recompute all segments.
    ///
    /// Does not allocate as long as the table has room for one segment per
    /// column, which `for_song` reserves.
    pub fn rebuild(&mut self, song: &Song, sample_rate: u32, plan: TempoPlan) {
        self.sample_rate = sample_rate.max(1);
        self.resolution = song.resolution.max(1);

        match plan {
            TempoPlan::Constant(bpm) => self.set_constant(bpm),
            TempoPlan::Timeline => self.build_from_timeline(song),
        }
    }

    fn set_constant(&mut self, bpm: f32) {
        self.segments.clear();
        self.segments.push(TempoSegment {
            start_tick: 0.0,
            start_frame: 0.0,
            bpm,
            tick_size: compute_tick_size(self.sample_rate, bpm, self.resolution),
        });
        self.period = None;
    }

    fn build_from_timeline(&mut self, song: &Song) {
        self.segments.clear();
        self.period = None;

        let mut tick = 0.0;
        let mut frame = 0.0;
        for column in 0..song.columns.len() {
            let bpm = song.timeline.tempo_at_bar(column as i32, song.bpm);
            let tick_size = compute_tick_size(self.sample_rate, bpm, self.resolution);

            if self.segments.last().is_none_or(|s| s.bpm != bpm) {
                self.segments.push(TempoSegment {
                    start_tick: tick,
                    start_frame: frame,
                    bpm,
                    tick_size,
                });
            }

            let length = song.column_length(column) as f64;
            tick += length;
            frame += length * tick_size;
        }

        if self.segments.is_empty() {
            self.set_constant(song.bpm);
            return;
        }

        if song.loop_enabled && self.segments.len() > 1 {
            self.period = Some((tick, frame));
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn segments(&self) -> &[TempoSegment] {
        &self.segments
    }

    /// Whether the tempo varies along the song
    pub fn is_variable(&self) -> bool {
        self.segments.len() > 1
    }

    fn segment_for_frame(&self, frame: f64) -> &TempoSegment {
        let idx = self.segments.partition_point(|s| s.start_frame <= frame);
        &self.segments[idx.saturating_sub(1)]
    }

    fn segment_for_tick(&self, tick: f64) -> &TempoSegment {
        let idx = self.segments.partition_point(|s| s.start_tick <= tick);
        &self.segments[idx.saturating_sub(1)]
    }

    /// Tempo region governing `tick`
    pub fn segment_at_tick(&self, tick: f64) -> TempoSegment {
        *self.segment_for_tick(self.wrap_tick(sanitize(tick)).1)
    }

    /// Frames per tick at `tick`
    pub fn tick_size_at(&self, tick: f64) -> f64 {
        self.segment_at_tick(tick).tick_size
    }

    /// Largest tick size of all segments, i.e. the one of the slowest tempo
    pub fn max_tick_size(&self) -> f64 {
        self.segments.iter().map(|s| s.tick_size).fold(0.0, f64::max)
    }

    /// Tempo at `tick`
    pub fn bpm_at(&self, tick: f64) -> f32 {
        self.segment_at_tick(tick).bpm
    }

    fn wrap_tick(&self, tick: f64) -> (f64, f64) {
        match self.period {
            Some((ticks, frames)) if tick >= ticks => {
                let loops = (tick / ticks).floor();
                (loops * frames, tick - loops * ticks)
            }
            _ => (0.0, tick),
        }
    }

    fn wrap_frame(&self, frame: f64) -> (f64, f64) {
        match self.period {
            Some((ticks, frames)) if frame >= frames => {
                let loops = (frame / frames).floor();
                (loops * ticks, frame - loops * frames)
            }
            _ => (0.0, frame),
        }
    }

    /// Tick position of `frame`. Negative frames map to tick 0.
    pub fn frame_to_tick(&self, frame: i64) -> f64 {
        self.frame_to_tick_f(frame.max(0) as f64)
    }

    fn frame_to_tick_f(&self, frame: f64) -> f64 {
        let (base_tick, local) = self.wrap_frame(frame);
        let segment = self.segment_for_frame(local);
        base_tick + segment.start_tick + (local - segment.start_frame) / segment.tick_size
    }

    /// Frame at which `tick` occurs, together with the tick mismatch
    /// introduced by rounding to a whole frame: `tick - frame_to_tick(frame)`.
    pub fn tick_to_frame(&self, tick: f64) -> (i64, f64) {
        let tick = sanitize(tick);
        let frame = self.tick_to_frame_f(tick).round().max(0.0);
        let mismatch = tick - self.frame_to_tick_f(frame);
        (frame as i64, mismatch)
    }

    fn tick_to_frame_f(&self, tick: f64) -> f64 {
        let (base_frame, local) = self.wrap_tick(tick);
        let segment = self.segment_for_tick(local);
        base_frame + segment.start_frame + (local - segment.start_tick) * segment.tick_size
    }

    /// Check frame -> tick -> frame for every frame given.
    pub fn verify_frame_round_trip<I>(&self, frames: I) -> bool
    where
        I: IntoIterator<Item = i64>,
    {
        let mut ok = true;
        for frame in frames {
            let tick = self.frame_to_tick(frame);
            let (back, _) = self.tick_to_frame(tick);
            let expected = frame.max(0);
            if !tick.is_finite() || tick < 0.0 || (back - expected).abs() > FRAME_EPSILON {
                warn!(frame, tick, back, "Frame to tick round trip mismatch");
                ok = false;
            }
        }
        ok
    }

    /// Check tick -> frame -> tick for every tick given.
    ///
    /// The frame must be the nearest one (at most half a frame away) and the
    /// reported mismatch must account for the remaining difference.
    pub fn verify_tick_round_trip<I>(&self, ticks: I) -> bool
    where
        I: IntoIterator<Item = f64>,
    {
        let min_tick_size = self
            .segments
            .iter()
            .map(|s| s.tick_size)
            .fold(f64::INFINITY, f64::min);
        let max_mismatch = 0.5 / min_tick_size + TICK_EPSILON;

        let mut ok = true;
        for tick in ticks {
            let (frame, mismatch) = self.tick_to_frame(tick);
            let back = self.frame_to_tick(frame);
            let expected = sanitize(tick);
            if frame < 0
                || !mismatch.is_finite()
                || (back + mismatch - expected).abs() > TICK_EPSILON
                || mismatch.abs() > max_mismatch
            {
                warn!(tick, frame, back, mismatch, "Tick to frame round trip mismatch");
                ok = false;
            }
        }
        ok
    }

    /// Round trip check over segment boundaries, the song loop point and an
    /// even spread of positions across `span_ticks`.
    pub fn self_test(&self, span_ticks: f64) -> bool {
        let span_ticks = sanitize(span_ticks).max(1.0);
        let span_frames = self.tick_to_frame_f(span_ticks);
        let steps = 997;

        let mut frames: Vec<i64> = (0..=steps)
            .map(|i| (span_frames * i as f64 / steps as f64) as i64)
            .collect();
        let mut ticks: Vec<f64> = (0..=steps)
            .map(|i| span_ticks * i as f64 / steps as f64 + 0.37)
            .collect();

        for segment in &self.segments {
            let frame = segment.start_frame.round() as i64;
            frames.extend([frame - 1, frame, frame + 1]);
            ticks.extend([segment.start_tick - 0.5, segment.start_tick, segment.start_tick + 0.5]);
        }
        if let Some((period_ticks, period_frames)) = self.period {
            let frame = period_frames.round() as i64;
            frames.extend([frame - 1, frame, frame + 1, 3 * frame + 17]);
            ticks.extend([period_ticks - 0.25, period_ticks, 2.5 * period_ticks]);
        }

        self.verify_frame_round_trip(frames) & self.verify_tick_round_trip(ticks)
    }
}

fn sanitize(tick: f64) -> f64 {
    if tick.is_finite() { tick.max(0.0) } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::Pattern;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn song_with_markers(loop_enabled: bool) -> Song {
        let mut song = Song::new("markers", 120.0);
        let pattern = song.add_pattern(Pattern::new("p", 192));
        let short = song.add_pattern(Pattern::new("s", 96));
        song.columns = vec![vec![pattern], vec![short], vec![pattern], vec![pattern], vec![short]];
        song.timeline.add_tempo_marker(0, 120.0);
        song.timeline.add_tempo_marker(1, 100.0);
        song.timeline.add_tempo_marker(2, 20.0);
        song.timeline.add_tempo_marker(3, 383.2);
        song.timeline.add_tempo_marker(4, 64.38372);
        song.timeline_activated = true;
        song.loop_enabled = loop_enabled;
        song
    }

    #[test]
    fn test_tick_size() {
        // 48000 frames per second, 2 beats per second, 48 ticks per beat
        assert_relative_eq!(compute_tick_size(48000, 120.0, 48), 500.0);
    }

    #[test]
    fn test_constant_tempo_conversion() {
        let converter = TickFrameConverter::new(48000, 48, 120.0);
        assert_relative_eq!(converter.frame_to_tick(48000), 96.0);
        assert_eq!(converter.tick_to_frame(96.0), (48000, 0.0));
        assert_eq!(converter.frame_to_tick(-20), 0.0);
        assert!(!converter.is_variable());
    }

    #[test]
    fn test_timeline_segments() {
        let song = song_with_markers(false);
        let converter = TickFrameConverter::for_song(&song, 44100, TempoPlan::Timeline);
        let segments = converter.segments();
        assert_eq!(segments.len(), 5);
        assert_eq!(segments[1].start_tick, 192.0);
        assert_eq!(segments[2].start_tick, 288.0);
        assert_relative_eq!(segments[1].start_frame, 192.0 * compute_tick_size(44100, 120.0, 48));
        assert_eq!(converter.bpm_at(300.0), 20.0);
        // The last tempo keeps going past the song end without loop mode
        assert_eq!(converter.bpm_at(5000.0), 64.38372);
    }

    #[test]
    fn test_unchanged_tempo_merges_segments() {
        let mut song = Song::new("flat", 100.0);
        let pattern = song.add_pattern(Pattern::new("p", 192));
        song.columns = vec![vec![pattern]; 4];
        song.timeline.add_tempo_marker(2, 100.0);
        let converter = TickFrameConverter::for_song(&song, 48000, TempoPlan::Timeline);
        assert_eq!(converter.segments().len(), 1);
    }

    #[test]
    fn test_loop_wraps_positions() {
        let song = song_with_markers(true);
        let converter = TickFrameConverter::for_song(&song, 48000, TempoPlan::Timeline);
        let size = song.size_in_ticks() as f64;
        let (end_frame, _) = converter.tick_to_frame(size);

        // Positions one song length apart share the tempo region
        assert_eq!(converter.bpm_at(size + 300.0), converter.bpm_at(300.0));
        let tick = converter.frame_to_tick(end_frame + 1000);
        assert_relative_eq!(tick - size, converter.frame_to_tick(1000), epsilon = 1e-3);
    }

    #[test]
    fn test_self_test_passes_with_markers() {
        for loop_enabled in [false, true] {
            let song = song_with_markers(loop_enabled);
            for sample_rate in [22050, 44100, 48000, 96000, 192000] {
                let converter = TickFrameConverter::for_song(&song, sample_rate, TempoPlan::Timeline);
                assert!(converter.self_test(3.0 * song.size_in_ticks() as f64));
            }
        }
    }

    #[test]
    fn test_invalid_input_is_sanitized() {
        let converter = TickFrameConverter::new(44100, 48, 90.0);
        assert_eq!(converter.tick_to_frame(f64::NAN).0, 0);
        assert_eq!(converter.tick_to_frame(-3.0).0, 0);
    }

    proptest! {
        #[test]
        fn frame_round_trip(frame in 0i64..50_000_000, sample_rate in prop::sample::select(vec![22050u32, 44100, 48000, 88200, 96000, 192000]), loop_enabled: bool) {
            let song = song_with_markers(loop_enabled);
            let converter = TickFrameConverter::for_song(&song, sample_rate, TempoPlan::Timeline);
            let tick = converter.frame_to_tick(frame);
            prop_assert!(tick.is_finite() && tick >= 0.0);
            let (back, _) = converter.tick_to_frame(tick);
            prop_assert!((back - frame).abs() <= FRAME_EPSILON);
        }

        #[test]
        fn tick_round_trip(tick in 0.0f64..20_000.0, bpm in 10.0f32..400.0) {
            let converter = TickFrameConverter::new(44100, 48, bpm);
            prop_assert!(converter.verify_tick_round_trip([tick]));
        }
    }
}
