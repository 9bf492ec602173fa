//! Minimal click synthesis so scheduled notes can be heard

use std::f32::consts::TAU;

const MAX_VOICES: usize = 64;

/// Length of one click in seconds
const CLICK_SECONDS: f32 = 0.08;

#[derive(Debug, Clone, Copy, Default)]
struct Voice {
    /// Frames to wait before the click starts
    delay: u32,
    remaining: u32,
    phase: f32,
    step: f32,
    gain: f32,
    decay: f32,
}

/// Fixed pool of decaying sine clicks
pub struct ClickVoices {
    voices: [Voice; MAX_VOICES],
    sample_rate: f32,
}

impl ClickVoices {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            voices: [Voice::default(); MAX_VOICES],
            sample_rate: sample_rate.max(1) as f32,
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(1) as f32;
    }

    pub fn active(&self) -> usize {
        self.voices.iter().filter(|v| v.remaining > 0).count()
    }

    pub fn silence(&mut self) {
        for voice in &mut self.voices {
            voice.remaining = 0;
        }
    }

    /// Start a click `offset` frames into the next rendered buffer.
    /// Steals the voice closest to its end when all are busy.
    pub fn trigger(&mut self, offset: u32, frequency: f32, gain: f32) {
        let Some(slot) = self.voices.iter_mut().min_by_key(|v| v.remaining) else {
            return;
        };

        let length = (CLICK_SECONDS * self.sample_rate) as u32;
        *slot = Voice {
            delay: offset,
            remaining: length.max(1),
            phase: 0.0,
            step: TAU * frequency / self.sample_rate,
            gain: gain.clamp(0.0, 1.0),
            // Roughly -60 dB at the end of the click
            decay: 0.001f32.powf(1.0 / length.max(1) as f32),
        };
    }

    /// Mix all active voices into an interleaved buffer.
    pub fn render(&mut self, buffer: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        for frame in buffer.chunks_mut(channels) {
            let mut sample = 0.0;
            for voice in self.voices.iter_mut().filter(|v| v.remaining > 0) {
                if voice.delay > 0 {
                    voice.delay -= 1;
                    continue;
                }
                sample += voice.phase.sin() * voice.gain;
                voice.phase = (voice.phase + voice.step) % TAU;
                voice.gain *= voice.decay;
                voice.remaining -= 1;
            }
            frame.fill(sample * 0.5);
        }
    }
}
