//! Transport time information distributed to plugins once per block.

use serde::{Deserialize, Serialize};

/// Bar/beat/tick position. `bar` and `beat` are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbt {
    pub bar: i32,
    pub beat: i32,
    pub tick: f64,
    pub bar_start_tick: f64,
    pub beats_per_bar: f32,
    pub beat_type: f32,
    pub ticks_per_beat: f64,
    pub beats_per_minute: f64,
}

impl Default for Bbt {
    fn default() -> Self {
        Self {
            bar: 1,
            beat: 1,
            tick: 0.0,
            bar_start_tick: 0.0,
            beats_per_bar: 4.0,
            beat_type: 4.0,
            ticks_per_beat: 1920.0,
            beats_per_minute: 120.0,
        }
    }
}

/// One transport snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeInfo {
    pub playing: bool,
    pub frame: u64,
    pub usecs: u64,
    pub bbt: Option<Bbt>,
}

impl TimeInfo {
    /// True when `next` is what this snapshot becomes after rolling at most `max_frames`.
    ///
    /// Plugins use this to skip re-sending position data on every block.
    pub fn compare_ignoring_rolling_frames(&self, next: &TimeInfo, max_frames: u32) -> bool {
        if self.playing != next.playing {
            return false;
        }
        match (&self.bbt, &next.bbt) {
            (None, None) => {}
            (Some(a), Some(b)) => {
                if a.beats_per_bar != b.beats_per_bar
                    || a.beat_type != b.beat_type
                    || a.beats_per_minute != b.beats_per_minute
                {
                    return false;
                }
            }
            _ => return false,
        }
        if !self.playing {
            return self.frame == next.frame;
        }
        next.frame >= self.frame && next.frame <= self.frame + u64::from(max_frames)
    }
}

/// Minimal internal transport used when no external clock drives the engine.
#[derive(Debug, Clone)]
pub struct InternalTransport {
    playing: bool,
    frame: u64,
    sample_rate: f64,
    beats_per_minute: f64,
    beats_per_bar: f32,
    beat_type: f32,
    ticks_per_beat: f64,
}

impl InternalTransport {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            playing: false,
            frame: 0,
            sample_rate,
            beats_per_minute: 120.0,
            beats_per_bar: 4.0,
            beat_type: 4.0,
            ticks_per_beat: 1920.0,
        }
    }

    pub fn play(&mut self) {
        self.playing = true;
    }

    pub fn pause(&mut self) {
        self.playing = false;
    }

    pub fn relocate(&mut self, frame: u64) {
        self.frame = frame;
    }

    pub fn set_bpm(&mut self, bpm: f64) {
        self.beats_per_minute = bpm;
    }

    pub fn bpm(&self) -> f64 {
        self.beats_per_minute
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
    }

    /// Move the play head after a processed block.
    pub fn advance(&mut self, frames: u32) {
        if self.playing {
            self.frame += u64::from(frames);
        }
    }

    pub fn time_info(&self) -> TimeInfo {
        let frames_per_beat = self.sample_rate * 60.0 / self.beats_per_minute;
        let abs_beat = self.frame as f64 / frames_per_beat;
        let beats_per_bar = f64::from(self.beats_per_bar);
        let bar = (abs_beat / beats_per_bar).floor();
        let beat = (abs_beat - bar * beats_per_bar).floor();

        TimeInfo {
            playing: self.playing,
            frame: self.frame,
            usecs: 0,
            bbt: Some(Bbt {
                bar: bar as i32 + 1,
                beat: beat as i32 + 1,
                tick: abs_beat.fract() * self.ticks_per_beat,
                bar_start_tick: bar * beats_per_bar * self.ticks_per_beat,
                beats_per_bar: self.beats_per_bar,
                beat_type: self.beat_type,
                ticks_per_beat: self.ticks_per_beat,
                beats_per_minute: self.beats_per_minute,
            }),
        }
    }
}
