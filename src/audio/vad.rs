//! Energy-based voice activity detection.
//!
//! `VoiceGate` runs inside the audio callback, so it does fixed work per
//! sample and never allocates: samples are folded into a running
//! sum-of-squares, and a frame decision is made every `frame_samples`
//! samples by comparing normalized RMS against the silence threshold.

use std::time::Duration;

/// VAD state of the in-flight session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// No speech observed yet.
    Silent,
    /// Most recent frame was voiced.
    Active,
    /// Speech was observed, current frames are silent.
    TrailingSilence,
}

/// What the gate wants the capture to do after ingesting samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    Continue,
    /// Trailing silence exceeded the timeout; stop the recording.
    AutoStop,
}

/// Aggregate gate statistics for a finished session.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateStats {
    pub total_frames: usize,
    pub active_frames: usize,
    pub peak_abs: i32,
}

impl GateStats {
    pub fn speech_ratio(&self) -> f32 {
        if self.total_frames == 0 {
            return 0.0;
        }
        self.active_frames as f32 / self.total_frames as f32
    }
}

pub struct VoiceGate {
    frame_samples: usize,
    threshold: f32,
    silence_timeout: Duration,
    /// Samples per second of wall time (sample rate times channel count for
    /// interleaved input).
    samples_per_sec: u64,

    state: VadState,
    frame_fill: usize,
    sum_squares: u64,
    silence_samples: u64,
    auto_stop_fired: bool,
    stats: GateStats,
}

impl VoiceGate {
    pub fn new(
        frame_samples: usize,
        threshold: f32,
        silence_timeout: Duration,
        samples_per_sec: u64,
    ) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
            threshold,
            silence_timeout,
            samples_per_sec: samples_per_sec.max(1),
            state: VadState::Silent,
            frame_fill: 0,
            sum_squares: 0,
            silence_samples: 0,
            auto_stop_fired: false,
            stats: GateStats::default(),
        }
    }

    /// Ingest a block of samples. O(len), allocation-free.
    pub fn push(&mut self, samples: &[i16]) -> GateAction {
        let mut action = GateAction::Continue;

        for &sample in samples {
            let s = i64::from(sample);
            self.sum_squares += (s * s) as u64;
            self.stats.peak_abs = self.stats.peak_abs.max(sample.unsigned_abs() as i32);
            self.frame_fill += 1;

            if self.frame_fill == self.frame_samples
                && self.finish_frame() == GateAction::AutoStop
            {
                action = GateAction::AutoStop;
            }
        }

        action
    }

    fn finish_frame(&mut self) -> GateAction {
        let mean_square = self.sum_squares as f64 / self.frame_samples as f64;
        let rms = mean_square.sqrt() as f32 / i16::MAX as f32;
        self.sum_squares = 0;
        self.frame_fill = 0;
        self.stats.total_frames += 1;

        if rms > self.threshold {
            self.stats.active_frames += 1;
            self.silence_samples = 0;
            self.state = VadState::Active;
            return GateAction::Continue;
        }

        if self.stats.active_frames == 0 {
            // Silence before any speech never times out; such a session ends
            // by user stop or the max-duration cap.
            self.state = VadState::Silent;
            return GateAction::Continue;
        }

        self.state = VadState::TrailingSilence;
        self.silence_samples += self.frame_samples as u64;

        if !self.auto_stop_fired && self.silence_duration() >= self.silence_timeout {
            self.auto_stop_fired = true;
            return GateAction::AutoStop;
        }

        GateAction::Continue
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// Cumulative trailing silence since the last voiced frame.
    pub fn silence_duration(&self) -> Duration {
        Duration::from_secs_f64(self.silence_samples as f64 / self.samples_per_sec as f64)
    }

    pub fn speech_seen(&self) -> bool {
        self.stats.active_frames > 0
    }

    pub fn stats(&self) -> GateStats {
        self.stats
    }
}
