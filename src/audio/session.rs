//! Capture session buffer.
//!
//! An `AudioSession` is owned exclusively by the capture side while
//! recording: the audio callback appends samples and advances the voice
//! gate, nothing else touches the buffer. Sealing the session transfers
//! ownership out as an immutable `RecordedAudio`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::CaptureConfig;

use super::vad::{GateAction, GateStats, VadState, VoiceGate};

/// Why a recording stopped appending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// Trailing silence exceeded the configured timeout.
    TrailingSilence,
    /// The max-duration cap was hit.
    MaxDuration,
}

/// What the capture callback should do after feeding a block of samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    Continue,
    AutoStop(StopCause),
}

/// Sealed, immutable recording handed from the capture thread to the
/// pipeline.
#[derive(Debug, Clone)]
pub struct RecordedAudio {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Interleaved PCM in the device's native rate/channel layout.
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
    pub stats: GateStats,
}

impl RecordedAudio {
    pub fn duration(&self) -> Duration {
        let per_sec = self.sample_rate as u64 * self.channels.max(1) as u64;
        if per_sec == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / per_sec as f64)
    }

    /// Whether the voice gate saw any voiced frame during the session.
    pub fn speech_detected(&self) -> bool {
        self.stats.active_frames > 0
    }
}

/// One capture attempt. Created on start, mutated only by the capture
/// callback, sealed on stop.
pub struct AudioSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    buffer: Vec<i16>,
    sample_rate: u32,
    channels: u16,
    max_samples: usize,
    gate: VoiceGate,
    stop_cause: Option<StopCause>,
}

impl AudioSession {
    pub fn new(id: Uuid, sample_rate: u32, channels: u16, config: &CaptureConfig) -> Self {
        let channels = channels.max(1);
        let per_sec = sample_rate as u64 * channels as u64;
        let max_samples = (per_sec * config.max_duration_ms / 1000) as usize;

        Self {
            id,
            started_at: Utc::now(),
            // Preallocated to the cap so callback appends never reallocate.
            buffer: Vec::with_capacity(max_samples),
            sample_rate,
            channels,
            max_samples,
            gate: VoiceGate::new(
                config.vad_frame_samples,
                config.silence_threshold,
                config.silence_timeout(),
                per_sec,
            ),
            stop_cause: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn vad_state(&self) -> VadState {
        self.gate.state()
    }

    pub fn silence_duration(&self) -> Duration {
        self.gate.silence_duration()
    }

    /// Append one callback's worth of interleaved samples and run VAD.
    ///
    /// Once trailing silence times out or the buffer reaches the
    /// max-duration cap, every subsequent push reports `AutoStop` again: the
    /// callback's event send is lossy, so the signal must survive a dropped
    /// delivery. The reducer treats duplicates as no-ops.
    pub fn push(&mut self, interleaved: &[i16]) -> SessionSignal {
        if let Some(cause) = self.stop_cause {
            return SessionSignal::AutoStop(cause);
        }

        let room = self.max_samples.saturating_sub(self.buffer.len());
        let take = room.min(interleaved.len());
        self.buffer.extend_from_slice(&interleaved[..take]);

        let gate_action = self.gate.push(&interleaved[..take]);

        if gate_action == GateAction::AutoStop {
            self.stop_cause = Some(StopCause::TrailingSilence);
            return SessionSignal::AutoStop(StopCause::TrailingSilence);
        }
        if self.buffer.len() >= self.max_samples {
            self.stop_cause = Some(StopCause::MaxDuration);
            return SessionSignal::AutoStop(StopCause::MaxDuration);
        }

        SessionSignal::Continue
    }

    /// Finalize the session, transferring buffer ownership to the caller.
    pub fn seal(self) -> RecordedAudio {
        RecordedAudio {
            session_id: self.id,
            started_at: self.started_at,
            samples: self.buffer,
            sample_rate: self.sample_rate,
            channels: self.channels,
            stats: self.gate.stats(),
        }
    }
}
