//! Audio capture, voice-activity gating and format conversion.

pub mod capture;
pub mod convert;
pub mod session;
pub mod vad;

pub use capture::{CaptureEngine, CpalCaptureEngine};
pub use convert::{convert, convert_recording, PcmAudio, TARGET_SAMPLE_RATE};
pub use session::{AudioSession, RecordedAudio, SessionSignal, StopCause};
pub use vad::{GateAction, GateStats, VadState, VoiceGate};
