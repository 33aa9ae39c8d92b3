//! Result types produced by the pipeline stages.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One timed span of transcribed speech.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptSegment {
    /// Segment start, seconds from the beginning of the clip.
    pub start: f64,
    /// Segment end, seconds.
    pub end: f64,
    pub text: String,
}

/// Output of the transcription stage. Immutable once constructed;
/// produced at most once per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    pub language: Option<String>,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
    pub confidence: Option<f32>,
    /// Duration of the audio that was transcribed.
    pub audio_duration: Duration,
    /// How many request attempts it took to get this result.
    pub attempts: u32,
}

/// Token accounting reported by the optimization service.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Output of the optimization stage. Immutable once constructed;
/// produced at most once per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub original_text: String,
    pub optimized_text: String,
    /// Human-readable notes on what the optimizer changed.
    #[serde(default)]
    pub improvements: Vec<String>,
    pub confidence: f32,
    pub usage: TokenUsage,
    pub attempts: u32,
}

/// What a completed workflow presents to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub transcription: TranscriptionResult,
    pub optimization: OptimizationResult,
}
