//! Engine configuration.
//!
//! Plain serde types with defaults; loading and persisting them is the host
//! application's concern, the engine only consumes the values.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Normalized RMS (0.0..=1.0) above which a VAD frame counts as voiced.
    pub silence_threshold: f32,

    /// Trailing silence after speech that auto-stops the recording.
    pub silence_timeout_ms: u64,

    /// Samples per VAD frame. Energy is computed per frame, so this bounds
    /// the work done inside the audio callback.
    pub vad_frame_samples: usize,

    /// Recordings shorter than this are rejected as too short to transcribe.
    pub min_utterance_ms: u64,

    /// Hard cap on a single recording; prevents runaway sessions.
    pub max_duration_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            silence_threshold: 0.015,
            silence_timeout_ms: 1_200,
            vad_frame_samples: 1024,
            min_utterance_ms: 50,
            max_duration_ms: 120_000,
        }
    }
}

impl CaptureConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn min_utterance(&self) -> Duration {
        Duration::from_millis(self.min_utterance_ms)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// API key for the remote services. Falls back to `OPENAI_API_KEY` when
    /// unset.
    pub api_key: Option<String>,
    pub api_base: String,
    pub transcription_model: String,
    pub optimization_model: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: "https://api.openai.com/v1".to_string(),
            transcription_model: "whisper-1".to_string(),
            optimization_model: "gpt-4o-mini".to_string(),
        }
    }
}

impl RemoteConfig {
    /// Resolve the API key from the config or the environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.is_empty() => Some(key),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub capture: CaptureConfig,
    pub retry: RetryPolicy,
    pub remote: RemoteConfig,

    /// Per-request deadline for the remote stages, distinct from retry
    /// backoff.
    pub request_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            retry: RetryPolicy::default(),
            remote: RemoteConfig::default(),
            request_timeout_ms: 30_000,
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_missing_fields() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.capture.vad_frame_samples, 1024);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.remote.transcription_model, "whisper-1");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn partial_overrides_keep_other_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "capture": { "silence_timeout_ms": 800 } }"#).unwrap();
        assert_eq!(config.capture.silence_timeout(), Duration::from_millis(800));
        assert_eq!(config.capture.min_utterance_ms, 50);
    }
}
