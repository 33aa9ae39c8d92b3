//! Speech-to-text over an OpenAI-compatible transcription endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::audio::PcmAudio;
use crate::config::{EngineConfig, RemoteConfig};
use crate::error::{ErrorKind, WorkflowError};
use crate::retry::{run_with_retry, RetryPolicy};
use crate::types::{TranscriptSegment, TranscriptionResult};

use super::{classify_transport, error_from_response, http_client};

/// Transcription stage abstraction.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe converted audio. Cancellation aborts in-flight requests
    /// and pending retries.
    async fn transcribe(
        &self,
        audio: &PcmAudio,
        cancel: &CancellationToken,
    ) -> Result<TranscriptionResult, WorkflowError>;
}

#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<VerboseSegment>,
}

#[derive(Debug, Deserialize)]
struct VerboseSegment {
    start: f64,
    end: f64,
    text: String,
    #[serde(default)]
    no_speech_prob: Option<f32>,
}

/// Whisper-style API client.
pub struct HttpTranscriptionClient {
    remote: RemoteConfig,
    retry: RetryPolicy,
    timeout: Duration,
}

impl HttpTranscriptionClient {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            remote: config.remote.clone(),
            retry: config.retry.clone(),
            timeout: config.request_timeout(),
        }
    }

    async fn request_once(
        &self,
        api_key: &str,
        wav_bytes: Vec<u8>,
        audio_duration: Duration,
    ) -> Result<TranscriptionResult, WorkflowError> {
        let part = Part::bytes(wav_bytes)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| {
                WorkflowError::new(ErrorKind::InvalidRequest, format!("multipart: {}", e))
            })?;

        let form = Form::new()
            .part("file", part)
            .text("model", self.remote.transcription_model.clone())
            .text("response_format", "verbose_json");

        let response = http_client()
            .post(format!("{}/audio/transcriptions", self.remote.api_base))
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                WorkflowError::new(classify_transport(&e), format!("request failed: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let parsed: VerboseTranscription = response.json().await.map_err(|e| {
            WorkflowError::new(
                ErrorKind::ServerError,
                format!("malformed transcription response: {}", e),
            )
        })?;

        Ok(build_result(parsed, audio_duration))
    }
}

fn build_result(parsed: VerboseTranscription, audio_duration: Duration) -> TranscriptionResult {
    // Confidence from the worst segment's no-speech probability.
    let confidence = parsed
        .segments
        .iter()
        .filter_map(|s| s.no_speech_prob)
        .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|p| (1.0 - p).clamp(0.0, 1.0));

    let segments = parsed
        .segments
        .into_iter()
        .map(|s| TranscriptSegment {
            start: s.start,
            end: s.end,
            text: s.text.trim().to_string(),
        })
        .collect();

    TranscriptionResult {
        text: parsed.text.trim().to_string(),
        language: parsed.language,
        segments,
        confidence,
        audio_duration,
        attempts: 1,
    }
}

#[async_trait]
impl Transcriber for HttpTranscriptionClient {
    async fn transcribe(
        &self,
        audio: &PcmAudio,
        cancel: &CancellationToken,
    ) -> Result<TranscriptionResult, WorkflowError> {
        if audio.is_empty() {
            return Err(WorkflowError::new(
                ErrorKind::InvalidRequest,
                "cannot transcribe empty audio",
            ));
        }

        let api_key = self.remote.resolve_api_key().ok_or_else(|| {
            WorkflowError::new(
                ErrorKind::AuthenticationFailed,
                "no API key configured; set OPENAI_API_KEY or remote.api_key",
            )
        })?;

        // Encode once; attempts reuse the same bytes.
        let wav_bytes = audio.to_wav_bytes()?;
        let audio_duration = audio.duration();

        log::info!(
            "Transcribing {:?} of audio ({} bytes WAV)",
            audio_duration,
            wav_bytes.len()
        );

        let attempted = run_with_retry(&self.retry, cancel, |attempt| {
            let wav_bytes = wav_bytes.clone();
            let api_key = api_key.clone();
            async move {
                if attempt > 1 {
                    log::info!("Transcription attempt {}", attempt);
                }
                tokio::select! {
                    _ = cancel.cancelled() => Err(WorkflowError::cancelled()),
                    result = self.request_once(&api_key, wav_bytes, audio_duration) => result,
                }
            }
        })
        .await?;

        let mut result = attempted.value;
        result.attempts = attempted.attempts;
        log::info!(
            "Transcription finished in {} attempt(s): {} chars",
            result.attempts,
            result.text.len()
        );
        Ok(result)
    }
}
