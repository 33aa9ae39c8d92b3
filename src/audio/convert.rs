//! Format conversion to the fixed transcription format.
//!
//! The transcription service takes mono 16 kHz 16-bit PCM. `convert` is a
//! pure function: multi-channel input is mean-downmixed, then resampled by
//! linear interpolation. Deterministic, no side effects.

use std::io::Cursor;
use std::time::Duration;

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::error::{ErrorKind, WorkflowError};

use super::session::RecordedAudio;

/// Sample rate required by the transcription stage.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Mono 16 kHz 16-bit PCM, ready for upload.
#[derive(Debug, Clone)]
pub struct PcmAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl PcmAudio {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Encode as an in-memory 16-bit WAV for the multipart upload.
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>, WorkflowError> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).map_err(|e| {
                WorkflowError::new(ErrorKind::EngineFailure, format!("WAV encode: {}", e))
            })?;
            for &sample in &self.samples {
                writer.write_sample(sample).map_err(|e| {
                    WorkflowError::new(ErrorKind::EngineFailure, format!("WAV encode: {}", e))
                })?;
            }
            writer.finalize().map_err(|e| {
                WorkflowError::new(ErrorKind::EngineFailure, format!("WAV finalize: {}", e))
            })?;
        }
        Ok(cursor.into_inner())
    }
}

/// Convert interleaved PCM to mono 16 kHz. Empty input yields empty output.
pub fn convert(samples: &[i16], source_rate: u32, channels: u16) -> PcmAudio {
    let mono = downmix(samples, channels);
    let samples = resample(&mono, source_rate, TARGET_SAMPLE_RATE);
    PcmAudio {
        samples,
        sample_rate: TARGET_SAMPLE_RATE,
    }
}

/// Convert a sealed recording using its own format metadata.
pub fn convert_recording(audio: &RecordedAudio) -> PcmAudio {
    convert(&audio.samples, audio.sample_rate, audio.channels)
}

/// Average interleaved channels down to mono.
fn downmix(samples: &[i16], channels: u16) -> Vec<i16> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }

    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Linear-interpolation resampler.
fn resample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if samples.is_empty() || source_rate == 0 {
        return Vec::new();
    }
    if source_rate == target_rate {
        return samples.to_vec();
    }

    let out_len = (samples.len() as u64 * target_rate as u64 / source_rate as u64) as usize;
    let ratio = source_rate as f64 / target_rate as f64;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = pos - idx as f64;

            let a = samples[idx.min(samples.len() - 1)] as f64;
            let b = samples[(idx + 1).min(samples.len() - 1)] as f64;
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}
