//! Microphone capture engine.
//!
//! `CpalCaptureEngine` owns the microphone as a single-owner resource: one
//! session at a time, a second start fails with `RecordingInProgress`. The
//! cpal stream is `!Send`, so it lives on a dedicated thread controlled
//! through a command channel; the audio callback only converts samples,
//! appends to the session buffer and advances the voice gate. Auto-stop is
//! signalled to the coordinator with a non-blocking `try_send`.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::CaptureConfig;
use crate::error::{ErrorKind, WorkflowError};
use crate::state_machine::Event;

use super::session::{AudioSession, RecordedAudio, SessionSignal};

/// Capture abstraction the coordinator depends on. The engine reports
/// auto-stop through the event channel handed to `start`; stop and cancel
/// resolve the session's fate.
#[async_trait]
pub trait CaptureEngine: Send + Sync {
    /// Begin a capture session. Fails with `RecordingInProgress` if one is
    /// already active; starts are never queued.
    async fn start(
        &self,
        session_id: Uuid,
        events: mpsc::Sender<Event>,
    ) -> Result<(), WorkflowError>;

    /// Stop the stream and seal the buffer.
    async fn stop(&self, session_id: Uuid) -> Result<RecordedAudio, WorkflowError>;

    /// Stop the stream and discard the buffer. Unknown ids are a no-op.
    async fn cancel(&self, session_id: Uuid);
}

enum AudioCommand {
    Finish {
        reply: std_mpsc::SyncSender<Result<RecordedAudio, WorkflowError>>,
    },
    Discard,
}

struct ActiveCapture {
    session_id: Uuid,
    commands: std_mpsc::Sender<AudioCommand>,
}

/// Real capture engine over the default cpal input device.
pub struct CpalCaptureEngine {
    config: CaptureConfig,
    active: Mutex<Option<ActiveCapture>>,
}

impl CpalCaptureEngine {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            active: Mutex::new(None),
        }
    }

    fn take_active(&self, session_id: Uuid) -> Option<ActiveCapture> {
        let mut guard = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(active) if active.session_id == session_id => guard.take(),
            _ => None,
        }
    }
}

#[async_trait]
impl CaptureEngine for CpalCaptureEngine {
    async fn start(
        &self,
        session_id: Uuid,
        events: mpsc::Sender<Event>,
    ) -> Result<(), WorkflowError> {
        {
            let guard = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_some() {
                return Err(WorkflowError::new(
                    ErrorKind::RecordingInProgress,
                    "a recording session is already active",
                ));
            }
        }

        let (command_tx, command_rx) = std_mpsc::channel::<AudioCommand>();
        let (startup_tx, startup_rx) = oneshot::channel::<Result<(), WorkflowError>>();
        let config = self.config.clone();

        std::thread::Builder::new()
            .name("voxflow-capture".to_string())
            .spawn(move || {
                audio_thread(session_id, config, events, command_rx, startup_tx);
            })
            .map_err(|e| {
                WorkflowError::new(
                    ErrorKind::EngineFailure,
                    format!("failed to spawn capture thread: {}", e),
                )
            })?;

        match startup_rx.await {
            Ok(Ok(())) => {
                let mut guard = self.active.lock().unwrap_or_else(|e| e.into_inner());
                *guard = Some(ActiveCapture {
                    session_id,
                    commands: command_tx,
                });
                log::info!("Capture started for session {}", session_id);
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(WorkflowError::new(
                ErrorKind::EngineFailure,
                "capture thread died before reporting startup",
            )),
        }
    }

    async fn stop(&self, session_id: Uuid) -> Result<RecordedAudio, WorkflowError> {
        let active = self.take_active(session_id).ok_or_else(|| {
            WorkflowError::new(
                ErrorKind::EngineFailure,
                format!("no active capture for session {}", session_id),
            )
        })?;

        let (reply_tx, reply_rx) = std_mpsc::sync_channel(1);
        active
            .commands
            .send(AudioCommand::Finish { reply: reply_tx })
            .map_err(|_| {
                WorkflowError::new(ErrorKind::EngineFailure, "capture thread already gone")
            })?;

        // The audio thread replies over a sync channel; wait for it off the
        // async runtime.
        let sealed = tokio::task::spawn_blocking(move || reply_rx.recv())
            .await
            .map_err(|e| {
                WorkflowError::new(ErrorKind::EngineFailure, format!("stop task failed: {}", e))
            })?
            .map_err(|_| {
                WorkflowError::new(ErrorKind::EngineFailure, "capture thread dropped the reply")
            })??;

        log::info!(
            "Capture stopped for session {}: {:?} of audio",
            session_id,
            sealed.duration()
        );
        Ok(sealed)
    }

    async fn cancel(&self, session_id: Uuid) {
        if let Some(active) = self.take_active(session_id) {
            let _ = active.commands.send(AudioCommand::Discard);
            log::info!("Capture cancelled for session {}", session_id);
        }
    }
}

/// Dedicated thread owning the cpal stream for one session.
fn audio_thread(
    session_id: Uuid,
    config: CaptureConfig,
    events: mpsc::Sender<Event>,
    commands: std_mpsc::Receiver<AudioCommand>,
    startup: oneshot::Sender<Result<(), WorkflowError>>,
) {
    let built = build_capture(session_id, &config, events);
    let (stream, session) = match built {
        Ok(parts) => parts,
        Err(err) => {
            let _ = startup.send(Err(err));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = startup.send(Err(WorkflowError::new(
            ErrorKind::EngineFailure,
            format!("failed to start input stream: {}", e),
        )));
        return;
    }
    let _ = startup.send(Ok(()));

    // Block until the coordinator decides the session's fate. A closed
    // channel means the engine was dropped; discard.
    match commands.recv() {
        Ok(AudioCommand::Finish { reply }) => {
            drop(stream);
            let mut guard = session.lock().unwrap_or_else(|e| e.into_inner());
            let result = match guard.take() {
                Some(session) => Ok(session.seal()),
                None => Err(WorkflowError::new(
                    ErrorKind::EngineFailure,
                    "capture session buffer missing at stop",
                )),
            };
            let _ = reply.send(result);
        }
        Ok(AudioCommand::Discard) | Err(_) => {
            drop(stream);
            log::debug!("Capture session {} discarded", session_id);
        }
    }
}

type SharedSession = Arc<Mutex<Option<AudioSession>>>;

fn build_capture(
    session_id: Uuid,
    config: &CaptureConfig,
    events: mpsc::Sender<Event>,
) -> Result<(cpal::Stream, SharedSession), WorkflowError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or_else(|| {
        WorkflowError::new(ErrorKind::EngineFailure, "no audio input device found")
    })?;

    log::info!(
        "Using audio input device: {:?}",
        device.name().unwrap_or_else(|_| "unknown".to_string())
    );

    let supported = device.default_input_config().map_err(|e| {
        WorkflowError::new(
            ErrorKind::EngineFailure,
            format!("no supported input configuration: {}", e),
        )
    })?;

    let sample_format = supported.sample_format();
    let stream_config: StreamConfig = supported.into();

    log::info!(
        "Audio config: {} Hz, {} channels, {:?}",
        stream_config.sample_rate.0,
        stream_config.channels,
        sample_format
    );

    let session = AudioSession::new(
        session_id,
        stream_config.sample_rate.0,
        stream_config.channels,
        config,
    );
    let shared: SharedSession = Arc::new(Mutex::new(Some(session)));

    let stream = match sample_format {
        SampleFormat::I16 => {
            build_stream_typed::<i16>(&device, &stream_config, shared.clone(), events)
        }
        SampleFormat::U16 => {
            build_stream_typed::<u16>(&device, &stream_config, shared.clone(), events)
        }
        SampleFormat::F32 => {
            build_stream_typed::<f32>(&device, &stream_config, shared.clone(), events)
        }
        other => Err(WorkflowError::new(
            ErrorKind::EngineFailure,
            format!("unsupported sample format {:?}", other),
        )),
    }?;

    Ok((stream, shared))
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: SharedSession,
    events: mpsc::Sender<Event>,
) -> Result<cpal::Stream, WorkflowError>
where
    T: cpal::Sample<Float = f32> + cpal::SizedSample + Send + 'static,
{
    let err_fn = |err| log::error!("Audio stream error: {}", err);
    // Scratch buffer reused across callbacks; grown once to the callback
    // block size, never inside the steady state.
    let mut scratch: Vec<i16> = Vec::new();

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&s| sample_to_i16(s)));

                let mut guard = shared.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(session) = guard.as_mut() {
                    if let SessionSignal::AutoStop(cause) = session.push(&scratch) {
                        let id = session.id();
                        // try_send: the audio callback must never block on
                        // the coordinator.
                        let _ = events.try_send(Event::AutoStopped { id, cause });
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| {
            WorkflowError::new(
                ErrorKind::EngineFailure,
                format!("failed to create input stream: {}", e),
            )
        })?;

    Ok(stream)
}

/// Convert any cpal sample type to i16 PCM.
fn sample_to_i16<T: cpal::Sample<Float = f32>>(sample: T) -> i16 {
    let f = sample.to_float_sample();
    (f.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}
