//! Workflow state machine.
//!
//! Single-writer pattern: every transition goes through `reduce()`, which
//! returns the next state plus a list of effects for the runner to execute.
//! Events carrying a session id that does not match the active session are
//! dropped silently, so results from a cancelled or superseded session can
//! never corrupt the current one.

use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

use crate::audio::{PcmAudio, RecordedAudio, StopCause};
use crate::error::{ErrorKind, WorkflowError};
use crate::types::{OptimizationResult, TranscriptionResult, WorkflowOutcome};

/// Internal, authoritative workflow state.
#[derive(Debug, Clone)]
pub enum State {
    Idle,
    /// Waiting for the microphone stream to come up.
    Listening { session_id: Uuid },
    Recording {
        session_id: Uuid,
        started_at: Instant,
    },
    Converting { session_id: Uuid },
    Transcribing { session_id: Uuid },
    Optimizing {
        session_id: Uuid,
        transcription: TranscriptionResult,
    },
    Presenting {
        session_id: Uuid,
        outcome: WorkflowOutcome,
    },
    Cancelled { session_id: Uuid },
    Error {
        session_id: Option<Uuid>,
        error: WorkflowError,
    },
}

impl Default for State {
    fn default() -> Self {
        State::Idle
    }
}

impl State {
    /// Terminal states persist until acknowledged.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            State::Presenting { .. } | State::Cancelled { .. } | State::Error { .. }
        )
    }

    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            State::Idle => None,
            State::Listening { session_id }
            | State::Recording { session_id, .. }
            | State::Converting { session_id }
            | State::Transcribing { session_id }
            | State::Optimizing { session_id, .. }
            | State::Presenting { session_id, .. }
            | State::Cancelled { session_id } => Some(*session_id),
            State::Error { session_id, .. } => *session_id,
        }
    }
}

/// Events that drive transitions. Sent by the coordinator commands, the
/// capture engine, and the pipeline effect tasks.
#[derive(Debug, Clone)]
pub enum Event {
    /// A trigger was accepted from Idle; a fresh session id was minted.
    Triggered { id: Uuid },
    /// User-requested stop of the active recording.
    StopRequested { id: Uuid },
    /// Cooperative cancel of whatever is in flight.
    Cancel,
    /// Dismiss a terminal state, returning to Idle.
    Acknowledge,

    // Capture events
    CaptureStarted { id: Uuid },
    CaptureFailed { id: Uuid, error: WorkflowError },
    /// Emitted from the audio callback on trailing-silence timeout or the
    /// max-duration cap.
    AutoStopped { id: Uuid, cause: StopCause },
    CaptureFinished { id: Uuid, audio: RecordedAudio },
    /// The sealed recording contained no voiced frames; discard it.
    NoSpeech { id: Uuid },

    // Pipeline events
    Converted { id: Uuid, audio: PcmAudio },
    TranscriptionFinished {
        id: Uuid,
        result: TranscriptionResult,
    },
    OptimizationFinished {
        id: Uuid,
        result: OptimizationResult,
    },
    StageFailed { id: Uuid, error: WorkflowError },
}

/// Effects produced by transitions, executed asynchronously by the runner.
#[derive(Debug, Clone)]
pub enum Effect {
    StartCapture { id: Uuid },
    /// Stop the stream, seal the buffer, run the length/no-speech gate.
    FinishCapture { id: Uuid },
    /// Stop the stream and discard the buffer.
    AbortCapture { id: Uuid },
    Convert { id: Uuid, audio: RecordedAudio },
    Transcribe { id: Uuid, audio: PcmAudio },
    Optimize {
        id: Uuid,
        transcription: TranscriptionResult,
    },
    /// Cancel the session token and free the active-session slot.
    ReleaseSession { id: Uuid },
    /// Publish the current state on the notification stream.
    NotifyState,
}

/// Reducer: `(state, event) -> (next_state, effects)`.
///
/// Rules: never mutate in place, drop stale-id events, emit `NotifyState`
/// whenever the observable state changed.
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;

    let current_id = state.session_id();
    let is_stale = |eid: Uuid| current_id != Some(eid);

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (State::Idle, Triggered { id }) => (
            State::Listening { session_id: id },
            vec![StartCapture { id }, NotifyState],
        ),
        (State::Idle, Cancel) => (State::Idle, vec![]),

        // -----------------
        // Listening
        // -----------------
        (State::Listening { session_id }, CaptureStarted { id }) if *session_id == id => (
            State::Recording {
                session_id: id,
                started_at: Instant::now(),
            },
            vec![NotifyState],
        ),
        (State::Listening { session_id }, CaptureFailed { id, error }) if *session_id == id => {
            log::error!("Capture failed to start for session {}: {}", id, error);
            (
                State::Error {
                    session_id: Some(id),
                    error,
                },
                vec![ReleaseSession { id }, NotifyState],
            )
        }
        (State::Listening { session_id }, Cancel) => {
            let id = *session_id;
            (
                State::Cancelled { session_id: id },
                // Abort covers the race where the stream comes up between
                // the cancel and the engine observing it.
                vec![AbortCapture { id }, ReleaseSession { id }, NotifyState],
            )
        }

        // -----------------
        // Recording
        // -----------------
        (State::Recording { session_id, .. }, StopRequested { id }) if *session_id == id => (
            State::Converting { session_id: id },
            vec![FinishCapture { id }, NotifyState],
        ),
        (State::Recording { session_id, .. }, AutoStopped { id, cause }) if *session_id == id => {
            log::info!("Recording {} auto-stopped ({:?})", id, cause);
            (
                State::Converting { session_id: id },
                vec![FinishCapture { id }, NotifyState],
            )
        }
        (State::Recording { session_id, .. }, Cancel) => {
            let id = *session_id;
            (
                State::Cancelled { session_id: id },
                vec![AbortCapture { id }, ReleaseSession { id }, NotifyState],
            )
        }

        // -----------------
        // Converting
        // -----------------
        (State::Converting { session_id }, CaptureFinished { id, audio })
            if *session_id == id =>
        {
            // Still Converting; the conversion itself runs as an effect.
            (state.clone(), vec![Convert { id, audio }])
        }
        (State::Converting { session_id }, NoSpeech { id }) if *session_id == id => {
            log::info!("Session {} contained no speech, discarding", id);
            (
                State::Cancelled { session_id: id },
                vec![ReleaseSession { id }, NotifyState],
            )
        }
        (State::Converting { session_id }, Converted { id, audio }) if *session_id == id => (
            State::Transcribing { session_id: id },
            vec![Transcribe { id, audio }, NotifyState],
        ),

        // -----------------
        // Transcribing
        // -----------------
        (State::Transcribing { session_id }, TranscriptionFinished { id, result })
            if *session_id == id =>
        {
            log::info!(
                "Session {} transcribed: {} chars in {} attempt(s)",
                id,
                result.text.len(),
                result.attempts
            );
            (
                State::Optimizing {
                    session_id: id,
                    transcription: result.clone(),
                },
                vec![
                    Optimize {
                        id,
                        transcription: result,
                    },
                    NotifyState,
                ],
            )
        }

        // -----------------
        // Optimizing
        // -----------------
        (
            State::Optimizing {
                session_id,
                transcription,
            },
            OptimizationFinished { id, result },
        ) if *session_id == id => (
            State::Presenting {
                session_id: id,
                outcome: WorkflowOutcome {
                    transcription: transcription.clone(),
                    optimization: result,
                },
            },
            vec![ReleaseSession { id }, NotifyState],
        ),

        // -----------------
        // Cancel from the in-pipeline states: the session token aborts any
        // in-flight request, the reducer only records the outcome.
        // -----------------
        (
            State::Converting { session_id }
            | State::Transcribing { session_id }
            | State::Optimizing { session_id, .. },
            Cancel,
        ) => {
            let id = *session_id;
            (
                State::Cancelled { session_id: id },
                vec![ReleaseSession { id }, NotifyState],
            )
        }

        // -----------------
        // Stage failures from any active state
        // -----------------
        (_, StageFailed { id, error }) if current_id == Some(id) && !state.is_terminal() => {
            if error.kind == ErrorKind::Cancelled {
                // Cancellation surfacing through a stage is the normal
                // cooperative path, not a failure.
                (
                    State::Cancelled { session_id: id },
                    vec![ReleaseSession { id }, NotifyState],
                )
            } else {
                log::error!("Session {} failed: {}", id, error);
                let mut effects = vec![ReleaseSession { id }, NotifyState];
                if matches!(state, State::Listening { .. } | State::Recording { .. }) {
                    effects.insert(0, AbortCapture { id });
                }
                (
                    State::Error {
                        session_id: Some(id),
                        error,
                    },
                    effects,
                )
            }
        }

        // -----------------
        // Terminal states
        // -----------------
        (State::Presenting { .. } | State::Cancelled { .. } | State::Error { .. }, Acknowledge) => {
            (State::Idle, vec![NotifyState])
        }
        (State::Presenting { .. } | State::Cancelled { .. } | State::Error { .. }, Cancel) => {
            (state.clone(), vec![])
        }

        // -----------------
        // A stream that comes up for a session no longer active must be
        // torn down, or the engine slot stays held forever.
        // -----------------
        (_, CaptureStarted { id }) if is_stale(id) || state.is_terminal() => {
            log::debug!("Tearing down late capture start for session {}", id);
            (state.clone(), vec![AbortCapture { id }])
        }

        // -----------------
        // Stale events (drop silently)
        // -----------------
        (_, CaptureFailed { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, AutoStopped { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, CaptureFinished { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, NoSpeech { id }) if is_stale(id) => (state.clone(), vec![]),
        (_, Converted { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, TranscriptionFinished { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, OptimizationFinished { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, StageFailed { id, .. }) if is_stale(id) => (state.clone(), vec![]),

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

/// Public state snapshot published on the notification stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum WorkflowState {
    Idle,
    Listening,
    Recording,
    Converting,
    Transcribing,
    Optimizing,
    Presenting { outcome: WorkflowOutcome },
    Cancelled,
    Error {
        message: String,
        kind: String,
        attempts: u32,
    },
}

impl From<&State> for WorkflowState {
    fn from(state: &State) -> Self {
        match state {
            State::Idle => WorkflowState::Idle,
            State::Listening { .. } => WorkflowState::Listening,
            State::Recording { .. } => WorkflowState::Recording,
            State::Converting { .. } => WorkflowState::Converting,
            State::Transcribing { .. } => WorkflowState::Transcribing,
            State::Optimizing { .. } => WorkflowState::Optimizing,
            State::Presenting { outcome, .. } => WorkflowState::Presenting {
                outcome: outcome.clone(),
            },
            State::Cancelled { .. } => WorkflowState::Cancelled,
            State::Error { error, .. } => WorkflowState::Error {
                message: error.message.clone(),
                kind: error.kind.as_str().to_string(),
                attempts: error.attempts,
            },
        }
    }
}
