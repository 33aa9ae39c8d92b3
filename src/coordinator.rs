//! Workflow coordinator.
//!
//! Owns the authoritative `State` on a single event loop: commands and
//! stage events funnel into one mpsc queue, every transition goes through
//! `reduce()`, and effects run as spawned tasks that report back as events.
//! Observers follow along on a watch channel of `WorkflowState` snapshots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{convert_recording, CaptureEngine, PcmAudio, RecordedAudio};
use crate::config::EngineConfig;
use crate::error::{ErrorKind, WorkflowError};
use crate::permission::{PermissionProbe, PermissionState};
use crate::remote::{Optimizer, Transcriber};
use crate::state_machine::{reduce, Effect, Event, State, WorkflowState};
use crate::types::TranscriptionResult;

enum Command {
    Trigger {
        reply: oneshot::Sender<Result<Uuid, WorkflowError>>,
    },
    Stop,
    Cancel,
    Acknowledge,
    Shutdown,
}

/// Handle to a running workflow engine. Cloneable; all clones talk to the
/// same event loop.
#[derive(Clone)]
pub struct WorkflowCoordinator {
    commands: mpsc::Sender<Command>,
    states: watch::Receiver<WorkflowState>,
}

impl WorkflowCoordinator {
    /// Spawn the event loop on the current tokio runtime.
    pub fn spawn(
        config: EngineConfig,
        engine: Arc<dyn CaptureEngine>,
        transcriber: Arc<dyn Transcriber>,
        optimizer: Arc<dyn Optimizer>,
        permissions: Arc<dyn PermissionProbe>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(WorkflowState::Idle);
        let (event_tx, event_rx) = mpsc::channel(64);

        let runner = Arc::new(PipelineRunner {
            config,
            engine,
            transcriber,
            optimizer,
            permissions,
            active: Mutex::new(None),
            denial_logged: AtomicBool::new(false),
        });

        let event_loop = EventLoop {
            state: State::Idle,
            commands: command_rx,
            events: event_rx,
            event_tx,
            states: state_tx,
            runner,
        };
        tokio::spawn(event_loop.run());

        Self {
            commands: command_tx,
            states: state_rx,
        }
    }

    /// Request a new capture session. Honored only from Idle; any other
    /// state answers `RecordingInProgress` without queueing.
    pub async fn trigger(&self) -> Result<Uuid, WorkflowError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Trigger { reply: reply_tx }).await?;
        reply_rx
            .await
            .map_err(|_| WorkflowError::new(ErrorKind::EngineFailure, "event loop gone"))?
    }

    /// Stop the active recording and run the pipeline on what was captured.
    pub async fn stop(&self) -> Result<(), WorkflowError> {
        self.send(Command::Stop).await
    }

    /// Cooperatively cancel whatever is in flight. No-op from Idle and from
    /// terminal states.
    pub async fn cancel(&self) -> Result<(), WorkflowError> {
        self.send(Command::Cancel).await
    }

    /// Dismiss a terminal state (Presenting, Cancelled, Error), returning
    /// to Idle.
    pub async fn acknowledge(&self) -> Result<(), WorkflowError> {
        self.send(Command::Acknowledge).await
    }

    /// Stop the event loop. Pending sessions are dropped.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    /// Current public state snapshot.
    pub fn state(&self) -> WorkflowState {
        self.states.borrow().clone()
    }

    /// Follow state changes. The receiver always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<WorkflowState> {
        self.states.clone()
    }

    async fn send(&self, command: Command) -> Result<(), WorkflowError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| WorkflowError::new(ErrorKind::EngineFailure, "event loop gone"))
    }
}

struct EventLoop {
    state: State,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Receiver<Event>,
    /// Kept so the events channel never closes while the loop lives.
    event_tx: mpsc::Sender<Event>,
    states: watch::Sender<WorkflowState>,
    runner: Arc<PipelineRunner>,
}

impl EventLoop {
    async fn run(mut self) {
        log::info!("Workflow event loop started");
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        None | Some(Command::Shutdown) => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                Some(event) = self.events.recv() => self.apply(event),
            }
        }

        // Tear down any live session on the way out.
        if let Some(id) = self.state.session_id() {
            self.runner.release(id);
            self.runner.engine.cancel(id).await;
        }
        log::info!("Workflow event loop stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Trigger { reply } => {
                if !matches!(self.state, State::Idle) {
                    let _ = reply.send(Err(WorkflowError::new(
                        ErrorKind::RecordingInProgress,
                        "workflow busy; finish or cancel the current session first",
                    )));
                    return;
                }
                let id = Uuid::new_v4();
                let _ = reply.send(Ok(id));
                self.apply(Event::Triggered { id });
            }
            Command::Stop => {
                if let State::Recording { session_id, .. } = self.state {
                    self.apply(Event::StopRequested { id: session_id });
                }
            }
            Command::Cancel => self.apply(Event::Cancel),
            Command::Acknowledge => self.apply(Event::Acknowledge),
            // Shutdown is consumed by the run loop before dispatch.
            Command::Shutdown => {}
        }
    }

    fn apply(&mut self, event: Event) {
        let (next, effects) = reduce(&self.state, event);
        self.state = next;

        for effect in effects {
            match effect {
                Effect::NotifyState => {
                    let _ = self.states.send(WorkflowState::from(&self.state));
                }
                Effect::ReleaseSession { id } => self.runner.release(id),
                other => self.runner.spawn(other, self.event_tx.clone()),
            }
        }
    }
}

/// Executes effects against the capture engine and the remote stages. One
/// session's cancellation token is live at a time.
struct PipelineRunner {
    config: EngineConfig,
    engine: Arc<dyn CaptureEngine>,
    transcriber: Arc<dyn Transcriber>,
    optimizer: Arc<dyn Optimizer>,
    permissions: Arc<dyn PermissionProbe>,
    active: Mutex<Option<(Uuid, CancellationToken)>>,
    denial_logged: AtomicBool,
}

impl PipelineRunner {
    fn register(&self, id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        let mut guard = self.active.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some((id, token.clone()));
        token
    }

    fn token_for(&self, id: Uuid) -> Option<CancellationToken> {
        let guard = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some((active, token)) if *active == id => Some(token.clone()),
            _ => None,
        }
    }

    /// Cancel the session token and free the slot.
    fn release(&self, id: Uuid) {
        let mut guard = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((active, token)) = guard.as_ref() {
            if *active == id {
                token.cancel();
                *guard = None;
            }
        }
    }

    fn spawn(self: &Arc<Self>, effect: Effect, events: mpsc::Sender<Event>) {
        let runner = self.clone();
        tokio::spawn(async move {
            match effect {
                Effect::StartCapture { id } => runner.start_capture(id, events).await,
                Effect::FinishCapture { id } => runner.finish_capture(id, events).await,
                Effect::AbortCapture { id } => runner.engine.cancel(id).await,
                Effect::Convert { id, audio } => runner.convert(id, audio, events).await,
                Effect::Transcribe { id, audio } => runner.transcribe(id, audio, events).await,
                Effect::Optimize { id, transcription } => {
                    runner.optimize(id, transcription, events).await
                }
                Effect::ReleaseSession { .. } | Effect::NotifyState => {
                    // Handled inline by the event loop.
                }
            }
        });
    }

    /// Run a stage under the session token: cancelled-before-start and
    /// missing-token (already released) both short-circuit as Cancelled.
    async fn stage_token<T, F, Fut>(&self, id: Uuid, stage: F) -> Result<T, WorkflowError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = Result<T, WorkflowError>>,
    {
        let token = self
            .token_for(id)
            .ok_or_else(WorkflowError::cancelled)?;
        if token.is_cancelled() {
            return Err(WorkflowError::cancelled());
        }
        stage(token).await
    }

    async fn start_capture(&self, id: Uuid, events: mpsc::Sender<Event>) {
        let token = self.register(id);

        match self.check_permission().await {
            PermissionState::Granted => {
                self.denial_logged.store(false, Ordering::Relaxed);
            }
            _ => {
                // Log the denial once per run, not per trigger.
                if !self.denial_logged.swap(true, Ordering::Relaxed) {
                    log::warn!("Microphone permission denied");
                }
                let _ = events
                    .send(Event::CaptureFailed {
                        id,
                        error: WorkflowError::new(
                            ErrorKind::PermissionDenied,
                            "microphone access is not granted",
                        ),
                    })
                    .await;
                return;
            }
        }

        if token.is_cancelled() {
            return;
        }

        match self.engine.start(id, events.clone()).await {
            Ok(()) => {
                // The session may have been cancelled while the device was
                // opening; tear the stream down instead of announcing it.
                if token.is_cancelled() {
                    self.engine.cancel(id).await;
                    return;
                }
                let _ = events.send(Event::CaptureStarted { id }).await;
            }
            Err(error) => {
                let _ = events.send(Event::CaptureFailed { id, error }).await;
            }
        }
    }

    async fn check_permission(&self) -> PermissionState {
        match self.permissions.check() {
            PermissionState::NotDetermined => self.permissions.request().await,
            state => state,
        }
    }

    /// Stop the stream, seal the buffer, and run the length and no-speech
    /// gates before anything reaches the network.
    async fn finish_capture(&self, id: Uuid, events: mpsc::Sender<Event>) {
        let audio = match self.engine.stop(id).await {
            Ok(audio) => audio,
            Err(error) => {
                let _ = events.send(Event::StageFailed { id, error }).await;
                return;
            }
        };

        if audio.duration() < self.config.capture.min_utterance() {
            let _ = events
                .send(Event::StageFailed {
                    id,
                    error: WorkflowError::new(
                        ErrorKind::RecordingTooShort,
                        format!("recording of {:?} is too short to transcribe", audio.duration()),
                    ),
                })
                .await;
            return;
        }

        if !audio.speech_detected() {
            let _ = events.send(Event::NoSpeech { id }).await;
            return;
        }

        let _ = events.send(Event::CaptureFinished { id, audio }).await;
    }

    async fn convert(&self, id: Uuid, audio: RecordedAudio, events: mpsc::Sender<Event>) {
        let result = self
            .stage_token(id, |_token| async move { Ok(convert_recording(&audio)) })
            .await;

        match result {
            Ok(pcm) => {
                let _ = events.send(Event::Converted { id, audio: pcm }).await;
            }
            Err(error) => {
                let _ = events.send(Event::StageFailed { id, error }).await;
            }
        }
    }

    async fn transcribe(&self, id: Uuid, audio: PcmAudio, events: mpsc::Sender<Event>) {
        let result = self
            .stage_token(id, |token| {
                let transcriber = self.transcriber.clone();
                async move { transcriber.transcribe(&audio, &token).await }
            })
            .await;

        match result {
            Ok(result) => {
                let _ = events.send(Event::TranscriptionFinished { id, result }).await;
            }
            Err(error) => {
                let _ = events.send(Event::StageFailed { id, error }).await;
            }
        }
    }

    async fn optimize(
        &self,
        id: Uuid,
        transcription: TranscriptionResult,
        events: mpsc::Sender<Event>,
    ) {
        let result = self
            .stage_token(id, |token| {
                let optimizer = self.optimizer.clone();
                let text = transcription.text.clone();
                async move { optimizer.optimize(&text, &token).await }
            })
            .await;

        match result {
            Ok(result) => {
                let _ = events.send(Event::OptimizationFinished { id, result }).await;
            }
            Err(error) => {
                let _ = events.send(Event::StageFailed { id, error }).await;
            }
        }
    }
}
