//! End-to-end workflow tests over fake capture and remote stages.
//!
//! The fakes implement the same traits the real cpal engine and HTTP
//! clients do, so the coordinator, reducer and cancellation plumbing run
//! exactly as in production.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use voxflow::audio::{CaptureEngine, GateStats, PcmAudio, RecordedAudio, StopCause};
use voxflow::remote::{Optimizer, Transcriber};
use voxflow::state_machine::Event;
use voxflow::{
    AlwaysGrantedProbe, EngineConfig, ErrorKind, OptimizationResult, RetryPolicy, TokenUsage,
    TranscriptionResult, WorkflowCoordinator, WorkflowError, WorkflowState,
};

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 1,
            multiplier: 2.0,
            jitter: 0.25,
        },
        ..EngineConfig::default()
    }
}

/// One second of clearly voiced 16 kHz mono audio.
fn voiced_recording(id: Uuid) -> RecordedAudio {
    RecordedAudio {
        session_id: id,
        started_at: Utc::now(),
        samples: (0..16_000)
            .map(|i| if (i / 16) % 2 == 0 { 12_000 } else { -12_000 })
            .collect(),
        sample_rate: 16_000,
        channels: 1,
        stats: GateStats {
            total_frames: 15,
            active_frames: 12,
            peak_abs: 12_000,
        },
    }
}

fn silent_recording(id: Uuid) -> RecordedAudio {
    RecordedAudio {
        samples: vec![0i16; 16_000],
        stats: GateStats {
            total_frames: 15,
            active_frames: 0,
            peak_abs: 3,
        },
        ..voiced_recording(id)
    }
}

/// 25 ms, below the minimum utterance length.
fn too_short_recording(id: Uuid) -> RecordedAudio {
    RecordedAudio {
        samples: vec![500i16; 400],
        ..voiced_recording(id)
    }
}

/// Capture engine whose "microphone" is a canned recording. Tests drive
/// auto-stop by asking it to emit the event the real audio callback would.
struct FakeCaptureEngine {
    recording: Box<dyn Fn(Uuid) -> RecordedAudio + Send + Sync>,
    /// When present, `start` blocks on a permit, simulating a slow device
    /// open.
    start_gate: Option<Arc<tokio::sync::Semaphore>>,
    active: Mutex<Option<(Uuid, mpsc::Sender<Event>)>>,
    starts: AtomicU32,
    cancels: AtomicU32,
}

impl FakeCaptureEngine {
    fn new(recording: impl Fn(Uuid) -> RecordedAudio + Send + Sync + 'static) -> Arc<Self> {
        Self::build(recording, None)
    }

    /// Engine whose device open stalls until the returned semaphore gets a
    /// permit.
    fn gated(
        recording: impl Fn(Uuid) -> RecordedAudio + Send + Sync + 'static,
    ) -> (Arc<Self>, Arc<tokio::sync::Semaphore>) {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        (Self::build(recording, Some(gate.clone())), gate)
    }

    fn build(
        recording: impl Fn(Uuid) -> RecordedAudio + Send + Sync + 'static,
        start_gate: Option<Arc<tokio::sync::Semaphore>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            recording: Box::new(recording),
            start_gate,
            active: Mutex::new(None),
            starts: AtomicU32::new(0),
            cancels: AtomicU32::new(0),
        })
    }

    /// Emit the auto-stop the audio callback would produce on trailing
    /// silence.
    async fn emit_auto_stop(&self) {
        let (id, events) = {
            let guard = self.active.lock().unwrap();
            guard.clone().expect("no active capture to auto-stop")
        };
        events
            .send(Event::AutoStopped {
                id,
                cause: StopCause::TrailingSilence,
            })
            .await
            .unwrap();
    }
}

#[async_trait]
impl CaptureEngine for FakeCaptureEngine {
    async fn start(&self, session_id: Uuid, events: mpsc::Sender<Event>) -> Result<(), WorkflowError> {
        if let Some(gate) = &self.start_gate {
            gate.acquire().await.unwrap().forget();
        }
        let mut guard = self.active.lock().unwrap();
        if guard.is_some() {
            return Err(WorkflowError::new(
                ErrorKind::RecordingInProgress,
                "a recording session is already active",
            ));
        }
        *guard = Some((session_id, events));
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, session_id: Uuid) -> Result<RecordedAudio, WorkflowError> {
        let mut guard = self.active.lock().unwrap();
        match guard.take() {
            Some((id, _)) if id == session_id => Ok((self.recording)(id)),
            _ => Err(WorkflowError::new(
                ErrorKind::EngineFailure,
                "no active capture for that session",
            )),
        }
    }

    async fn cancel(&self, session_id: Uuid) {
        let mut guard = self.active.lock().unwrap();
        if matches!(guard.as_ref(), Some((id, _)) if *id == session_id) {
            *guard = None;
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Transcriber that fails a configurable number of times before answering,
/// driving the same retry machinery the HTTP client uses.
struct FakeTranscriber {
    text: String,
    failures_before_success: u32,
    retry: RetryPolicy,
    calls: AtomicU32,
}

impl FakeTranscriber {
    fn reliable(text: &str) -> Arc<Self> {
        Self::flaky(text, 0)
    }

    fn flaky(text: &str, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            text: text.to_string(),
            failures_before_success: failures,
            retry: test_config().retry,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(
        &self,
        audio: &PcmAudio,
        cancel: &CancellationToken,
    ) -> Result<TranscriptionResult, WorkflowError> {
        let audio_duration = audio.duration();
        let attempted = voxflow::retry::run_with_retry(&self.retry, cancel, |_attempt| {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < self.failures_before_success {
                    Err(WorkflowError::new(ErrorKind::ServerError, "upstream 503"))
                } else {
                    Ok(self.text.clone())
                }
            }
        })
        .await?;

        Ok(TranscriptionResult {
            text: attempted.value,
            language: Some("en".to_string()),
            segments: vec![],
            confidence: Some(0.95),
            audio_duration,
            attempts: attempted.attempts,
        })
    }
}

struct FakeOptimizer {
    reply: Option<String>,
    calls: AtomicU32,
}

impl FakeOptimizer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            calls: AtomicU32::new(0),
        })
    }

    fn canned(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_string()),
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Optimizer for FakeOptimizer {
    async fn optimize(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<OptimizationResult, WorkflowError> {
        if cancel.is_cancelled() {
            return Err(WorkflowError::cancelled());
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let optimized_text = self
            .reply
            .clone()
            .unwrap_or_else(|| format!("{} (optimized)", text));
        Ok(OptimizationResult {
            original_text: text.to_string(),
            optimized_text,
            improvements: vec!["fixed casing".to_string()],
            confidence: 0.9,
            usage: TokenUsage {
                prompt_tokens: 40,
                completion_tokens: 12,
                total_tokens: 52,
            },
            attempts: 1,
        })
    }
}

async fn wait_for_state<F>(coordinator: &WorkflowCoordinator, predicate: F) -> WorkflowState
where
    F: Fn(&WorkflowState) -> bool,
{
    let mut states = coordinator.subscribe();
    let state = timeout(WAIT, states.wait_for(|s| predicate(s)))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed")
        .clone();
    state
}

#[tokio::test]
async fn auto_stopped_recording_flows_to_presenting() {
    let engine = FakeCaptureEngine::new(voiced_recording);
    let coordinator = WorkflowCoordinator::spawn(
        test_config(),
        engine.clone(),
        FakeTranscriber::reliable("hello world"),
        FakeOptimizer::canned("Hello, world! (optimized)"),
        Arc::new(AlwaysGrantedProbe),
    );

    coordinator.trigger().await.unwrap();
    wait_for_state(&coordinator, |s| matches!(s, WorkflowState::Recording)).await;

    engine.emit_auto_stop().await;

    let state = wait_for_state(&coordinator, |s| {
        matches!(s, WorkflowState::Presenting { .. })
    })
    .await;
    match state {
        WorkflowState::Presenting { outcome } => {
            assert_eq!(outcome.transcription.text, "hello world");
            assert_eq!(
                outcome.optimization.optimized_text,
                "Hello, world! (optimized)"
            );
            assert_eq!(outcome.optimization.usage.total_tokens, 52);
        }
        other => panic!("expected Presenting, got {:?}", other),
    }

    coordinator.acknowledge().await.unwrap();
    wait_for_state(&coordinator, |s| matches!(s, WorkflowState::Idle)).await;
}

#[tokio::test]
async fn manual_stop_reaches_presenting() {
    let engine = FakeCaptureEngine::new(voiced_recording);
    let coordinator = WorkflowCoordinator::spawn(
        test_config(),
        engine,
        FakeTranscriber::reliable("manual stop works"),
        FakeOptimizer::new(),
        Arc::new(AlwaysGrantedProbe),
    );

    coordinator.trigger().await.unwrap();
    wait_for_state(&coordinator, |s| matches!(s, WorkflowState::Recording)).await;

    coordinator.stop().await.unwrap();
    let state = wait_for_state(&coordinator, |s| {
        matches!(s, WorkflowState::Presenting { .. })
    })
    .await;
    match state {
        WorkflowState::Presenting { outcome } => {
            assert_eq!(outcome.transcription.text, "manual stop works");
        }
        other => panic!("expected Presenting, got {:?}", other),
    }
}

#[tokio::test]
async fn concurrent_triggers_admit_exactly_one_session() {
    let engine = FakeCaptureEngine::new(voiced_recording);
    let coordinator = WorkflowCoordinator::spawn(
        test_config(),
        engine,
        FakeTranscriber::reliable("solo"),
        FakeOptimizer::new(),
        Arc::new(AlwaysGrantedProbe),
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let c = coordinator.clone();
        handles.push(tokio::spawn(async move { c.trigger().await }));
    }

    let mut accepted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(err) => {
                assert_eq!(err.kind, ErrorKind::RecordingInProgress);
                rejected += 1;
            }
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(rejected, 7);
}

#[tokio::test]
async fn trigger_while_recording_is_rejected_without_queueing() {
    let engine = FakeCaptureEngine::new(voiced_recording);
    let coordinator = WorkflowCoordinator::spawn(
        test_config(),
        engine.clone(),
        FakeTranscriber::reliable("first"),
        FakeOptimizer::new(),
        Arc::new(AlwaysGrantedProbe),
    );

    coordinator.trigger().await.unwrap();
    wait_for_state(&coordinator, |s| matches!(s, WorkflowState::Recording)).await;

    let err = coordinator.trigger().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RecordingInProgress);

    // The rejected trigger must not have started a second capture.
    assert_eq!(engine.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancel_during_recording_makes_no_network_calls() {
    let engine = FakeCaptureEngine::new(voiced_recording);
    let transcriber = FakeTranscriber::reliable("never sent");
    let optimizer = FakeOptimizer::new();
    let coordinator = WorkflowCoordinator::spawn(
        test_config(),
        engine.clone(),
        transcriber.clone(),
        optimizer.clone(),
        Arc::new(AlwaysGrantedProbe),
    );

    coordinator.trigger().await.unwrap();
    wait_for_state(&coordinator, |s| matches!(s, WorkflowState::Recording)).await;

    coordinator.cancel().await.unwrap();
    wait_for_state(&coordinator, |s| matches!(s, WorkflowState::Cancelled)).await;

    // The capture abort runs as a spawned effect; give it a moment.
    timeout(WAIT, async {
        while engine.cancels.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("capture was never aborted");

    assert_eq!(transcriber.calls.load(Ordering::SeqCst), 0);
    assert_eq!(optimizer.calls.load(Ordering::SeqCst), 0);
    assert_eq!(engine.cancels.load(Ordering::SeqCst), 1);

    // Acknowledging frees the slot for a fresh session.
    coordinator.acknowledge().await.unwrap();
    wait_for_state(&coordinator, |s| matches!(s, WorkflowState::Idle)).await;
    coordinator.trigger().await.unwrap();
    wait_for_state(&coordinator, |s| matches!(s, WorkflowState::Recording)).await;
}

#[tokio::test]
async fn cancel_while_device_opens_frees_the_slot_for_the_next_trigger() {
    let (engine, gate) = FakeCaptureEngine::gated(voiced_recording);
    let transcriber = FakeTranscriber::reliable("never sent");
    let optimizer = FakeOptimizer::new();
    let coordinator = WorkflowCoordinator::spawn(
        test_config(),
        engine.clone(),
        transcriber.clone(),
        optimizer.clone(),
        Arc::new(AlwaysGrantedProbe),
    );

    // Cancel lands while the device is still opening, before any frame.
    coordinator.trigger().await.unwrap();
    wait_for_state(&coordinator, |s| matches!(s, WorkflowState::Listening)).await;
    coordinator.cancel().await.unwrap();
    wait_for_state(&coordinator, |s| matches!(s, WorkflowState::Cancelled)).await;

    // Now let the stalled open finish. The late-started session must be
    // torn down rather than left holding the microphone.
    gate.add_permits(1);
    timeout(WAIT, async {
        while engine.cancels.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("late-started capture was never aborted");

    assert_eq!(transcriber.calls.load(Ordering::SeqCst), 0);
    assert_eq!(optimizer.calls.load(Ordering::SeqCst), 0);

    // The slot is free again: a fresh trigger records normally.
    coordinator.acknowledge().await.unwrap();
    wait_for_state(&coordinator, |s| matches!(s, WorkflowState::Idle)).await;
    gate.add_permits(1);
    coordinator.trigger().await.unwrap();
    wait_for_state(&coordinator, |s| matches!(s, WorkflowState::Recording)).await;
}

#[tokio::test]
async fn transient_transcription_failures_are_retried_to_success() {
    let engine = FakeCaptureEngine::new(voiced_recording);
    let transcriber = FakeTranscriber::flaky("eventually", 2);
    let coordinator = WorkflowCoordinator::spawn(
        test_config(),
        engine.clone(),
        transcriber.clone(),
        FakeOptimizer::new(),
        Arc::new(AlwaysGrantedProbe),
    );

    coordinator.trigger().await.unwrap();
    wait_for_state(&coordinator, |s| matches!(s, WorkflowState::Recording)).await;
    engine.emit_auto_stop().await;

    let state = wait_for_state(&coordinator, |s| {
        matches!(s, WorkflowState::Presenting { .. })
    })
    .await;
    match state {
        WorkflowState::Presenting { outcome } => {
            assert_eq!(outcome.transcription.text, "eventually");
            assert_eq!(outcome.transcription.attempts, 3);
        }
        other => panic!("expected Presenting, got {:?}", other),
    }
    assert_eq!(transcriber.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_surface_as_error_state() {
    let engine = FakeCaptureEngine::new(voiced_recording);
    // More failures than the policy's four attempts.
    let transcriber = FakeTranscriber::flaky("unreachable", 10);
    let coordinator = WorkflowCoordinator::spawn(
        test_config(),
        engine.clone(),
        transcriber.clone(),
        FakeOptimizer::new(),
        Arc::new(AlwaysGrantedProbe),
    );

    coordinator.trigger().await.unwrap();
    wait_for_state(&coordinator, |s| matches!(s, WorkflowState::Recording)).await;
    engine.emit_auto_stop().await;

    let state = wait_for_state(&coordinator, |s| matches!(s, WorkflowState::Error { .. })).await;
    match state {
        WorkflowState::Error { kind, attempts, .. } => {
            assert_eq!(kind, "server_error");
            assert_eq!(attempts, 4);
        }
        other => panic!("expected Error, got {:?}", other),
    }
    assert_eq!(transcriber.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn all_silence_recording_is_discarded() {
    let engine = FakeCaptureEngine::new(silent_recording);
    let transcriber = FakeTranscriber::reliable("should not transcribe silence");
    let coordinator = WorkflowCoordinator::spawn(
        test_config(),
        engine.clone(),
        transcriber.clone(),
        FakeOptimizer::new(),
        Arc::new(AlwaysGrantedProbe),
    );

    coordinator.trigger().await.unwrap();
    wait_for_state(&coordinator, |s| matches!(s, WorkflowState::Recording)).await;
    coordinator.stop().await.unwrap();

    wait_for_state(&coordinator, |s| matches!(s, WorkflowState::Cancelled)).await;
    assert_eq!(transcriber.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn too_short_recording_is_rejected() {
    let engine = FakeCaptureEngine::new(too_short_recording);
    let coordinator = WorkflowCoordinator::spawn(
        test_config(),
        engine,
        FakeTranscriber::reliable("blip"),
        FakeOptimizer::new(),
        Arc::new(AlwaysGrantedProbe),
    );

    coordinator.trigger().await.unwrap();
    wait_for_state(&coordinator, |s| matches!(s, WorkflowState::Recording)).await;
    coordinator.stop().await.unwrap();

    let state = wait_for_state(&coordinator, |s| matches!(s, WorkflowState::Error { .. })).await;
    match state {
        WorkflowState::Error { kind, .. } => assert_eq!(kind, "recording_too_short"),
        other => panic!("expected Error, got {:?}", other),
    }
}

#[tokio::test]
async fn cancel_from_idle_is_a_noop() {
    let engine = FakeCaptureEngine::new(voiced_recording);
    let coordinator = WorkflowCoordinator::spawn(
        test_config(),
        engine,
        FakeTranscriber::reliable("unused"),
        FakeOptimizer::new(),
        Arc::new(AlwaysGrantedProbe),
    );

    coordinator.cancel().await.unwrap();
    assert_eq!(coordinator.state(), WorkflowState::Idle);
}
