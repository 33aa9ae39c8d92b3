//! Voice-to-optimized-text workflow engine.
//!
//! A trigger (typically a global hotkey in the host application) starts a
//! microphone capture session. Voice activity detection auto-stops the
//! recording after trailing silence, the audio is converted to mono 16 kHz
//! PCM, transcribed by a remote speech-to-text service, cleaned up by an
//! LLM, and the result is presented back to the host.
//!
//! The engine is headless: hosts bind the trigger, render the published
//! [`WorkflowState`] snapshots, and decide what to do with the final text.
//!
//! ```no_run
//! use std::sync::Arc;
//! use voxflow::{
//!     AlwaysGrantedProbe, CpalCaptureEngine, EngineConfig, HttpOptimizationClient,
//!     HttpTranscriptionClient, WorkflowCoordinator,
//! };
//!
//! # async fn start() {
//! let config = EngineConfig::default();
//! let coordinator = WorkflowCoordinator::spawn(
//!     config.clone(),
//!     Arc::new(CpalCaptureEngine::new(config.capture.clone())),
//!     Arc::new(HttpTranscriptionClient::new(&config)),
//!     Arc::new(HttpOptimizationClient::new(&config)),
//!     Arc::new(AlwaysGrantedProbe),
//! );
//!
//! let session = coordinator.trigger().await.unwrap();
//! println!("recording session {}", session);
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod permission;
pub mod remote;
pub mod retry;
pub mod state_machine;
pub mod types;

pub use audio::{CaptureEngine, CpalCaptureEngine, PcmAudio, RecordedAudio, StopCause};
pub use config::{CaptureConfig, EngineConfig, RemoteConfig};
pub use coordinator::WorkflowCoordinator;
pub use error::{ErrorKind, WorkflowError};
pub use permission::{AlwaysGrantedProbe, PermissionProbe, PermissionState};
pub use remote::{HttpOptimizationClient, HttpTranscriptionClient, Optimizer, Transcriber};
pub use retry::RetryPolicy;
pub use state_machine::WorkflowState;
pub use types::{
    OptimizationResult, TokenUsage, TranscriptSegment, TranscriptionResult, WorkflowOutcome,
};
