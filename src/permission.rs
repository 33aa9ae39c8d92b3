//! Microphone permission probing.
//!
//! The engine only depends on the logical capability: check the current
//! state, optionally prompt for it. Hosts on platforms with a real
//! permission dialog supply their own probe; anything but `Granted` is
//! treated as `PermissionDenied` by the pipeline.

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Denied,
    NotDetermined,
}

#[async_trait]
pub trait PermissionProbe: Send + Sync {
    /// Current permission state, without prompting.
    fn check(&self) -> PermissionState;

    /// Prompt the user if the platform supports it; resolves to the
    /// post-prompt state.
    async fn request(&self) -> PermissionState;
}

/// Probe for platforms without a permission broker (e.g. plain ALSA/Pulse
/// on Linux), where device access either works or fails at stream open.
pub struct AlwaysGrantedProbe;

#[async_trait]
impl PermissionProbe for AlwaysGrantedProbe {
    fn check(&self) -> PermissionState {
        PermissionState::Granted
    }

    async fn request(&self) -> PermissionState {
        PermissionState::Granted
    }
}
