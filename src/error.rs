//! Error taxonomy for the voice workflow.
//!
//! Every failure the pipeline can surface is one of the kinds below. The
//! split that matters operationally is retryable vs. non-retryable: transient
//! network-stage failures are retried by `RetryPolicy`, everything else
//! aborts the session immediately.

use std::time::Duration;

/// Classification of workflow failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// OS denied microphone access.
    PermissionDenied,
    /// The audio subsystem could not start or died mid-session.
    EngineFailure,
    /// A session is already active; triggers are never queued.
    RecordingInProgress,
    /// Captured audio is below the minimum usable length.
    RecordingTooShort,
    /// Input rejected locally before any network round-trip.
    InvalidRequest,
    /// The remote service cannot process this input.
    UnsupportedInput,
    /// Credentials rejected by the remote service.
    AuthenticationFailed,
    /// Remote service rate limit hit.
    RateLimitExceeded,
    /// Input exceeds the remote model's context limit.
    TokenLimitExceeded,
    /// Remote service returned a 5xx.
    ServerError,
    /// Connection-level failure.
    NetworkError,
    /// Per-call deadline elapsed.
    Timeout,
    /// The workflow was cancelled. Not a failure.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::EngineFailure => "engine_failure",
            ErrorKind::RecordingInProgress => "recording_in_progress",
            ErrorKind::RecordingTooShort => "recording_too_short",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::UnsupportedInput => "unsupported_input",
            ErrorKind::AuthenticationFailed => "authentication_failed",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::TokenLimitExceeded => "token_limit_exceeded",
            ErrorKind::ServerError => "server_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

/// A workflow failure with a user-facing message and attempt accounting.
///
/// `attempts` counts how many times the failing operation ran (1 for
/// anything that is never retried). Carried into the terminal `Error` state
/// so the UI can decide whether a fresh recording is worth offering.
#[derive(Debug, Clone)]
pub struct WorkflowError {
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
    /// Server-provided backoff hint (Retry-After), if any.
    pub retry_after: Option<Duration>,
}

impl WorkflowError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts: 1,
            retry_after: None,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_retry_after(mut self, hint: Option<Duration>) -> Self {
        self.retry_after = hint;
        self
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.attempts > 1 {
            write!(
                f,
                "{} ({}, {} attempts)",
                self.message,
                self.kind.as_str(),
                self.attempts
            )
        } else {
            write!(f, "{} ({})", self.message, self.kind.as_str())
        }
    }
}

impl std::error::Error for WorkflowError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind() {
        let err = WorkflowError::new(ErrorKind::ServerError, "upstream exploded");
        let s = err.to_string();
        assert!(s.contains("upstream exploded"));
        assert!(s.contains("server_error"));
    }

    #[test]
    fn display_includes_attempts_when_retried() {
        let err = WorkflowError::new(ErrorKind::NetworkError, "connection reset").with_attempts(4);
        assert!(err.to_string().contains("4 attempts"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WorkflowError>();
    }
}
