//! Remote transcription and optimization services.
//!
//! Both clients speak to an OpenAI-compatible API over a shared HTTP client
//! and classify responses into the engine's error taxonomy so the retry
//! layer can decide what is worth reattempting.

pub mod optimization;
pub mod transcription;

pub use optimization::{HttpOptimizationClient, Optimizer};
pub use transcription::{HttpTranscriptionClient, Transcriber};

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::{Client, Response, StatusCode};

use crate::error::{ErrorKind, WorkflowError};

/// Global HTTP client for reuse across requests (avoids TLS handshake
/// overhead). Per-request deadlines come from the engine config.
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

pub(crate) fn http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .build()
            .unwrap_or_else(|e| panic!("failed to build HTTP client: {}", e))
    })
}

/// Map an HTTP status to the engine's error taxonomy.
pub(crate) fn classify_status(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::AuthenticationFailed,
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimitExceeded,
        StatusCode::REQUEST_TIMEOUT => ErrorKind::Timeout,
        StatusCode::PAYLOAD_TOO_LARGE => ErrorKind::TokenLimitExceeded,
        s if s.is_server_error() => ErrorKind::ServerError,
        _ => ErrorKind::InvalidRequest,
    }
}

/// Map a transport-level reqwest failure.
pub(crate) fn classify_transport(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::Timeout
    } else {
        ErrorKind::NetworkError
    }
}

/// Pull a `Retry-After` delay hint out of the response headers, if present.
pub(crate) fn retry_after_hint(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Turn a non-success response into a `WorkflowError`, consuming the body
/// for the message.
pub(crate) async fn error_from_response(response: Response) -> WorkflowError {
    let status = response.status();
    let kind = classify_status(status);
    let hint = retry_after_hint(&response);

    let body = response.text().await.unwrap_or_default();
    let message = parse_api_error(&body)
        .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), truncate(&body, 200)));

    WorkflowError::new(kind, message).with_retry_after(hint)
}

#[derive(serde::Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(serde::Deserialize)]
struct ApiErrorDetail {
    message: String,
}

fn parse_api_error(body: &str) -> Option<String> {
    serde_json::from_str::<ApiErrorResponse>(body)
        .ok()
        .map(|e| e.error.message)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
