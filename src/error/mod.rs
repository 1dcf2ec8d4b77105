use serde_json::Value;
use thiserror::Error as ThisError;

/// Whether an error is safe to retry internally.
///
/// Mirrors the reference implementation's `IsRetryable` trait: retry
/// decisions live next to the error taxonomy instead of being re-derived at
/// every call site.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

/// Top-level error taxonomy for the client.
///
/// Components closest to the wire (`http_client`, `sse`) attach
/// `http_status` and `details` (the full decoded error body) without
/// reshaping; middle layers (`retry`, `rate_limit`) classify into this
/// taxonomy but never discard the preserved details.
#[derive(Debug, ThisError)]
pub enum GeminiError {
    #[error("missing credentials: {reason}")]
    MissingCredentials { reason: String },

    #[error("auth exchange failed: {message}")]
    AuthExchangeFailed {
        message: String,
        http_status: Option<u16>,
        details: Option<Value>,
    },

    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        http_status: Option<u16>,
        details: Option<Value>,
    },

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        http_status: Option<u16>,
        details: Option<Value>,
    },

    #[error("server error: {message}")]
    ServerError {
        message: String,
        http_status: Option<u16>,
        details: Option<Value>,
    },

    #[error("transport error: {0}")]
    TransportError(#[from] reqwest::Error),

    #[error("websocket transport error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("operation would exceed the retry embargo for model {model}")]
    OverEmbargo { model: String },

    #[error("operation would exceed the token budget for model {model}")]
    OverBudget { model: String },

    #[error("no concurrency permit available for model {model}")]
    OverCapacity { model: String },

    #[error("operation timed out")]
    Timeout,

    #[error("malformed response: {message}")]
    MalformedResponse { message: String, raw: Option<String> },

    #[error("tool orchestrator exceeded its turn limit")]
    TurnLimitExceeded,

    #[error("invalid state: {message}")]
    InvalidState { message: String },
}

impl GeminiError {
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::AuthExchangeFailed { http_status, .. }
            | Self::InvalidRequest { http_status, .. }
            | Self::RateLimited { http_status, .. }
            | Self::ServerError { http_status, .. } => *http_status,
            _ => None,
        }
    }

    pub fn details(&self) -> Option<&Value> {
        match self {
            Self::AuthExchangeFailed { details, .. }
            | Self::InvalidRequest { details, .. }
            | Self::RateLimited { details, .. }
            | Self::ServerError { details, .. } => details.as_ref(),
            _ => None,
        }
    }
}

impl IsRetryable for GeminiError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::AuthExchangeFailed { .. } => true,
            Self::RateLimited { .. } | Self::ServerError { .. } => true,
            Self::TransportError(_) | Self::WebSocketError(_) => true,
            Self::MissingCredentials { .. }
            | Self::InvalidRequest { .. }
            | Self::OverEmbargo { .. }
            | Self::OverBudget { .. }
            | Self::OverCapacity { .. }
            | Self::Timeout
            | Self::MalformedResponse { .. }
            | Self::TurnLimitExceeded
            | Self::InvalidState { .. } => false,
        }
    }
}
