//! Relay error types

use std::time::Duration;

/// Relay error types.
///
/// `Clone` so that single-flight followers can receive the leader's outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    // Inbound errors
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    // Provider/network errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("circuit open, provider unavailable for {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    // Streaming errors
    #[error("stream error: {0}")]
    Stream(String),

    // Data errors
    #[error("JSON error: {0}")]
    Json(String),

    /// Durable cache tier failure. Handled inside the cache, never returned
    /// from the pipeline.
    #[error("cache tier error: {0}")]
    Cache(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no provider configured")]
    NoProvider,
}

/// The two error classes visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The inbound request itself is unacceptable.
    Validation,
    /// Anything that went wrong on the way to or from the provider.
    Api,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::Api => "api_error",
        }
    }
}

impl RelayError {
    /// Whether the retry policy should try again.
    ///
    /// Network failures, timeouts, 5xx and 429 are transient. Everything
    /// else (validation, auth, not-found, other 4xx, format errors) is not.
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::Http(_) | RelayError::Timeout(_) | RelayError::RateLimited { .. } => true,
            RelayError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Whether the dispatcher may substitute the fallback model.
    pub fn is_fallback_trigger(&self) -> bool {
        matches!(
            self,
            RelayError::ModelNotFound(_) | RelayError::Api { status: 404, .. }
        )
    }

    /// Provider-supplied delay hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RelayError::RateLimited { retry_after } => *retry_after,
            RelayError::CircuitOpen { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Caller-facing error class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Validation(_) => ErrorKind::Validation,
            _ => ErrorKind::Api,
        }
    }

    /// HTTP status equivalent for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::Validation(_) => 400,
            RelayError::RateLimited { .. } => 429,
            RelayError::AuthenticationFailed => 401,
            RelayError::ModelNotFound(_) => 404,
            RelayError::Api { status, .. } => *status,
            RelayError::Timeout(_) => 504,
            RelayError::CircuitOpen { .. } => 503,
            RelayError::Http(_) | RelayError::InvalidResponse(_) | RelayError::Stream(_) => 502,
            RelayError::Json(_)
            | RelayError::Cache(_)
            | RelayError::Configuration(_)
            | RelayError::NoProvider => 500,
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Json(err.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::Http(err.to_string())
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
