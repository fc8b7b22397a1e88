use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw failure surfaced by the request gateway, before normalization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("No response from server: {0}")]
    NoResponse(String),

    #[error("{0}")]
    Other(String),

    #[error("Unknown failure")]
    Unknown,
}

/// Maximum length for error response bodies kept on a `TransportError`
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl TransportError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        TransportError::Status {
            status,
            body: Self::truncate_body(body),
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() || err.is_request() {
            TransportError::NoResponse(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::from_reqwest(err)
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Other(format!("Invalid response: {}", err))
    }
}

// ============================================================================
// Normalized errors
// ============================================================================

/// Classification of a normalized error. Each kind has a fixed user-facing title.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    RequestTimeout,
    SessionExpired,
    AccessDenied,
    NotFound,
    Conflict,
    ValidationError,
    TooManyRequests,
    ServerError,
    RequestFailed,
    ConnectionError,
    Error,
    UnexpectedError,
    Cancelled,
}

impl ErrorKind {
    pub fn title(&self) -> &'static str {
        match self {
            ErrorKind::RequestTimeout => "Request Timeout",
            ErrorKind::SessionExpired => "Session Expired",
            ErrorKind::AccessDenied => "Access Denied",
            ErrorKind::NotFound => "Not Found",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::ValidationError => "Validation Error",
            ErrorKind::TooManyRequests => "Too Many Requests",
            ErrorKind::ServerError => "Server Error",
            ErrorKind::RequestFailed => "Request Failed",
            ErrorKind::ConnectionError => "Connection Error",
            ErrorKind::Error => "Error",
            ErrorKind::UnexpectedError => "Unexpected Error",
            ErrorKind::Cancelled => "Request Cancelled",
        }
    }

    fn from_status(status: u16) -> Self {
        match status {
            401 => ErrorKind::SessionExpired,
            403 => ErrorKind::AccessDenied,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            422 => ErrorKind::ValidationError,
            429 => ErrorKind::TooManyRequests,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::RequestFailed,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Uniform error shape consumed by callers and by retry policies.
///
/// Created once per failed operation and never mutated afterwards.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{}: {}", .kind.title(), .message)]
pub struct NormalizedError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub status_code: Option<u16>,
}

impl NormalizedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
            status_code: None,
        }
    }

    pub fn title(&self) -> &'static str {
        self.kind.title()
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "The request was cancelled.", false)
    }

    /// True when the server rejected the bearer credential
    pub fn is_unauthorized(&self) -> bool {
        self.status_code == Some(401)
    }
}

impl From<TransportError> for NormalizedError {
    fn from(err: TransportError) -> Self {
        normalize(&err)
    }
}

impl From<serde_json::Error> for NormalizedError {
    fn from(err: serde_json::Error) -> Self {
        normalize(&TransportError::from(err))
    }
}

/// Default message for a status code when the server did not supply one
fn default_status_message(status: u16) -> &'static str {
    match status {
        400 => "The request was invalid.",
        401 => "Your session has expired. Please sign in again.",
        403 => "You do not have permission to perform this action.",
        404 => "The requested resource was not found.",
        408 => "The server timed out waiting for the request.",
        409 => "This change conflicts with existing data.",
        422 => "Some of the submitted data is invalid.",
        429 => "Too many requests. Please wait a moment and try again.",
        500..=599 => "Something went wrong on our side. Please try again later.",
        _ => "The request could not be completed.",
    }
}

/// Pull a server-supplied message out of an error body, if any
fn server_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["message", "error"]
        .iter()
        .filter_map(|field| value.get(field).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|m| !m.is_empty())
        .map(str::to_string)
}

/// Convert any raw failure into a `NormalizedError`.
///
/// Total and pure. This is the single source of truth for retryability.
pub fn normalize(err: &TransportError) -> NormalizedError {
    match err {
        TransportError::Timeout => NormalizedError::new(
            ErrorKind::RequestTimeout,
            "The request took too long. Check your connection and try again.",
            true,
        ),
        TransportError::Status { status, body } => {
            let status = *status;
            let message =
                server_message(body).unwrap_or_else(|| default_status_message(status).to_string());
            NormalizedError {
                kind: ErrorKind::from_status(status),
                message,
                retryable: status >= 500 || status == 408 || status == 429,
                status_code: Some(status),
            }
        }
        TransportError::NoResponse(_) => NormalizedError::new(
            ErrorKind::ConnectionError,
            "Unable to reach the server. Check your internet connection.",
            true,
        ),
        TransportError::Other(message) if !message.trim().is_empty() => {
            NormalizedError::new(ErrorKind::Error, message.clone(), false)
        }
        TransportError::Other(_) | TransportError::Unknown => NormalizedError::new(
            ErrorKind::UnexpectedError,
            "An unexpected error occurred. Please try again.",
            true,
        ),
    }
}
