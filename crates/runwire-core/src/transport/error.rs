//! Transport error types.

use std::sync::Arc;

use serde::Deserialize;

/// Errors surfaced by the authenticated channel.
///
/// Cloneable so a single bootstrap outcome can be handed to every caller
/// awaiting it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Connection, TLS, or body read failure.
    #[error("request failed: {0}")]
    Request(Arc<reqwest::Error>),

    /// The request did not complete within its timeout.
    #[error("request timed out: {0}")]
    Timeout(Arc<reqwest::Error>),

    /// Non-success status on a call whose caller needs a success body.
    #[error("HTTP {status}: {message}")]
    Status {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// The backend kept rejecting the CSRF token (code E2002).
    #[error("CSRF token rejected after {attempts} attempt(s): {message}")]
    CsrfRejected { attempts: u32, message: String },

    /// HTTP 403 that is not a CSRF rejection.
    #[error("forbidden: {message}")]
    Forbidden {
        code: Option<String>,
        message: String,
    },

    /// Response body did not match the expected shape.
    #[error("invalid response: {0}")]
    Decode(String),

    /// Configured base URL or token could not be used to build a request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(Arc::new(err))
        } else if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Request(Arc::new(err))
        }
    }
}

impl TransportError {
    /// Builds a status error, extracting `{error: {code, message}}` when present.
    pub fn from_status(status: u16, body: &str) -> Self {
        match ApiError::parse(body) {
            Some(api) => TransportError::Status {
                status,
                code: api.code,
                message: api.message,
            },
            None => TransportError::Status {
                status,
                code: None,
                message: if body.trim().is_empty() {
                    format!("HTTP {status}")
                } else {
                    body.trim().to_string()
                },
            },
        }
    }

    /// Stable error code used when this error is recorded on a run.
    pub fn code(&self) -> String {
        match self {
            TransportError::Request(_) => "E_NETWORK".to_string(),
            TransportError::Timeout(_) => "E_TIMEOUT".to_string(),
            TransportError::Status { status, code, .. } => {
                code.clone().unwrap_or_else(|| format!("E_HTTP_{status}"))
            }
            TransportError::CsrfRejected { .. } => super::CSRF_REJECTED_CODE.to_string(),
            TransportError::Forbidden { code, .. } => {
                code.clone().unwrap_or_else(|| "E_FORBIDDEN".to_string())
            }
            TransportError::Decode(_) => "E_DECODE".to_string(),
            TransportError::InvalidRequest(_) => "E_INVALID_REQUEST".to_string(),
        }
    }
}

/// Structured error body returned by the backend: `{ "error": { "code", "message" } }`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: ApiError,
}

impl ApiError {
    pub fn parse(body: &str) -> Option<Self> {
        serde_json::from_str::<ApiErrorEnvelope>(body)
            .ok()
            .map(|envelope| envelope.error)
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}
