//! Error taxonomy for the dashboard client.
//!
//! Validation problems are caught before any request is sent, transport
//! problems are transient, rejections carry the backend's own message, and
//! client-side timeouts are kept apart from backend-reported failures.

use thiserror::Error;

/// Message shown when the backend rejects something without saying why.
pub const GENERIC_BACKEND_MESSAGE: &str = "request rejected by backend";

/// A failed call against the dashboard REST API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// Backend unreachable, timed out, or answered with a transient status.
    #[error("transport error: {0}")]
    Transport(String),

    /// Backend answered with an error envelope or a non-success status.
    #[error("{message}")]
    Rejected {
        /// HTTP status, if the rejection came from one.
        status: Option<u16>,
        /// Server-provided message, or a generic one.
        message: String,
    },

    /// Body could not be decoded into the expected shape.
    #[error("unexpected response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },

    /// The selected route family has no endpoint for this operation.
    #[error("{0} is not available on this backend")]
    Unsupported(&'static str),
}

impl ApiError {
    pub fn rejected(status: Option<u16>, message: Option<String>) -> Self {
        let message = message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| GENERIC_BACKEND_MESSAGE.to_string());
        ApiError::Rejected { status, message }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            let endpoint = err
                .url()
                .map(|u| u.path().to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            return ApiError::Decode {
                endpoint,
                reason: err.to_string(),
            };
        }
        ApiError::Transport(err.to_string())
    }
}

/// Unusable scan target, raised before any network call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("Please enter a target")]
    Empty,
}

/// Why a scan session could not be started.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StartError {
    #[error(transparent)]
    Validation(#[from] TargetError),

    #[error("a scan session is already active")]
    AlreadyActive,

    #[error("{0}")]
    Rejected(String),

    #[error("failed to reach backend: {0}")]
    Transport(String),
}

impl From<ApiError> for StartError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Transport(msg) => StartError::Transport(msg),
            ApiError::Rejected { message, .. } => StartError::Rejected(message),
            other => StartError::Rejected(other.to_string()),
        }
    }
}

/// How a monitored session ended when it did not complete.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error(transparent)]
    Start(#[from] StartError),

    #[error("Scan failed: {message}")]
    Failed { message: String },

    #[error("scan was stopped")]
    Stopped,

    #[error("connection lost after {failures} consecutive failed polls: {last_error}")]
    ConnectionLost { failures: u32, last_error: String },

    #[error("Scan timeout: no terminal status after {attempts} polls")]
    TimedOut { attempts: u32 },

    #[error("session abandoned before reaching a terminal state")]
    Abandoned,

    #[error("no scan session has been started")]
    NoSession,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_falls_back_to_generic_message() {
        let err = ApiError::rejected(Some(400), Some("   ".into()));
        assert_eq!(err.to_string(), GENERIC_BACKEND_MESSAGE);
        let err = ApiError::rejected(None, Some("Target required".into()));
        assert_eq!(err.to_string(), "Target required");
    }

    #[test]
    fn start_error_keeps_server_message() {
        let err: StartError = ApiError::rejected(Some(409), Some("Scan already running".into())).into();
        assert_eq!(err, StartError::Rejected("Scan already running".into()));
        let err: StartError = ApiError::Transport("connection refused".into()).into();
        assert!(matches!(err, StartError::Transport(_)));
    }
}
