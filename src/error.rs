//! Crate-wide error kinds and their HTTP mapping.
//!
//! Transient failures (transport, timeout) are retried per backoff policy;
//! validation and permanent failures are surfaced immediately; overflow is
//! counted, never raised per-event to the caller.

use axum::http::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad input shape. Never retried.
    #[error("validation: {0}")]
    Validation(String),

    /// Unknown id (stream, session, pipeline, client).
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient network failure; retried per backoff, degrades after N
    /// consecutive occurrences.
    #[error("transport: {0}")]
    Transport(String),

    /// Deadline exceeded. Retryable by default.
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// Buffer or queue full. Recorded as a drop counter.
    #[error("overflow: {0}")]
    Overflow(String),

    /// Signaled by the producer (e.g. authentication refused). Never retried.
    #[error("permanent: {0}")]
    Permanent(String),

    /// Sample arrived with a capture timestamp behind the configured slack.
    #[error("out of order: capture {capture_ts_us} behind newest {newest_ts_us}")]
    OutOfOrder { capture_ts_us: u64, newest_ts_us: u64 },

    /// Synchronization requested with no registered streams.
    #[error("no streams registered")]
    NoStreams,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Error::Permanent(msg.into())
    }

    /// Whether the orchestrator/transport layer should retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) | Error::OutOfOrder { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound(_) | Error::NoStreams => StatusCode::NOT_FOUND,
            Error::Permanent(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Transport(_) | Error::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Overflow(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Validation(format!("json: {e}"))
    }
}
