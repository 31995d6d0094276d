// error.rs - Centralized error handling using thiserror

use serde::{Deserialize, Serialize};

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Whether a transport failure should be retried or parked immediately.
///
/// Distinguished at the error layer (rather than by string-matching status
/// codes downstream) so the orchestrator can branch on `kind` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportErrorKind {
    /// Timeout, 5xx, TLS churn — retry with backoff.
    Transient,
    /// 4xx validation — retries will not help, escalate to failed.
    Permanent,
}

/// Crate-wide error type.
///
/// Uses thiserror for ergonomic `Display`/`std::error::Error` impls. All
/// variants are serializable so a host app can forward them across a
/// process boundary (e.g. to a UI layer) without losing structure.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum Error {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("transport error ({kind:?}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("sync error: {0}")]
    Sync(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() || err.is_connect() {
            TransportErrorKind::Transient
        } else if let Some(status) = err.status() {
            if status.is_server_error() {
                TransportErrorKind::Transient
            } else {
                TransportErrorKind::Permanent
            }
        } else {
            TransportErrorKind::Transient
        };

        Error::Transport {
            kind,
            message: err.to_string(),
        }
    }
}
