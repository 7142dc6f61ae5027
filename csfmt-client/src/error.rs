//! Client error types.

use csfmt_protocol::ErrorCode;
use std::time::Duration;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] csfmt_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("host binary resolution failed: {0}")]
    Resolution(String),

    #[error("handshake timed out after {timeout:?}")]
    HandshakeTimeout { timeout: Duration },

    #[error("request timed out after {timeout:?}")]
    RequestTimeout { timeout: Duration },

    #[error("host transport failed: {message}")]
    Transport { message: String },

    #[error("host reported {code}: {message}")]
    HostReported { code: ErrorCode, message: String },

    #[error("host worker is gone")]
    WorkerUnavailable,
}

impl ClientError {
    /// Whether disposing the worker and retrying can plausibly succeed.
    ///
    /// Errors the host itself reported for this request are not retried; the
    /// supervision loop only restarts on transport-level failures.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Protocol(_)
                | ClientError::HandshakeTimeout { .. }
                | ClientError::RequestTimeout { .. }
                | ClientError::Transport { .. }
                | ClientError::WorkerUnavailable
        )
    }
}
