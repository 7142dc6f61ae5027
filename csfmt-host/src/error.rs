//! Host error types.

use csfmt_protocol::ErrorCode;
use thiserror::Error;

/// Host errors.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] csfmt_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("formatter error: {0}")]
    Formatter(#[from] crate::formatter::FormatterError),
}

impl HostError {
    /// Converts to the wire error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            HostError::Io(_) => ErrorCode::ReadFailed,
            HostError::Protocol(csfmt_protocol::ProtocolError::Json(_)) => ErrorCode::InvalidJson,
            HostError::Protocol(_) => ErrorCode::InvalidHeaders,
            HostError::Json(_) => ErrorCode::InvalidJson,
            HostError::Formatter(_) => ErrorCode::InternalError,
        }
    }
}
