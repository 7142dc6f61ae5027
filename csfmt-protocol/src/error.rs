//! Protocol error types and wire error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame headers: {reason}")]
    InvalidHeaders { reason: String },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in frame body")]
    InvalidUtf8,
}

/// Stable error codes returned in error responses and notifications.
///
/// These codes are part of the protocol contract and must remain stable
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Framing / envelope errors
    InvalidHeaders,
    InvalidMessage,
    InvalidJson,
    UnknownCommand,

    // Format errors
    MemoryBudgetExceeded,

    // Runtime errors
    ReadFailed,
    InternalError,
}

impl ErrorCode {
    /// Returns whether the host can keep serving after reporting this code.
    ///
    /// Non-recoverable codes terminate the host; `MemoryBudgetExceeded` is
    /// fatal for the request and may terminate the host once the working set
    /// stays above the budget after reclaim.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCode::InvalidMessage | ErrorCode::InvalidJson | ErrorCode::UnknownCommand
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::InvalidHeaders => write!(f, "INVALID_HEADERS"),
            ErrorCode::InvalidMessage => write!(f, "INVALID_MESSAGE"),
            ErrorCode::InvalidJson => write!(f, "INVALID_JSON"),
            ErrorCode::UnknownCommand => write!(f, "UNKNOWN_COMMAND"),
            ErrorCode::MemoryBudgetExceeded => write!(f, "MEMORY_BUDGET_EXCEEDED"),
            ErrorCode::ReadFailed => write!(f, "READ_FAILED"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_recoverable() {
        assert!(ErrorCode::InvalidMessage.is_recoverable());
        assert!(ErrorCode::InvalidJson.is_recoverable());
        assert!(ErrorCode::UnknownCommand.is_recoverable());

        assert!(!ErrorCode::InvalidHeaders.is_recoverable());
        assert!(!ErrorCode::MemoryBudgetExceeded.is_recoverable());
        assert!(!ErrorCode::ReadFailed.is_recoverable());
        assert!(!ErrorCode::InternalError.is_recoverable());
    }

    #[test]
    fn test_error_code_serialization() {
        let code = ErrorCode::MemoryBudgetExceeded;
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, "\"MEMORY_BUDGET_EXCEEDED\"");

        let parsed: ErrorCode = serde_json::from_str("\"UNKNOWN_COMMAND\"").unwrap();
        assert_eq!(parsed, ErrorCode::UnknownCommand);
    }

    #[test]
    fn test_error_code_display_matches_wire_form() {
        for code in [
            ErrorCode::InvalidHeaders,
            ErrorCode::InvalidMessage,
            ErrorCode::InvalidJson,
            ErrorCode::UnknownCommand,
            ErrorCode::MemoryBudgetExceeded,
            ErrorCode::ReadFailed,
            ErrorCode::InternalError,
        ] {
            let wire = serde_json::to_string(&code).unwrap();
            assert_eq!(wire, format!("\"{code}\""));
        }
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::InvalidHeaders {
            reason: "missing Content-Length".to_string(),
        };
        assert!(err.to_string().contains("Content-Length"));

        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));
    }
}
