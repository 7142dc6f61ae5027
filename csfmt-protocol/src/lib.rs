//! # csfmt-protocol
//!
//! Wire protocol implementation for the csfmt formatter bridge.
//!
//! This crate provides:
//! - `Content-Length` framing over byte streams with partial-read tolerance
//! - JSON envelope serialization/deserialization
//! - Per-command request/response/notification payload types
//! - Error codes and protocol constants

pub mod codec;
pub mod envelope;
pub mod error;

pub use codec::{Decoder, Encoder};
pub use envelope::{
    classify_body, Command, DecodeFailure, Diagnostic, EndOfLine, Envelope, ErrorNotification,
    ErrorSeverity, FormatMetrics, FormatOptions, FormatParams, FormatResult, HostCapabilities,
    InitializeOptions, InitializeParams, InitializeResult, LogLevel, LogNotification, MessageKind,
    PingParams, PingResult, Severity, ShutdownParams, ShutdownResult, TextRange,
};
pub use error::{ErrorCode, ProtocolError};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame body size (64 MiB).
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
