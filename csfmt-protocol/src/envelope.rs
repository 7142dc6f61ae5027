//! JSON envelope and per-command payload types.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message kind carried in the envelope `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
}

/// Protocol commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Initialize,
    Format,
    Ping,
    Shutdown,
    Log,
    Error,
}

/// Message envelope, the unit of transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version.
    pub version: u32,

    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Correlation id, present on requests and their responses, absent on
    /// notifications.
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Command determining the payload schema.
    pub command: Command,

    /// Command-specific payload.
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Creates a request envelope.
    pub fn request(id: impl Into<String>, command: Command, payload: Value) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            kind: MessageKind::Request,
            request_id: Some(id.into()),
            command,
            payload,
        }
    }

    /// Creates a response envelope correlated to `id`.
    pub fn response(id: impl Into<String>, command: Command, payload: Value) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            kind: MessageKind::Response,
            request_id: Some(id.into()),
            command,
            payload,
        }
    }

    /// Creates a notification envelope.
    pub fn notification(command: Command, payload: Value) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            kind: MessageKind::Notification,
            request_id: None,
            command,
            payload,
        }
    }

    /// Deserializes the payload into a typed value.
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Why an inbound frame body failed to produce a usable envelope.
///
/// Carries the request id when it could be recovered from the raw JSON, so
/// the failure can be answered with an error response instead of an error
/// notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeFailure {
    /// Body is not parseable as JSON.
    InvalidJson,
    /// Envelope is structurally wrong (bad kind, missing fields, id rules
    /// violated).
    InvalidMessage {
        request_id: Option<String>,
        reason: String,
    },
    /// `command` is a string outside the command enum.
    UnknownCommand {
        request_id: Option<String>,
        command: String,
    },
}

impl DecodeFailure {
    /// The wire error code reported for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            DecodeFailure::InvalidJson => ErrorCode::InvalidJson,
            DecodeFailure::InvalidMessage { .. } => ErrorCode::InvalidMessage,
            DecodeFailure::UnknownCommand { .. } => ErrorCode::UnknownCommand,
        }
    }

    /// The request id recovered from the raw body, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            DecodeFailure::InvalidJson => None,
            DecodeFailure::InvalidMessage { request_id, .. }
            | DecodeFailure::UnknownCommand { request_id, .. } => request_id.as_deref(),
        }
    }
}

/// Classifies a frame body into an envelope or a [`DecodeFailure`].
///
/// Unknown commands and structural problems are rejected here, at the
/// boundary, with the request id recovered where possible so the caller can
/// answer with an error response rather than a notification.
pub fn classify_body(body: &[u8]) -> Result<Envelope, DecodeFailure> {
    let value: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => return Err(DecodeFailure::InvalidJson),
    };

    let request_id = value
        .get("requestId")
        .and_then(Value::as_str)
        .map(str::to_owned);

    fn invalid(request_id: &Option<String>, reason: &str) -> DecodeFailure {
        DecodeFailure::InvalidMessage {
            request_id: request_id.clone(),
            reason: reason.to_string(),
        }
    }

    let Some(obj) = value.as_object() else {
        return Err(invalid(&request_id, "envelope is not a JSON object"));
    };

    let Some(version) = obj.get("version").and_then(Value::as_u64) else {
        return Err(invalid(&request_id, "missing or non-integer version"));
    };

    let kind = match obj.get("type").and_then(Value::as_str) {
        Some(s) => match serde_json::from_value::<MessageKind>(Value::String(s.to_string())) {
            Ok(k) => k,
            Err(_) => return Err(invalid(&request_id, "unknown message type")),
        },
        None => return Err(invalid(&request_id, "missing type")),
    };

    let command = match obj.get("command").and_then(Value::as_str) {
        Some(s) => match serde_json::from_value::<Command>(Value::String(s.to_string())) {
            Ok(c) => c,
            Err(_) => {
                return Err(DecodeFailure::UnknownCommand {
                    request_id,
                    command: s.to_string(),
                })
            }
        },
        None => return Err(invalid(&request_id, "missing command")),
    };

    match kind {
        MessageKind::Request | MessageKind::Response if request_id.is_none() => {
            return Err(invalid(
                &request_id,
                "requestId is required for requests and responses",
            ));
        }
        MessageKind::Notification if request_id.is_some() => {
            return Err(invalid(
                &request_id,
                "requestId is not allowed on notifications",
            ));
        }
        _ => {}
    }

    Ok(Envelope {
        version: version as u32,
        kind,
        request_id,
        command,
        payload: obj.get("payload").cloned().unwrap_or(Value::Null),
    })
}

// ============================================================================
// Per-command payload types
// ============================================================================

/// Parameters for `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub client_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_binary_version: Option<String>,
    pub platform: String,
    #[serde(default)]
    pub options: InitializeOptions,
}

/// Language options negotiated during `initialize`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeOptions {
    #[serde(default)]
    pub roslyn_language_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msbuild_sdks_path: Option<String>,
}

/// Feature flags declared by the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostCapabilities {
    pub supports_range_formatting: bool,
    pub supports_diagnostics: bool,
    pub supports_telemetry: bool,
}

/// Result of `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roslyn_language_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<HostCapabilities>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Line ending requested for formatter output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndOfLine {
    #[default]
    Lf,
    Crlf,
}

impl EndOfLine {
    /// The terminator sequence for this line ending.
    pub fn as_str(&self) -> &'static str {
        match self {
            EndOfLine::Lf => "\n",
            EndOfLine::Crlf => "\r\n",
        }
    }
}

/// Formatting options carried on every `format` request.
///
/// The client normalises before sending; the host clamps defensively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatOptions {
    pub print_width: u32,
    pub tab_width: u32,
    pub use_tabs: bool,
    pub end_of_line: EndOfLine,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            print_width: 80,
            tab_width: 4,
            use_tabs: false,
            end_of_line: EndOfLine::Lf,
        }
    }
}

/// Half-open byte range `[start, end)` into the request content.
///
/// Fields are signed so an out-of-range value survives deserialization; the
/// host validates and falls back to whole-document formatting instead of
/// rejecting the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRange {
    pub start: i64,
    pub end: i64,
}

/// Parameters for `format`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<TextRange>,
    pub options: FormatOptions,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_token: Option<String>,
}

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A diagnostic attached to a format response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
}

/// Timing and memory metrics attached to a format response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatMetrics {
    pub elapsed_ms: u64,
    pub parse_diagnostics: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub managed_memory_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_set_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_set_delta_mb: Option<f64>,
}

/// Result of `format`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<FormatMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl FormatResult {
    /// Builds a successful result.
    pub fn ok(formatted: String, diagnostics: Vec<Diagnostic>, metrics: FormatMetrics) -> Self {
        Self {
            ok: true,
            formatted: Some(formatted),
            diagnostics,
            metrics: Some(metrics),
            error_code: None,
            message: None,
            details: None,
        }
    }

    /// Builds a failed result.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            formatted: None,
            diagnostics: Vec::new(),
            metrics: None,
            error_code: Some(code),
            message: Some(message.into()),
            details: None,
        }
    }

    /// Attaches a details object.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Parameters for `ping`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Result of `ping`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResult {
    pub ok: bool,
    pub timestamp: i64,
    pub uptime_ms: u64,
    pub active_requests: u32,
}

/// Parameters for `shutdown`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShutdownParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Result of `shutdown`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownResult {
    pub ok: bool,
}

/// Log level carried on `log` notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Payload of a `log` notification (host → client).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogNotification {
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// Severity of an `error` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Fatal,
    Recoverable,
}

/// Payload of an `error` notification (host → client).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotification {
    pub severity: ErrorSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}
