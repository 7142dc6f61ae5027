//! Command handlers.

use crate::config::HostConfig;
use crate::formatter::Formatter;
use crate::memory::{self, MemorySample};
use chrono::Utc;
use csfmt_protocol::{
    Command, Diagnostic, EndOfLine, Envelope, ErrorCode, ErrorNotification, ErrorSeverity,
    FormatMetrics, FormatOptions, FormatParams, FormatResult, HostCapabilities, InitializeParams,
    InitializeResult, LogLevel, LogNotification, PingParams, PingResult, Severity, ShutdownParams,
    ShutdownResult, TextRange, PROTOCOL_VERSION,
};
use serde_json::{json, Value};
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// What the runtime does after writing a dispatch result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAction {
    /// Keep reading.
    Continue,
    /// Flush and exit cleanly (shutdown acknowledged).
    Drain,
    /// Flush and exit with the given code.
    Exit(i32),
}

/// The result of dispatching one request.
#[derive(Debug)]
pub struct Dispatch {
    /// Response correlated to the request.
    pub reply: Envelope,
    /// Notifications emitted after the response.
    pub notifications: Vec<Envelope>,
    /// Runtime follow-up.
    pub action: HostAction,
}

impl Dispatch {
    fn reply(reply: Envelope) -> Self {
        Self {
            reply,
            notifications: Vec::new(),
            action: HostAction::Continue,
        }
    }
}

/// Command handler: dispatches validated request envelopes.
pub struct CommandHandler {
    config: HostConfig,
    formatter: Box<dyn Formatter>,
    started_at: Instant,
    active_requests: AtomicU32,
    initialized: bool,
}

impl CommandHandler {
    /// Creates a new command handler.
    pub fn new(config: HostConfig, formatter: Box<dyn Formatter>) -> Self {
        Self {
            config,
            formatter,
            started_at: Instant::now(),
            active_requests: AtomicU32::new(0),
            initialized: false,
        }
    }

    /// Handles one request envelope. The caller has already verified
    /// `envelope.kind == MessageKind::Request`.
    pub fn handle(&mut self, envelope: &Envelope) -> Dispatch {
        match envelope.command {
            Command::Initialize => self.handle_initialize(envelope),
            Command::Format => self.handle_format(envelope),
            Command::Ping => self.handle_ping(envelope),
            Command::Shutdown => self.handle_shutdown(envelope),
            // Notification-only commands are not valid requests.
            Command::Log | Command::Error => Dispatch::reply(invalid_message_reply(
                envelope,
                "log and error are host-to-client notifications",
            )),
        }
    }

    fn handle_initialize(&mut self, envelope: &Envelope) -> Dispatch {
        let id = request_id(envelope);

        if envelope.version != PROTOCOL_VERSION {
            let result = InitializeResult {
                ok: false,
                host_version: Some(self.config.host_version.clone()),
                roslyn_language_version: None,
                capabilities: None,
                reason: Some(format!(
                    "unsupported protocol version {} (host speaks {PROTOCOL_VERSION})",
                    envelope.version
                )),
            };
            return Dispatch::reply(response(&id, Command::Initialize, &result));
        }

        if self.initialized {
            return Dispatch::reply(invalid_message_reply(envelope, "host is already initialized"));
        }

        let params: InitializeParams = match envelope.parse_payload() {
            Ok(p) => p,
            Err(e) => return Dispatch::reply(invalid_message_reply(envelope, &e.to_string())),
        };

        self.initialized = true;
        let roslyn_language_version = params
            .options
            .roslyn_language_version
            .clone()
            .unwrap_or_else(|| "latest".to_string());

        let result = InitializeResult {
            ok: true,
            host_version: Some(self.config.host_version.clone()),
            roslyn_language_version: Some(roslyn_language_version),
            capabilities: Some(HostCapabilities {
                supports_range_formatting: true,
                supports_diagnostics: true,
                supports_telemetry: true,
            }),
            reason: None,
        };

        let log = log_notification(
            LogLevel::Info,
            "initialize completed",
            None,
            Some(json!({
                "clientVersion": params.client_version,
                "platform": params.platform,
                "hostVersion": self.config.host_version,
            })),
        );

        Dispatch {
            reply: response(&id, Command::Initialize, &result),
            notifications: vec![log],
            action: HostAction::Continue,
        }
    }

    fn handle_format(&mut self, envelope: &Envelope) -> Dispatch {
        let id = request_id(envelope);

        if !self.initialized {
            return Dispatch::reply(invalid_message_reply(
                envelope,
                "format requires a completed initialize",
            ));
        }

        let params: FormatParams = match envelope.parse_payload() {
            Ok(p) => p,
            Err(e) => return Dispatch::reply(invalid_message_reply(envelope, &e.to_string())),
        };

        self.active_requests.fetch_add(1, Ordering::SeqCst);
        let (result, notifications, action) = self.format_inner(&params);
        self.active_requests.fetch_sub(1, Ordering::SeqCst);

        Dispatch {
            reply: response(&id, Command::Format, &result),
            notifications,
            action,
        }
    }

    fn format_inner(&mut self, params: &FormatParams) -> (FormatResult, Vec<Envelope>, HostAction) {
        let options = clamp_options(&params.options);
        let range = accept_range(&params.content, params.range);

        let sample = MemorySample::begin();
        let started = Instant::now();

        let outcome = match self.formatter.format(&params.content, range, &options) {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = e.to_string();
                let notification = error_notification(
                    ErrorSeverity::Fatal,
                    Some(ErrorCode::InternalError),
                    &message,
                    None,
                );
                return (
                    FormatResult::error(ErrorCode::InternalError, message),
                    vec![notification],
                    HostAction::Exit(crate::runtime::EXIT_FATAL),
                );
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let formatted = apply_line_endings(&outcome.formatted, options.end_of_line);
        let mut diagnostics = outcome.diagnostics;
        let parse_diagnostics = diagnostics.len() as u32;
        diagnostics.extend(todo_diagnostics(&formatted));

        let sample = sample.finish();
        let metrics = FormatMetrics {
            elapsed_ms,
            parse_diagnostics,
            managed_memory_mb: None,
            working_set_mb: sample.after_mb,
            working_set_delta_mb: sample.delta_mb(),
        };

        if let Some(guarded) = self.enforce_memory_budget(&sample) {
            return guarded;
        }

        let log = log_notification(
            LogLevel::Debug,
            "format completed",
            params.trace_token.clone(),
            serde_json::to_value(&metrics).ok(),
        );

        (
            FormatResult::ok(formatted, diagnostics, metrics),
            vec![log],
            HostAction::Continue,
        )
    }

    /// Checks the post-format working set against the budget. Returns the
    /// full error outcome when the guard trips.
    fn enforce_memory_budget(
        &mut self,
        sample: &MemorySample,
    ) -> Option<(FormatResult, Vec<Envelope>, HostAction)> {
        let budget_mb = self.config.memory_budget_mb as f64;
        let working_set_mb = sample.after_mb?;
        if working_set_mb <= budget_mb {
            return None;
        }

        let details = json!({
            "managedMemoryMb": Value::Null,
            "workingSetMb": working_set_mb,
            "workingSetDeltaMb": sample.delta_mb(),
            "budgetMb": self.config.memory_budget_mb,
        });
        let message = format!(
            "working set {working_set_mb:.1} MiB exceeds the {budget_mb:.0} MiB budget"
        );

        let result = FormatResult::error(ErrorCode::MemoryBudgetExceeded, message.clone())
            .with_details(details.clone());
        let notification = error_notification(
            ErrorSeverity::Fatal,
            Some(ErrorCode::MemoryBudgetExceeded),
            &message,
            Some(details),
        );

        self.formatter.reclaim();
        let post_reclaim = memory::working_set_mb();
        let action = match post_reclaim {
            Some(mb) if mb > self.config.reclaim_floor_mb() => {
                tracing::error!(
                    working_set_mb = mb,
                    floor_mb = self.config.reclaim_floor_mb(),
                    "working set still over the reclaim floor, exiting"
                );
                HostAction::Exit(crate::runtime::EXIT_MEMORY_GUARD)
            }
            _ => HostAction::Continue,
        };

        Some((result, vec![notification], action))
    }

    fn handle_ping(&self, envelope: &Envelope) -> Dispatch {
        let id = request_id(envelope);
        let params: PingParams = envelope.parse_payload().unwrap_or_default();

        let result = PingResult {
            ok: true,
            timestamp: params
                .timestamp
                .unwrap_or_else(|| Utc::now().timestamp_millis()),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            active_requests: self.active_requests.load(Ordering::SeqCst),
        };
        Dispatch::reply(response(&id, Command::Ping, &result))
    }

    fn handle_shutdown(&self, envelope: &Envelope) -> Dispatch {
        let id = request_id(envelope);
        let params: ShutdownParams = envelope.parse_payload().unwrap_or_default();
        tracing::info!(reason = params.reason.as_deref(), "shutdown requested");

        Dispatch {
            reply: response(&id, Command::Shutdown, &ShutdownResult { ok: true }),
            notifications: Vec::new(),
            action: HostAction::Drain,
        }
    }
}

// ============================================================================
// Request processing helpers
// ============================================================================

/// Clamps caller options into the ranges the engine supports.
pub fn clamp_options(options: &FormatOptions) -> FormatOptions {
    FormatOptions {
        print_width: options.print_width.clamp(40, 240),
        tab_width: options.tab_width.clamp(1, 16),
        use_tabs: options.use_tabs,
        end_of_line: options.end_of_line,
    }
}

/// Validates a requested range against the content. Invalid ranges fall back
/// to whole-document formatting. Byte offsets must land on UTF-8 character
/// boundaries to be usable.
pub fn accept_range(content: &str, range: Option<TextRange>) -> Option<Range<usize>> {
    let range = range?;
    if range.start < 0 || range.end <= range.start {
        return None;
    }
    let (start, end) = (range.start as usize, range.end as usize);
    if end > content.len() || !content.is_char_boundary(start) || !content.is_char_boundary(end) {
        return None;
    }
    Some(start..end)
}

/// Rewrites every line terminator to `end_of_line` and ensures the text ends
/// with exactly one terminator.
pub fn apply_line_endings(text: &str, end_of_line: EndOfLine) -> String {
    let mut normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    while normalized.ends_with('\n') {
        normalized.pop();
    }
    normalized.push('\n');

    match end_of_line {
        EndOfLine::Lf => normalized,
        EndOfLine::Crlf => normalized.replace('\n', "\r\n"),
    }
}

/// Emits a warning diagnostic for every literal `TODO` in the text.
pub fn todo_diagnostics(text: &str) -> Vec<Diagnostic> {
    text.match_indices("TODO")
        .map(|(at, _)| Diagnostic {
            severity: Severity::Warning,
            message: "TODO comment detected.".to_string(),
            start: Some(at),
            end: Some(at + 4),
        })
        .collect()
}

fn request_id(envelope: &Envelope) -> String {
    envelope.request_id.clone().unwrap_or_default()
}

fn response<T: serde::Serialize>(id: &str, command: Command, payload: &T) -> Envelope {
    Envelope::response(
        id,
        command,
        serde_json::to_value(payload).unwrap_or(Value::Null),
    )
}

fn invalid_message_reply(envelope: &Envelope, reason: &str) -> Envelope {
    response(
        &request_id(envelope),
        envelope.command,
        &FormatResult::error(ErrorCode::InvalidMessage, reason),
    )
}

fn log_notification(
    level: LogLevel,
    message: &str,
    trace_token: Option<String>,
    context: Option<Value>,
) -> Envelope {
    Envelope::notification(
        Command::Log,
        serde_json::to_value(LogNotification {
            level,
            message: message.to_string(),
            trace_token,
            context,
        })
        .unwrap_or(Value::Null),
    )
}

fn error_notification(
    severity: ErrorSeverity,
    error_code: Option<ErrorCode>,
    message: &str,
    details: Option<Value>,
) -> Envelope {
    Envelope::notification(
        Command::Error,
        serde_json::to_value(ErrorNotification {
            severity,
            error_code,
            message: message.to_string(),
            details,
        })
        .unwrap_or(Value::Null),
    )
}
