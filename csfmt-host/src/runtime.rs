//! The host event loop.
//!
//! Reads frames from its input stream, dispatches request envelopes, writes
//! the response plus any notifications, and terminates on end-of-input,
//! shutdown, or a fatal error. The loop is generic over its streams so tests
//! drive it over in-process duplex pipes.

use crate::config::HostConfig;
use crate::error::HostError;
use crate::formatter::Formatter;
use crate::handler::{CommandHandler, HostAction};
use csfmt_protocol::{
    classify_body, Command, DecodeFailure, Decoder, Encoder, Envelope, ErrorCode,
    ErrorNotification, ErrorSeverity, MessageKind,
};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Exit code for a clean shutdown (shutdown command or end-of-input).
pub const EXIT_CLEAN: i32 = 0;

/// Exit code when the memory guard trips and reclaim does not help.
pub const EXIT_MEMORY_GUARD: i32 = 86;

/// Exit code for unrecoverable runtime failures.
pub const EXIT_FATAL: i32 = 1;

/// Host lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostState {
    Created,
    Reading,
    Dispatching,
    Draining,
    Terminated,
}

/// The host runtime: one frame loop over a pair of streams.
pub struct HostRuntime {
    handler: CommandHandler,
    state: HostState,
}

impl HostRuntime {
    /// Creates a runtime with the given configuration and format engine.
    pub fn new(config: HostConfig, formatter: Box<dyn Formatter>) -> Self {
        Self {
            handler: CommandHandler::new(config, formatter),
            state: HostState::Created,
        }
    }

    /// Runs the frame loop until termination, returning the process exit
    /// code. `Err` is only returned when the output stream itself fails.
    pub async fn run<R, W>(&mut self, mut reader: R, mut writer: W) -> Result<i32, HostError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut decoder = Decoder::new();
        let mut buf = [0u8; 8192];
        self.state = HostState::Reading;
        tracing::debug!("host loop started");

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(error = %e, "read from input stream failed");
                    let notification = fatal_notification(
                        ErrorCode::ReadFailed,
                        &format!("failed to read from input stream: {e}"),
                    );
                    let _ = write_envelope(&mut writer, &notification).await;
                    let _ = writer.flush().await;
                    self.state = HostState::Terminated;
                    return Ok(EXIT_FATAL);
                }
            };

            if n == 0 {
                tracing::info!("end of input, terminating");
                let _ = writer.flush().await;
                self.state = HostState::Terminated;
                return Ok(EXIT_CLEAN);
            }
            decoder.extend(&buf[..n]);

            // Drain every complete frame the read produced.
            loop {
                let body = match decoder.decode_frame() {
                    Ok(Some(body)) => body,
                    Ok(None) => break,
                    Err(e) => {
                        // Framing errors poison the stream; resync is not
                        // possible past the reported terminator.
                        tracing::error!(error = %e, "invalid frame headers");
                        let notification =
                            fatal_notification(ErrorCode::InvalidHeaders, &e.to_string());
                        let _ = write_envelope(&mut writer, &notification).await;
                        let _ = writer.flush().await;
                        self.state = HostState::Terminated;
                        return Ok(EXIT_FATAL);
                    }
                };

                let envelope = match classify_body(&body) {
                    Ok(envelope) => envelope,
                    Err(failure) => {
                        self.report_decode_failure(&mut writer, &failure).await?;
                        continue;
                    }
                };

                if envelope.kind != MessageKind::Request {
                    tracing::warn!(kind = ?envelope.kind, "dropping non-request message");
                    let reply = per_request_error(
                        envelope.request_id.as_deref(),
                        envelope.command,
                        ErrorCode::InvalidMessage,
                        "only request messages are accepted",
                    );
                    write_envelope(&mut writer, &reply).await?;
                    writer.flush().await?;
                    continue;
                }

                tracing::debug!(
                    command = ?envelope.command,
                    request_id = envelope.request_id.as_deref(),
                    "dispatching request"
                );
                self.state = HostState::Dispatching;
                let dispatch = self.handler.handle(&envelope);
                self.state = HostState::Reading;

                write_envelope(&mut writer, &dispatch.reply).await?;
                for notification in &dispatch.notifications {
                    write_envelope(&mut writer, notification).await?;
                }
                writer.flush().await?;

                match dispatch.action {
                    HostAction::Continue => {}
                    HostAction::Drain => {
                        tracing::info!("shutdown acknowledged, draining");
                        self.state = HostState::Draining;
                        writer.flush().await?;
                        self.state = HostState::Terminated;
                        return Ok(EXIT_CLEAN);
                    }
                    HostAction::Exit(code) => {
                        writer.flush().await?;
                        self.state = HostState::Terminated;
                        return Ok(code);
                    }
                }
            }
        }
    }

    /// Reports a per-request decode failure: an error response when the
    /// request id was recoverable, an error notification otherwise.
    async fn report_decode_failure<W>(
        &mut self,
        writer: &mut W,
        failure: &DecodeFailure,
    ) -> Result<(), HostError>
    where
        W: AsyncWrite + Unpin,
    {
        let code = failure.error_code();
        let message = match failure {
            DecodeFailure::InvalidJson => "frame body is not valid JSON".to_string(),
            DecodeFailure::InvalidMessage { reason, .. } => reason.clone(),
            DecodeFailure::UnknownCommand { command, .. } => {
                format!("unknown command: {command}")
            }
        };
        tracing::warn!(code = %code, message = %message, "rejecting frame");

        let envelope = match failure.request_id() {
            Some(id) => per_request_error(Some(id), Command::Error, code, &message),
            None => Envelope::notification(
                Command::Error,
                serde_json::to_value(ErrorNotification {
                    severity: ErrorSeverity::Recoverable,
                    error_code: Some(code),
                    message,
                    details: None,
                })
                .unwrap_or(serde_json::Value::Null),
            ),
        };
        write_envelope(writer, &envelope).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Builds an error response for a request that could not be dispatched.
fn per_request_error(
    request_id: Option<&str>,
    command: Command,
    code: ErrorCode,
    message: &str,
) -> Envelope {
    match request_id {
        Some(id) => Envelope::response(
            id,
            command,
            json!({"ok": false, "errorCode": code, "message": message}),
        ),
        None => Envelope::notification(
            Command::Error,
            json!({"severity": "recoverable", "errorCode": code, "message": message}),
        ),
    }
}

/// Builds a fatal error notification.
fn fatal_notification(code: ErrorCode, message: &str) -> Envelope {
    Envelope::notification(
        Command::Error,
        json!({"severity": "fatal", "errorCode": code, "message": message}),
    )
}

async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), HostError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = Encoder::encode(envelope)?;
    writer.write_all(&encoded).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::TextFormatter;
    use csfmt_protocol::{FormatResult, InitializeResult, PingResult, ShutdownResult};
    use serde_json::json;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    fn spawn_host(
        budget_mb: u64,
    ) -> (DuplexStream, tokio::task::JoinHandle<Result<i32, HostError>>) {
        let (client_side, host_side) = duplex(256 * 1024);
        let (host_rx, host_tx) = tokio::io::split(host_side);
        let handle = tokio::spawn(async move {
            let config = HostConfig {
                memory_budget_mb: budget_mb,
                ..Default::default()
            };
            let mut runtime = HostRuntime::new(config, Box::new(TextFormatter::new()));
            runtime.run(host_rx, host_tx).await
        });
        (client_side, handle)
    }

    async fn send(stream: &mut DuplexStream, envelope: &Envelope) {
        let encoded = Encoder::encode(envelope).unwrap();
        stream.write_all(&encoded).await.unwrap();
    }

    async fn recv(stream: &mut DuplexStream, decoder: &mut Decoder) -> Envelope {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(body) = decoder.decode_frame().unwrap() {
                return classify_body(&body).unwrap();
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "host closed the stream unexpectedly");
            decoder.extend(&buf[..n]);
        }
    }

    fn initialize_request(id: &str) -> Envelope {
        Envelope::request(
            id,
            Command::Initialize,
            json!({"clientVersion": "1.0.0", "platform": "linux-x64", "options": {}}),
        )
    }

    #[tokio::test]
    async fn test_full_session_initialize_format_shutdown() {
        let (mut client, handle) = spawn_host(1 << 20);
        let mut decoder = Decoder::new();

        send(&mut client, &initialize_request("1")).await;
        let reply = recv(&mut client, &mut decoder).await;
        assert_eq!(reply.request_id.as_deref(), Some("1"));
        let init: InitializeResult = reply.parse_payload().unwrap();
        assert!(init.ok);

        // initialize completed log notification follows the response
        let log = recv(&mut client, &mut decoder).await;
        assert_eq!(log.kind, MessageKind::Notification);
        assert_eq!(log.command, Command::Log);

        send(
            &mut client,
            &Envelope::request(
                "2",
                Command::Format,
                json!({
                    "content": "class Foo {   \n}",
                    "options": {"printWidth": 80, "tabWidth": 4, "useTabs": false, "endOfLine": "lf"},
                    "sessionId": "s-1",
                }),
            ),
        )
        .await;
        let reply = recv(&mut client, &mut decoder).await;
        assert_eq!(reply.request_id.as_deref(), Some("2"));
        let format: FormatResult = reply.parse_payload().unwrap();
        assert!(format.ok);
        assert_eq!(format.formatted.as_deref(), Some("class Foo {\n}\n"));
        let completion = recv(&mut client, &mut decoder).await;
        assert_eq!(completion.command, Command::Log);

        send(
            &mut client,
            &Envelope::request("3", Command::Shutdown, json!({})),
        )
        .await;
        let reply = recv(&mut client, &mut decoder).await;
        let shutdown: ShutdownResult = reply.parse_payload().unwrap();
        assert!(shutdown.ok);

        assert_eq!(handle.await.unwrap().unwrap(), EXIT_CLEAN);
    }

    #[tokio::test]
    async fn test_end_of_input_terminates_cleanly() {
        let (client, handle) = spawn_host(1 << 20);
        drop(client);
        assert_eq!(handle.await.unwrap().unwrap(), EXIT_CLEAN);
    }

    #[tokio::test]
    async fn test_invalid_json_is_recoverable() {
        let (mut client, handle) = spawn_host(1 << 20);
        let mut decoder = Decoder::new();

        let garbage = b"{this is not json";
        client
            .write_all(format!("Content-Length: {}\r\n\r\n", garbage.len()).as_bytes())
            .await
            .unwrap();
        client.write_all(garbage).await.unwrap();

        let notification = recv(&mut client, &mut decoder).await;
        assert_eq!(notification.kind, MessageKind::Notification);
        assert_eq!(notification.command, Command::Error);
        let payload: ErrorNotification = notification.parse_payload().unwrap();
        assert_eq!(payload.error_code, Some(ErrorCode::InvalidJson));
        assert_eq!(payload.severity, ErrorSeverity::Recoverable);

        // The host keeps serving afterwards.
        send(&mut client, &initialize_request("1")).await;
        let reply = recv(&mut client, &mut decoder).await;
        let init: InitializeResult = reply.parse_payload().unwrap();
        assert!(init.ok);

        drop(client);
        assert_eq!(handle.await.unwrap().unwrap(), EXIT_CLEAN);
    }

    #[tokio::test]
    async fn test_unknown_command_answered_with_request_id() {
        let (mut client, handle) = spawn_host(1 << 20);
        let mut decoder = Decoder::new();

        let body = serde_json::to_vec(&json!({
            "version": 1,
            "type": "request",
            "requestId": "x-1",
            "command": "transmogrify",
            "payload": {}
        }))
        .unwrap();
        client
            .write_all(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes())
            .await
            .unwrap();
        client.write_all(&body).await.unwrap();

        let reply = recv(&mut client, &mut decoder).await;
        assert_eq!(reply.kind, MessageKind::Response);
        assert_eq!(reply.request_id.as_deref(), Some("x-1"));
        assert_eq!(reply.payload["errorCode"], json!("UNKNOWN_COMMAND"));

        drop(client);
        assert_eq!(handle.await.unwrap().unwrap(), EXIT_CLEAN);
    }

    #[tokio::test]
    async fn test_invalid_headers_are_fatal() {
        let (mut client, handle) = spawn_host(1 << 20);
        let mut decoder = Decoder::new();

        client
            .write_all(b"Content-Length: twelve\r\n\r\n")
            .await
            .unwrap();

        let notification = recv(&mut client, &mut decoder).await;
        let payload: ErrorNotification = notification.parse_payload().unwrap();
        assert_eq!(payload.severity, ErrorSeverity::Fatal);
        assert_eq!(payload.error_code, Some(ErrorCode::InvalidHeaders));

        assert_eq!(handle.await.unwrap().unwrap(), EXIT_FATAL);
    }

    #[tokio::test]
    async fn test_ping_over_the_wire() {
        let (mut client, handle) = spawn_host(1 << 20);
        let mut decoder = Decoder::new();

        send(&mut client, &initialize_request("1")).await;
        recv(&mut client, &mut decoder).await;
        recv(&mut client, &mut decoder).await;

        send(
            &mut client,
            &Envelope::request("2", Command::Ping, json!({"timestamp": 42})),
        )
        .await;
        let reply = recv(&mut client, &mut decoder).await;
        let ping: PingResult = reply.parse_payload().unwrap();
        assert!(ping.ok);
        assert_eq!(ping.timestamp, 42);
        assert_eq!(ping.active_requests, 0);

        drop(client);
        assert_eq!(handle.await.unwrap().unwrap(), EXIT_CLEAN);
    }

    #[tokio::test]
    async fn test_memory_guard_over_the_wire() {
        if crate::memory::working_set_mb().is_none() {
            return;
        }

        let (mut client, handle) = spawn_host(0);
        let mut decoder = Decoder::new();

        send(&mut client, &initialize_request("1")).await;
        recv(&mut client, &mut decoder).await;
        recv(&mut client, &mut decoder).await;

        send(
            &mut client,
            &Envelope::request(
                "2",
                Command::Format,
                json!({
                    "content": "class C { }",
                    "options": {"printWidth": 80, "tabWidth": 4, "useTabs": false, "endOfLine": "lf"},
                    "sessionId": "s-1",
                }),
            ),
        )
        .await;

        let reply = recv(&mut client, &mut decoder).await;
        let result: FormatResult = reply.parse_payload().unwrap();
        assert!(!result.ok);
        assert_eq!(result.error_code, Some(ErrorCode::MemoryBudgetExceeded));

        let notification = recv(&mut client, &mut decoder).await;
        let payload: ErrorNotification = notification.parse_payload().unwrap();
        assert_eq!(payload.severity, ErrorSeverity::Fatal);

        assert_eq!(handle.await.unwrap().unwrap(), EXIT_MEMORY_GUARD);
    }
}
