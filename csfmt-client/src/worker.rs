//! The host worker.
//!
//! A dedicated OS thread runs a current-thread tokio runtime that owns the
//! host child process: it spawns lazily on the first request, performs the
//! `initialize` handshake exactly once, serialises requests, demultiplexes
//! responses by request id, forwards notifications, and hands results to the
//! caller through the per-call shared buffer. Blocking child I/O never
//! touches the caller's thread.

use crate::buffer::{Delivery, ResponseBuffer};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::manifest;
use crate::spawn::HostLaunch;
use csfmt_protocol::{
    classify_body, Command, Decoder, Encoder, Envelope, ErrorNotification, ErrorSeverity,
    FormatParams, FormatResult, InitializeOptions, InitializeParams, InitializeResult, LogLevel,
    LogNotification, MessageKind, PingParams, PingResult, ShutdownParams,
};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command as HostCommand};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

/// Bounded wait for the child to exit after a shutdown request or a kill.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Requests posted from the caller's thread to the worker.
pub(crate) enum WorkerRequest {
    Format {
        params: FormatParams,
        buffer: Arc<ResponseBuffer>,
    },
    Ping {
        params: PingParams,
        reply: oneshot::Sender<Result<PingResult, ClientError>>,
    },
}

/// Handle to the worker thread. Dropping it closes the channel; the worker
/// then shuts the host down (best-effort) and exits.
pub(crate) struct Worker {
    tx: Option<mpsc::UnboundedSender<WorkerRequest>>,
    thread: Option<std::thread::JoinHandle<()>>,
    session_id: String,
}

impl Worker {
    /// Spawns the worker thread. The host child itself is spawned lazily on
    /// the first posted request.
    pub fn spawn(config: ClientConfig, launch: HostLaunch) -> Result<Self, ClientError> {
        let session_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let task_session = session_id.clone();
        let thread = std::thread::Builder::new()
            .name("csfmt-host-worker".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to build worker runtime");
                        return;
                    }
                };
                runtime.block_on(worker_task(config, launch, task_session, rx));
            })?;

        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
            session_id,
        })
    }

    /// The session id stamped on every request of this worker's host.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Posts a request to the worker.
    pub fn post(&self, request: WorkerRequest) -> Result<(), ClientError> {
        self.tx
            .as_ref()
            .and_then(|tx| tx.send(request).ok())
            .ok_or(ClientError::WorkerUnavailable)
    }

    /// Closes the channel and waits for the worker to finish its bounded
    /// shutdown sequence.
    pub fn dispose(mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("host worker thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Closing the channel is enough; the thread finishes on its own.
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Why the serve loop ended.
enum ServeEnd {
    /// The handle was dropped; shut the host down.
    Disposed,
    /// The child is unusable (exit, fatal notification, poisoned stream).
    ChildLost,
}

async fn worker_task(
    config: ClientConfig,
    launch: HostLaunch,
    session_id: String,
    mut rx: mpsc::UnboundedReceiver<WorkerRequest>,
) {
    // Lazy spawn: nothing starts until the first request arrives.
    let Some(first) = rx.recv().await else {
        return;
    };

    let mut session = match HostSession::start(&config, &launch, session_id).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(error = %e, "host failed to start");
            reject(first, &format!("host failed to start: {e}"));
            reject_until_disposed(&mut rx, "host failed to start").await;
            return;
        }
    };

    match session.serve(first, &mut rx).await {
        ServeEnd::Disposed => session.shutdown().await,
        ServeEnd::ChildLost => {
            reject_until_disposed(&mut rx, "host is no longer available").await;
        }
    }
}

/// Rejects every further request until the handle is dropped.
async fn reject_until_disposed(rx: &mut mpsc::UnboundedReceiver<WorkerRequest>, message: &str) {
    while let Some(request) = rx.recv().await {
        reject(request, message);
    }
}

fn reject(request: WorkerRequest, message: &str) {
    match request {
        WorkerRequest::Format { buffer, .. } => buffer.publish_delivery(&Delivery::Error {
            message: Some(message.to_string()),
            error_code: None,
        }),
        WorkerRequest::Ping { reply, .. } => {
            let _ = reply.send(Err(ClientError::Transport {
                message: message.to_string(),
            }));
        }
    }
}

/// What a pending entry resolves into.
enum PendingReply {
    Format(Arc<ResponseBuffer>),
    Ping(oneshot::Sender<Result<PingResult, ClientError>>),
}

struct Pending {
    command: Command,
    deadline: Instant,
    reply: PendingReply,
}

impl Pending {
    fn fail(self, message: &str) {
        match self.reply {
            PendingReply::Format(buffer) => buffer.publish_delivery(&Delivery::Error {
                message: Some(message.to_string()),
                error_code: None,
            }),
            PendingReply::Ping(reply) => {
                let _ = reply.send(Err(ClientError::Transport {
                    message: message.to_string(),
                }));
            }
        }
    }
}

/// One live host child plus its dispatch state.
struct HostSession {
    config: ClientConfig,
    session_id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    stderr: Lines<BufReader<ChildStderr>>,
    stderr_open: bool,
    decoder: Decoder,
    pending: HashMap<String, Pending>,
    next_id: u64,
}

impl HostSession {
    /// Spawns the child and performs the `initialize` handshake.
    async fn start(
        config: &ClientConfig,
        launch: &HostLaunch,
        session_id: String,
    ) -> Result<Self, ClientError> {
        tracing::debug!(program = %launch.program.display(), session_id = %session_id, "spawning host");

        let mut child = HostCommand::new(&launch.program)
            .args(&launch.args)
            .env(
                "CSFMT_HOST_MEMORY_BUDGET_MB",
                config.memory_budget_mb.to_string(),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| ClientError::Transport {
            message: "host stdin was not piped".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ClientError::Transport {
            message: "host stdout was not piped".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ClientError::Transport {
            message: "host stderr was not piped".to_string(),
        })?;

        let mut session = Self {
            config: config.clone(),
            session_id,
            child,
            stdin: Some(stdin),
            stdout,
            stderr: BufReader::new(stderr).lines(),
            stderr_open: true,
            decoder: Decoder::new(),
            pending: HashMap::new(),
            next_id: 1,
        };
        session.handshake().await?;
        Ok(session)
    }

    /// Performs `initialize` exactly once, forwarding any notifications that
    /// arrive before the response.
    async fn handshake(&mut self) -> Result<(), ClientError> {
        let id = self.fresh_id();
        let params = InitializeParams {
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            host_binary_version: None,
            platform: manifest::platform_key().unwrap_or("unknown").to_string(),
            options: InitializeOptions::default(),
        };
        let envelope = Envelope::request(
            &id,
            Command::Initialize,
            serde_json::to_value(&params)?,
        );
        self.write_frame(&envelope).await?;

        let timeout = self.config.handshake_timeout();
        let result = tokio::time::timeout(timeout, self.read_initialize_response(&id)).await;
        match result {
            Ok(Ok(init)) if init.ok => {
                tracing::debug!(
                    host_version = init.host_version.as_deref(),
                    "handshake complete"
                );
                Ok(())
            }
            Ok(Ok(init)) => Err(ClientError::Transport {
                message: format!(
                    "host declined initialize: {}",
                    init.reason.unwrap_or_else(|| "no reason given".to_string())
                ),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::HandshakeTimeout { timeout }),
        }
    }

    async fn read_initialize_response(&mut self, id: &str) -> Result<InitializeResult, ClientError> {
        let mut buf = [0u8; 8192];
        loop {
            while let Some(body) = self.decoder.decode_frame()? {
                let envelope = classify_body(&body).map_err(|failure| ClientError::Transport {
                    message: format!("unreadable frame during handshake: {failure:?}"),
                })?;
                match envelope.kind {
                    MessageKind::Response if envelope.request_id.as_deref() == Some(id) => {
                        return Ok(envelope.parse_payload()?);
                    }
                    MessageKind::Notification => self.forward_notification(&envelope),
                    _ => {
                        tracing::debug!(kind = ?envelope.kind, "ignoring message during handshake")
                    }
                }
            }

            let n = self.stdout.read(&mut buf).await?;
            if n == 0 {
                let description = self.exit_description().await;
                return Err(ClientError::Transport {
                    message: format!("host exited during handshake ({description})"),
                });
            }
            self.decoder.extend(&buf[..n]);
        }
    }

    /// Serves requests until disposal or child loss.
    async fn serve(
        &mut self,
        first: WorkerRequest,
        rx: &mut mpsc::UnboundedReceiver<WorkerRequest>,
    ) -> ServeEnd {
        enum Event {
            Posted(Option<WorkerRequest>),
            Stdout(std::io::Result<usize>),
            Stderr(Option<String>),
            Deadline,
        }

        // Frames buffered behind the initialize response are handled first.
        if !self.ingest(&[]).await {
            reject(first, "host is no longer available");
            return ServeEnd::ChildLost;
        }
        if !self.submit(first).await {
            return ServeEnd::ChildLost;
        }

        let mut buf = [0u8; 8192];
        loop {
            let has_pending = !self.pending.is_empty();
            let deadline = self.earliest_deadline();
            let stderr_open = self.stderr_open;

            let event = tokio::select! {
                biased;
                posted = rx.recv() => Event::Posted(posted),
                result = self.stdout.read(&mut buf) => Event::Stdout(result),
                line = self.stderr.next_line(), if stderr_open => {
                    Event::Stderr(line.ok().flatten())
                }
                _ = tokio::time::sleep_until(deadline), if has_pending => Event::Deadline,
            };

            match event {
                Event::Posted(Some(request)) => {
                    if !self.submit(request).await {
                        return ServeEnd::ChildLost;
                    }
                }
                Event::Posted(None) => return ServeEnd::Disposed,
                Event::Stdout(Ok(0)) | Event::Stdout(Err(_)) => {
                    // Exit wins: anything still buffered is never delivered.
                    let description = self.exit_description().await;
                    tracing::warn!(%description, "host exited");
                    self.fail_all(&format!("host exited before responding ({description})"));
                    return ServeEnd::ChildLost;
                }
                Event::Stdout(Ok(n)) => {
                    if !self.ingest(&buf[..n]).await {
                        return ServeEnd::ChildLost;
                    }
                }
                Event::Stderr(Some(line)) => {
                    tracing::debug!(target: "csfmt::host_stderr", "{line}");
                }
                Event::Stderr(None) => {
                    self.stderr_open = false;
                }
                Event::Deadline => {
                    self.expire_requests().await;
                    return ServeEnd::ChildLost;
                }
            }
        }
    }

    /// Writes a posted request to the host. Returns `false` when the child is
    /// lost.
    async fn submit(&mut self, request: WorkerRequest) -> bool {
        let id = self.fresh_id();
        let deadline = Instant::now() + self.config.request_timeout();

        let (envelope, pending) = match request {
            WorkerRequest::Format { mut params, buffer } => {
                params.session_id = self.session_id.clone();
                let payload = match serde_json::to_value(&params) {
                    Ok(payload) => payload,
                    Err(e) => {
                        buffer.publish_delivery(&Delivery::Error {
                            message: Some(format!("failed to serialize request: {e}")),
                            error_code: None,
                        });
                        return true;
                    }
                };
                (
                    Envelope::request(&id, Command::Format, payload),
                    Pending {
                        command: Command::Format,
                        deadline,
                        reply: PendingReply::Format(buffer),
                    },
                )
            }
            WorkerRequest::Ping { params, reply } => {
                let payload = serde_json::to_value(&params).unwrap_or(serde_json::Value::Null);
                (
                    Envelope::request(&id, Command::Ping, payload),
                    Pending {
                        command: Command::Ping,
                        deadline,
                        reply: PendingReply::Ping(reply),
                    },
                )
            }
        };

        self.pending.insert(id.clone(), pending);
        if let Err(e) = self.write_frame(&envelope).await {
            tracing::warn!(error = %e, "failed to write request to host");
            self.kill_child().await;
            self.fail_all(&format!("failed to write to host: {e}"));
            return false;
        }
        true
    }

    /// Feeds received bytes through the decoder and dispatches every complete
    /// frame. Returns `false` when the stream is poisoned.
    async fn ingest(&mut self, bytes: &[u8]) -> bool {
        self.decoder.extend(bytes);
        loop {
            let body = match self.decoder.decode_frame() {
                Ok(Some(body)) => body,
                Ok(None) => return true,
                Err(e) => {
                    tracing::warn!(error = %e, "host stream is unframeable");
                    self.kill_child().await;
                    self.fail_all(&format!("host stream corrupted: {e}"));
                    return false;
                }
            };

            let envelope = match classify_body(&body) {
                Ok(envelope) => envelope,
                Err(failure) => {
                    tracing::warn!(?failure, "host sent an unreadable message");
                    self.kill_child().await;
                    self.fail_all("host sent an unreadable message");
                    return false;
                }
            };

            if !self.dispatch(envelope).await {
                return false;
            }
        }
    }

    /// Routes one inbound envelope. Returns `false` on a fatal notification.
    async fn dispatch(&mut self, envelope: Envelope) -> bool {
        match envelope.kind {
            MessageKind::Response => {
                let id = envelope.request_id.clone().unwrap_or_default();
                match self.pending.remove(&id) {
                    Some(pending) => deliver(pending, &envelope),
                    None => {
                        tracing::debug!(request_id = %id, "dropping response with no pending request");
                    }
                }
                true
            }
            MessageKind::Notification => match envelope.command {
                Command::Log => {
                    self.forward_notification(&envelope);
                    true
                }
                Command::Error => {
                    let note: ErrorNotification = match envelope.parse_payload() {
                        Ok(note) => note,
                        Err(_) => ErrorNotification {
                            severity: ErrorSeverity::Fatal,
                            error_code: None,
                            message: "host sent an unreadable error notification".to_string(),
                            details: None,
                        },
                    };
                    match note.severity {
                        ErrorSeverity::Fatal => {
                            tracing::error!(message = %note.message, "host reported a fatal error");
                            self.kill_child().await;
                            self.fail_all(&note.message);
                            false
                        }
                        ErrorSeverity::Recoverable => {
                            tracing::warn!(message = %note.message, "host reported a recoverable error");
                            true
                        }
                    }
                }
                _ => {
                    tracing::debug!(command = ?envelope.command, "ignoring notification");
                    true
                }
            },
            MessageKind::Request => {
                tracing::warn!("host sent a request; the protocol has none host-to-client");
                true
            }
        }
    }

    /// Forwards a host `log` notification to the local logger at its
    /// declared level.
    fn forward_notification(&self, envelope: &Envelope) {
        if envelope.command != Command::Log {
            return;
        }
        let Ok(log) = envelope.parse_payload::<LogNotification>() else {
            tracing::debug!("dropping unreadable log notification");
            return;
        };
        match log.level {
            LogLevel::Debug => {
                tracing::debug!(target: "csfmt::host", context = ?log.context, "{}", log.message)
            }
            LogLevel::Info => {
                tracing::info!(target: "csfmt::host", context = ?log.context, "{}", log.message)
            }
            LogLevel::Warn => {
                tracing::warn!(target: "csfmt::host", context = ?log.context, "{}", log.message)
            }
            LogLevel::Error => {
                tracing::error!(target: "csfmt::host", context = ?log.context, "{}", log.message)
            }
        }
    }

    /// Rejects every pending request whose deadline has passed, then tears
    /// the child down: a mid-format host is considered poisoned.
    async fn expire_requests(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                tracing::warn!(request_id = %id, command = ?pending.command, "request timed out");
                pending.fail(&format!(
                    "request timed out after {} ms",
                    self.config.request_timeout_ms
                ));
            }
        }

        self.kill_child().await;
        self.fail_all("host torn down after a request timeout");
    }

    fn fail_all(&mut self, message: &str) {
        for (_, pending) in self.pending.drain() {
            pending.fail(message);
        }
    }

    async fn write_frame(&mut self, envelope: &Envelope) -> Result<(), ClientError> {
        let encoded = Encoder::encode(envelope)?;
        let stdin = self.stdin.as_mut().ok_or(ClientError::WorkerUnavailable)?;
        stdin.write_all(&encoded).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn fresh_id(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        id.to_string()
    }

    fn earliest_deadline(&self) -> Instant {
        self.pending
            .values()
            .map(|p| p.deadline)
            .min()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))
    }

    /// Waits briefly for the exit status and formats `(code, signal)`.
    async fn exit_description(&mut self) -> String {
        match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                let code = status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string());
                let signal = exit_signal(&status)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "none".to_string());
                format!("code {code}, signal {signal}")
            }
            Ok(Err(e)) => format!("wait failed: {e}"),
            Err(_) => "exit status unavailable".to_string(),
        }
    }

    async fn kill_child(&mut self) {
        self.stdin.take();
        if self.child.start_kill().is_ok() {
            let _ = tokio::time::timeout(EXIT_GRACE, self.child.wait()).await;
        }
    }

    /// Best-effort shutdown: post `shutdown`, close stdin, wait a bounded
    /// interval, then force-kill.
    async fn shutdown(mut self) {
        let id = self.fresh_id();
        let envelope = Envelope::request(
            &id,
            Command::Shutdown,
            serde_json::to_value(ShutdownParams {
                reason: Some("client disposed".to_string()),
            })
            .unwrap_or(serde_json::Value::Null),
        );
        let _ = self.write_frame(&envelope).await;
        self.stdin.take();

        match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(?status, "host exited after shutdown"),
            _ => {
                tracing::warn!("host did not exit after shutdown, killing");
                self.kill_child().await;
            }
        }
    }
}

/// Hands a matched response to its pending caller.
fn deliver(pending: Pending, envelope: &Envelope) {
    if envelope.command != pending.command {
        tracing::warn!(
            expected = ?pending.command,
            got = ?envelope.command,
            "response command does not match its request"
        );
    }
    match pending.reply {
        PendingReply::Format(buffer) => {
            let delivery = match envelope.parse_payload::<FormatResult>() {
                Ok(result) if result.ok => Delivery::Ok {
                    formatted: result.formatted.unwrap_or_default(),
                    diagnostics: result.diagnostics,
                    metrics: result.metrics,
                },
                Ok(result) => Delivery::Error {
                    message: result.message,
                    error_code: result.error_code,
                },
                Err(e) => Delivery::Error {
                    message: Some(format!("unreadable format response: {e}")),
                    error_code: None,
                },
            };
            buffer.publish_delivery(&delivery);
        }
        PendingReply::Ping(reply) => {
            let outcome = envelope
                .parse_payload::<PingResult>()
                .map_err(|e| ClientError::Transport {
                    message: format!("unreadable ping response: {e}"),
                });
            let _ = reply.send(outcome);
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
