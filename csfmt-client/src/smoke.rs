//! Postinstall smoke test.
//!
//! Speaks the production protocol over a short lifecycle: spawn, one
//! `initialize` with a generous timeout, `shutdown`, bounded wait for a clean
//! exit. Any `error` notification seen before success fails the test.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::spawn::{resolve_host, HostLaunch};
use csfmt_protocol::{
    classify_body, Command, Decoder, Encoder, Envelope, ErrorNotification, InitializeOptions,
    InitializeParams, InitializeResult, MessageKind, ShutdownParams,
};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command as HostCommand;

/// Initialize timeout for the smoke test.
pub const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(8);

/// Bounded wait for the host to exit after shutdown.
pub const EXIT_TIMEOUT: Duration = Duration::from_secs(4);

/// What a passing smoke test observed.
#[derive(Debug)]
pub struct SmokeReport {
    /// Host version from the initialize response.
    pub host_version: Option<String>,
    /// Wall time for the whole spawn–handshake–shutdown cycle.
    pub elapsed: Duration,
}

/// Runs the smoke test against the resolved host binary.
pub async fn run(config: &ClientConfig) -> Result<SmokeReport, ClientError> {
    let launch = resolve_host(config)?;
    run_with_launch(config, &launch).await
}

/// Runs the smoke test against an explicit launch command.
pub async fn run_with_launch(
    config: &ClientConfig,
    launch: &HostLaunch,
) -> Result<SmokeReport, ClientError> {
    let started = Instant::now();

    let mut child = HostCommand::new(&launch.program)
        .args(&launch.args)
        .env(
            "CSFMT_HOST_MEMORY_BUDGET_MB",
            config.memory_budget_mb.to_string(),
        )
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdin = child.stdin.take().ok_or_else(|| ClientError::Transport {
        message: "host stdin was not piped".to_string(),
    })?;
    let mut stdout = child.stdout.take().ok_or_else(|| ClientError::Transport {
        message: "host stdout was not piped".to_string(),
    })?;

    // initialize
    let init = Envelope::request(
        "1",
        Command::Initialize,
        serde_json::to_value(InitializeParams {
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            host_binary_version: None,
            platform: crate::manifest::platform_key().unwrap_or("unknown").to_string(),
            options: InitializeOptions::default(),
        })?,
    );
    stdin.write_all(&Encoder::encode(&init)?).await?;
    stdin.flush().await?;

    let mut decoder = Decoder::new();
    let init_result = tokio::time::timeout(
        INITIALIZE_TIMEOUT,
        read_initialize(&mut stdout, &mut decoder),
    )
    .await
    .map_err(|_| ClientError::HandshakeTimeout {
        timeout: INITIALIZE_TIMEOUT,
    })??;

    if !init_result.ok {
        return Err(ClientError::Transport {
            message: format!(
                "host declined initialize: {}",
                init_result
                    .reason
                    .unwrap_or_else(|| "no reason given".to_string())
            ),
        });
    }

    // shutdown
    let shutdown = Envelope::request(
        "2",
        Command::Shutdown,
        serde_json::to_value(ShutdownParams {
            reason: Some("smoke test".to_string()),
        })?,
    );
    stdin.write_all(&Encoder::encode(&shutdown)?).await?;
    stdin.flush().await?;
    drop(stdin);

    let status = tokio::time::timeout(EXIT_TIMEOUT, child.wait())
        .await
        .map_err(|_| ClientError::Transport {
            message: format!("host did not exit within {EXIT_TIMEOUT:?} after shutdown"),
        })??;

    if !status.success() {
        return Err(ClientError::Transport {
            message: format!("host exited abnormally after shutdown: {status}"),
        });
    }

    Ok(SmokeReport {
        host_version: init_result.host_version,
        elapsed: started.elapsed(),
    })
}

/// Reads frames until the initialize response arrives. Error notifications
/// before success fail the test.
async fn read_initialize(
    stdout: &mut tokio::process::ChildStdout,
    decoder: &mut Decoder,
) -> Result<InitializeResult, ClientError> {
    let mut buf = [0u8; 8192];
    loop {
        while let Some(body) = decoder.decode_frame()? {
            let envelope = classify_body(&body).map_err(|failure| ClientError::Transport {
                message: format!("unreadable frame from host: {failure:?}"),
            })?;
            match (envelope.kind, envelope.command) {
                (MessageKind::Response, Command::Initialize) => {
                    return Ok(envelope.parse_payload()?);
                }
                (MessageKind::Notification, Command::Error) => {
                    let note: ErrorNotification =
                        envelope.parse_payload().unwrap_or(ErrorNotification {
                            severity: csfmt_protocol::ErrorSeverity::Fatal,
                            error_code: None,
                            message: "unreadable error notification".to_string(),
                            details: None,
                        });
                    return Err(ClientError::Transport {
                        message: format!("host reported an error before initialize: {}", note.message),
                    });
                }
                (MessageKind::Notification, _) => {}
                (kind, command) => {
                    tracing::debug!(?kind, ?command, "ignoring message during smoke test");
                }
            }
        }

        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            return Err(ClientError::Transport {
                message: "host exited before answering initialize".to_string(),
            });
        }
        decoder.extend(&buf[..n]);
    }
}
