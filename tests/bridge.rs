//! End-to-end tests: the real host binary driven through the client stack.

use csfmt_client::{smoke, ClientConfig, ClientError, FormatClient, FormatSettings, HostLaunch};
use csfmt_protocol::EndOfLine;
use std::time::Duration;

fn host_launch() -> HostLaunch {
    HostLaunch::direct(env!("CARGO_BIN_EXE_csfmt"))
}

fn bridge_client(config: ClientConfig) -> FormatClient {
    FormatClient::with_launch(config, host_launch())
}

#[test]
fn test_format_trims_and_enforces_trailing_newline() {
    let mut client = bridge_client(ClientConfig::default());
    let out = client
        .format("class Foo {   \n}", &FormatSettings::default(), None)
        .unwrap();
    assert_eq!(out, "class Foo {\n}\n");
}

#[test]
fn test_crlf_conversion_end_to_end() {
    let mut client = bridge_client(ClientConfig::default());
    let settings = FormatSettings {
        end_of_line: Some(EndOfLine::Crlf),
        ..Default::default()
    };
    let out = client.format("a\r\nb\nc", &settings, None).unwrap();
    assert_eq!(out, "a\r\nb\r\nc\r\n");
    assert!(out.ends_with("c\r\n"));
    assert!(!out.ends_with("\r\n\r\n"));
}

#[test]
fn test_range_formatting_preserves_untouched_method() {
    // First method is pristine; second is malformed and sloppily indented.
    let content = "void First()\n{\n    return;\n}\nvoid Second()   \n{\n    return;\n";
    let start = content.find("void Second").unwrap();

    let mut client = bridge_client(ClientConfig::default());
    let out = client
        .format(content, &FormatSettings::default(), Some(start..content.len()))
        .unwrap();

    // The first method survives character for character.
    assert_eq!(&out[..start], &content[..start]);
    // The second method was reformatted.
    assert!(out[start..].starts_with("void Second()\n"));
    assert!(out.ends_with('\n'));
}

#[test]
fn test_ping_uptime_monotonic() {
    let mut client = bridge_client(ClientConfig::default());
    let first = client.ping().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    let second = client.ping().unwrap();

    assert!(first.uptime_ms <= second.uptime_ms);
    assert!(second.uptime_ms - first.uptime_ms >= 40);
}

#[test]
fn test_telemetry_line_written_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let telemetry = dir.path().join("telemetry.jsonl");
    let config = ClientConfig {
        telemetry_file: Some(telemetry.clone()),
        ..Default::default()
    };

    let mut client = bridge_client(config);
    client
        .format("class Foo { }", &FormatSettings::default(), None)
        .unwrap();
    drop(client);

    let content = std::fs::read_to_string(&telemetry).unwrap();
    let line: serde_json::Value = serde_json::from_str(content.lines().last().unwrap()).unwrap();
    assert_eq!(line["success"], serde_json::json!(true));
    assert!(line["elapsedMs"].is_number());
}

#[tokio::test]
async fn test_smoke_test_passes_against_real_host() {
    let report = smoke::run_with_launch(&ClientConfig::default(), &host_launch())
        .await
        .unwrap();
    assert!(report.host_version.is_some());
}

#[cfg(target_os = "linux")]
#[test]
fn test_memory_guard_strict_mode_reports_code() {
    let config = ClientConfig {
        memory_budget_mb: 1,
        strict: true,
        ..Default::default()
    };
    let mut client = bridge_client(config);
    let err = client
        .format("class Foo { }", &FormatSettings::default(), None)
        .unwrap_err();
    match err {
        ClientError::HostReported { code, .. } => {
            assert_eq!(code, csfmt_protocol::ErrorCode::MemoryBudgetExceeded);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_memory_guard_exits_with_code_86() {
    use csfmt_protocol::{classify_body, Command, Decoder, Encoder, Envelope, MessageKind};
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut child = tokio::process::Command::new(env!("CARGO_BIN_EXE_csfmt"))
        .env("CSFMT_HOST_MEMORY_BUDGET_MB", "1")
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap();
    let mut stdin = child.stdin.take().unwrap();
    let mut stdout = child.stdout.take().unwrap();
    let mut decoder = Decoder::new();

    async fn next_envelope(
        stdout: &mut tokio::process::ChildStdout,
        decoder: &mut Decoder,
    ) -> Envelope {
        let mut buf = [0u8; 8192];
        loop {
            if let Some(body) = decoder.decode_frame().unwrap() {
                return classify_body(&body).unwrap();
            }
            let n = stdout.read(&mut buf).await.unwrap();
            assert!(n > 0, "host closed stdout early");
            decoder.extend(&buf[..n]);
        }
    }

    let init = Envelope::request(
        "1",
        Command::Initialize,
        json!({"clientVersion": "0.0.0", "platform": "linux-x64", "options": {}}),
    );
    stdin.write_all(&Encoder::encode(&init).unwrap()).await.unwrap();

    loop {
        let envelope = next_envelope(&mut stdout, &mut decoder).await;
        if envelope.kind == MessageKind::Response && envelope.command == Command::Initialize {
            assert_eq!(envelope.payload["ok"], json!(true));
            break;
        }
    }

    let format = Envelope::request(
        "2",
        Command::Format,
        json!({
            "content": "class Foo { }",
            "options": {"printWidth": 80, "tabWidth": 4, "useTabs": false, "endOfLine": "lf"},
            "sessionId": "s-1",
        }),
    );
    stdin.write_all(&Encoder::encode(&format).unwrap()).await.unwrap();

    let mut saw_error_response = false;
    let mut saw_fatal_notification = false;
    loop {
        let envelope = next_envelope(&mut stdout, &mut decoder).await;
        match envelope.kind {
            MessageKind::Response if envelope.command == Command::Format => {
                assert_eq!(envelope.payload["errorCode"], json!("MEMORY_BUDGET_EXCEEDED"));
                saw_error_response = true;
            }
            MessageKind::Notification if envelope.command == Command::Error => {
                assert_eq!(envelope.payload["severity"], json!("fatal"));
                saw_fatal_notification = true;
            }
            _ => {}
        }
        if saw_error_response && saw_fatal_notification {
            break;
        }
    }

    let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.code(), Some(86));
}
