//! csfmt host binary.
//!
//! Reads `Content-Length`-framed requests from standard input and writes
//! responses and notifications to standard output. Standard error carries
//! human-readable diagnostics only; the wire never touches it.

use csfmt_host::{HostConfig, HostRuntime, TextFormatter, EXIT_FATAL};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // stdout is the wire; all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = HostConfig::from_env();
    tracing::info!(
        version = %config.host_version,
        budget_mb = config.memory_budget_mb,
        "starting csfmt host"
    );

    let mut runtime = HostRuntime::new(config, Box::new(TextFormatter::new()));
    let code = match runtime.run(tokio::io::stdin(), tokio::io::stdout()).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "host terminated abnormally");
            EXIT_FATAL
        }
    };

    tracing::info!(code, "host stopped");
    std::process::exit(code);
}
