//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via CSFMT_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default host working-set budget in MiB.
pub const DEFAULT_MEMORY_BUDGET_MB: u64 = 512;

/// Default initialize timeout in milliseconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// Default per-request timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 8_000;

/// Default restart attempts per call.
pub const DEFAULT_RESTART_ATTEMPTS: u32 = 2;

/// Slack added to the caller's blocking wait on top of the request and
/// handshake timeouts.
pub const CALLER_WAIT_SLACK_MS: u64 = 1_000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, String),
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Explicit path to the host executable/library.
    pub host_path: Option<PathBuf>,
    /// Directory holding verified host binaries and their manifest.
    pub host_cache: Option<PathBuf>,
    /// Host working-set budget in MiB (also exported to the spawned host).
    pub memory_budget_mb: u64,
    /// Initialize timeout in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Max restart attempts per call (min 1).
    pub restart_attempts: u32,
    /// Client log floor: `debug|info|warn|error`.
    pub log_level: String,
    /// Append-only JSONL telemetry sink.
    pub telemetry_file: Option<PathBuf>,
    /// Propagate errors instead of falling back to identity output.
    pub strict: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host_path: None,
            host_cache: None,
            memory_budget_mb: DEFAULT_MEMORY_BUDGET_MB,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            restart_attempts: DEFAULT_RESTART_ATTEMPTS,
            log_level: "warn".to_string(),
            telemetry_file: None,
            strict: false,
        }
    }
}

impl ClientConfig {
    /// Loads configuration from file (if `CSFMT_CONFIG` is set), then applies
    /// environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("CSFMT_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("CSFMT_HOST_PATH") {
            self.host_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("CSFMT_HOST_CACHE") {
            self.host_cache = Some(PathBuf::from(path));
        }
        if let Some(mb) = env_u64("CSFMT_HOST_MEMORY_BUDGET_MB") {
            self.memory_budget_mb = mb;
        }
        if let Some(ms) = env_u64("CSFMT_HANDSHAKE_TIMEOUT_MS") {
            self.handshake_timeout_ms = ms;
        }
        if let Some(ms) = env_u64("CSFMT_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = ms;
        }
        if let Some(n) = env_u64("CSFMT_HOST_RETRIES") {
            self.restart_attempts = (n as u32).max(1);
        }
        if let Ok(level) = std::env::var("CSFMT_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(path) = std::env::var("CSFMT_TELEMETRY_FILE") {
            self.telemetry_file = Some(PathBuf::from(path));
        }
        if let Ok(flag) = std::env::var("CSFMT_STRICT_HOST") {
            self.strict = flag == "1";
        }
    }

    /// The initialize timeout.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// The per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Bound on the caller's blocking wait for one delivery:
    /// request timeout + handshake timeout + 1 s slack.
    pub fn caller_wait_timeout(&self) -> Duration {
        Duration::from_millis(
            self.request_timeout_ms + self.handshake_timeout_ms + CALLER_WAIT_SLACK_MS,
        )
    }

    /// Restart attempts, floored at 1.
    pub fn attempts(&self) -> u32 {
        self.restart_attempts.max(1)
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
