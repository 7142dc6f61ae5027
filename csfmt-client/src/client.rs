//! The caller-visible client.
//!
//! `FormatClient` supervises one host at a time: it normalises options and
//! ranges before sending, retries across host restarts on transport
//! failures, records telemetry for every outcome, and degrades to identity
//! output unless strict mode is set.

use crate::buffer::{Delivery, ResponseBuffer};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::options::{normalize_range, FormatSettings};
use crate::spawn::{resolve_host, HostLaunch};
use crate::telemetry::{TelemetryRecord, TelemetrySink};
use crate::worker::{Worker, WorkerRequest};
use csfmt_protocol::{
    ErrorCode, FormatMetrics, FormatOptions, FormatParams, PingParams, PingResult, Severity,
    TextRange,
};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::oneshot;

/// Consecutive near-budget responses before the pressure warning fires.
const PRESSURE_STREAK_THRESHOLD: u32 = 3;

/// Budget fraction considered "near budget".
const PRESSURE_FACTOR: f64 = 0.85;

/// Memory-guard errors before the telemetry-review warning fires.
const GUARD_HIT_THRESHOLD: u32 = 3;

/// Client request counters.
#[derive(Debug, Default)]
struct ClientStats {
    requests_total: AtomicU64,
    failures_total: AtomicU64,
    restarts_total: AtomicU64,
}

/// A point-in-time copy of the client counters.
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub requests_total: u64,
    pub failures_total: u64,
    pub restarts_total: u64,
}

/// Supervises one formatting host on behalf of the caller.
pub struct FormatClient {
    config: ClientConfig,
    launch_override: Option<HostLaunch>,
    worker: Option<Worker>,
    telemetry: TelemetrySink,
    stats: ClientStats,
    fallback_warned: bool,
    pressure_streak: u32,
    pressure_warned: bool,
    guard_hits: u32,
    guard_warned: bool,
}

impl FormatClient {
    /// Creates a client with the given configuration.
    pub fn new(config: ClientConfig) -> Self {
        let telemetry = TelemetrySink::new(config.telemetry_file.clone());
        Self {
            config,
            launch_override: None,
            worker: None,
            telemetry,
            stats: ClientStats::default(),
            fallback_warned: false,
            pressure_streak: 0,
            pressure_warned: false,
            guard_hits: 0,
            guard_warned: false,
        }
    }

    /// Creates a client configured from environment variables only.
    pub fn from_env() -> Self {
        Self::new(ClientConfig::from_env())
    }

    /// Creates a client that launches the host with an explicit command
    /// instead of resolving a binary.
    pub fn with_launch(config: ClientConfig, launch: HostLaunch) -> Self {
        let mut client = Self::new(config);
        client.launch_override = Some(launch);
        client
    }

    /// The active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current counter values.
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_total: self.stats.requests_total.load(Ordering::Relaxed),
            failures_total: self.stats.failures_total.load(Ordering::Relaxed),
            restarts_total: self.stats.restarts_total.load(Ordering::Relaxed),
        }
    }

    /// Formats `text`, optionally restricted to a byte range.
    ///
    /// Transport failures are retried across host restarts up to the
    /// configured attempt count. After exhaustion the original text is
    /// returned unchanged unless strict mode is set.
    pub fn format(
        &mut self,
        text: &str,
        settings: &FormatSettings,
        range: Option<Range<usize>>,
    ) -> Result<String, ClientError> {
        let options = settings.normalize();
        let wire_range = normalize_range(
            text,
            range.map(|r| (r.start as i64, r.end as i64)),
        );

        self.stats.requests_total.fetch_add(1, Ordering::Relaxed);
        let mut last_error = None;

        for attempt in 1..=self.config.attempts() {
            match self.attempt_format(text, &options, wire_range) {
                Ok(Delivery::Ok {
                    formatted,
                    diagnostics,
                    metrics,
                }) => {
                    self.observe_memory(metrics.as_ref());
                    surface_diagnostics(&diagnostics);
                    self.telemetry.record(&TelemetryRecord::success(
                        &options,
                        wire_range,
                        diagnostics.len(),
                        metrics.as_ref(),
                        self.config.memory_budget_mb,
                    ));
                    return Ok(formatted);
                }
                Ok(Delivery::Error {
                    message,
                    error_code,
                }) => {
                    let message =
                        message.unwrap_or_else(|| "host reported an error".to_string());
                    match error_code {
                        Some(code) => {
                            // The host answered; retrying the same request
                            // will not change its mind.
                            if code == ErrorCode::MemoryBudgetExceeded {
                                self.note_guard_hit();
                                self.restart_worker();
                            }
                            last_error = Some(ClientError::HostReported { code, message });
                            break;
                        }
                        None => {
                            tracing::debug!(attempt, message = %message, "transport failure, restarting host");
                            last_error = Some(ClientError::Transport { message });
                            self.restart_worker();
                        }
                    }
                }
                Err(e) if e.is_transport_failure() => {
                    tracing::debug!(attempt, error = %e, "transport failure, restarting host");
                    last_error = Some(e);
                    self.restart_worker();
                }
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            }
        }

        let error = last_error.unwrap_or(ClientError::WorkerUnavailable);
        self.fail(text, &options, wire_range, error)
    }

    /// Pings the host, spawning it if necessary.
    pub fn ping(&mut self) -> Result<PingResult, ClientError> {
        let worker = self.ensure_worker()?;
        let (tx, rx) = oneshot::channel();
        worker.post(WorkerRequest::Ping {
            params: PingParams::default(),
            reply: tx,
        })?;
        rx.blocking_recv()
            .map_err(|_| ClientError::WorkerUnavailable)?
    }

    /// Shuts the host down. The next call spawns a fresh one.
    pub fn dispose(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.dispose();
        }
    }

    fn attempt_format(
        &mut self,
        text: &str,
        options: &FormatOptions,
        range: Option<TextRange>,
    ) -> Result<Delivery, ClientError> {
        let wait_timeout = self.config.caller_wait_timeout();
        let worker = self.ensure_worker()?;

        let buffer = Arc::new(ResponseBuffer::for_source(text));
        let params = FormatParams {
            file_path: None,
            content: text.to_string(),
            range,
            options: options.clone(),
            session_id: worker.session_id().to_string(),
            trace_token: None,
        };
        worker.post(WorkerRequest::Format {
            params,
            buffer: buffer.clone(),
        })?;

        let Some((_, bytes)) = buffer.wait(wait_timeout) else {
            return Err(ClientError::RequestTimeout {
                timeout: wait_timeout,
            });
        };
        ResponseBuffer::parse(&bytes).map_err(|e| ClientError::Transport {
            message: format!("unreadable delivery from worker: {e}"),
        })
    }

    fn ensure_worker(&mut self) -> Result<&Worker, ClientError> {
        if self.worker.is_none() {
            let launch = match &self.launch_override {
                Some(launch) => launch.clone(),
                None => resolve_host(&self.config)?,
            };
            self.worker = Some(Worker::spawn(self.config.clone(), launch)?);
        }
        match &self.worker {
            Some(worker) => Ok(worker),
            None => Err(ClientError::WorkerUnavailable),
        }
    }

    fn restart_worker(&mut self) {
        self.stats.restarts_total.fetch_add(1, Ordering::Relaxed);
        self.dispose();
    }

    /// Terminal failure: telemetry, strict-mode propagation, or identity
    /// fallback with one warning per client instance.
    fn fail(
        &mut self,
        text: &str,
        options: &FormatOptions,
        range: Option<TextRange>,
        error: ClientError,
    ) -> Result<String, ClientError> {
        self.stats.failures_total.fetch_add(1, Ordering::Relaxed);

        let error_code = match &error {
            ClientError::HostReported { code, .. } => Some(*code),
            _ => None,
        };
        self.telemetry.record(&TelemetryRecord::failure(
            options,
            range,
            error.to_string(),
            error_code,
            self.config.memory_budget_mb,
        ));

        if self.config.strict {
            return Err(error);
        }

        if !self.fallback_warned {
            tracing::warn!(
                error = %error,
                "formatting host unavailable, returning input unchanged (further failures are silent)"
            );
            self.fallback_warned = true;
        }
        Ok(text.to_string())
    }

    /// Advisory memory-pressure heuristic over successful responses.
    fn observe_memory(&mut self, metrics: Option<&FormatMetrics>) {
        let Some(working_set_mb) = metrics.and_then(|m| m.working_set_mb) else {
            return;
        };
        let threshold = self.config.memory_budget_mb as f64 * PRESSURE_FACTOR;
        if working_set_mb >= threshold {
            self.pressure_streak += 1;
            if self.pressure_streak >= PRESSURE_STREAK_THRESHOLD && !self.pressure_warned {
                tracing::warn!(
                    working_set_mb,
                    budget_mb = self.config.memory_budget_mb,
                    "host working set is consistently near its budget; consider raising CSFMT_HOST_MEMORY_BUDGET_MB"
                );
                self.pressure_warned = true;
            }
        } else {
            self.pressure_streak = 0;
        }
    }

    fn note_guard_hit(&mut self) {
        self.guard_hits += 1;
        if self.guard_hits >= GUARD_HIT_THRESHOLD && !self.guard_warned {
            tracing::warn!(
                hits = self.guard_hits,
                "memory budget exceeded repeatedly; review the telemetry sink for offending inputs"
            );
            self.guard_warned = true;
        }
    }
}

impl Drop for FormatClient {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn surface_diagnostics(diagnostics: &[csfmt_protocol::Diagnostic]) {
    for diagnostic in diagnostics {
        match diagnostic.severity {
            Severity::Info => tracing::info!(
                start = diagnostic.start,
                end = diagnostic.end,
                "{}",
                diagnostic.message
            ),
            Severity::Warning => tracing::warn!(
                start = diagnostic.start,
                end = diagnostic.end,
                "{}",
                diagnostic.message
            ),
            Severity::Error => tracing::error!(
                start = diagnostic.start,
                end = diagnostic.end,
                "{}",
                diagnostic.message
            ),
        }
    }
}

// ============================================================================
// Default client
// ============================================================================

static DEFAULT_CLIENT: OnceLock<Mutex<FormatClient>> = OnceLock::new();

fn default_client() -> &'static Mutex<FormatClient> {
    DEFAULT_CLIENT.get_or_init(|| {
        let config = ClientConfig::load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "config file unusable, using environment only");
            ClientConfig::from_env()
        });
        Mutex::new(FormatClient::new(config))
    })
}

/// Formats through the process-wide default client.
pub fn format(
    text: &str,
    settings: &FormatSettings,
    range: Option<Range<usize>>,
) -> Result<String, ClientError> {
    default_client()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .format(text, settings, range)
}

/// Pings through the process-wide default client.
pub fn ping() -> Result<PingResult, ClientError> {
    default_client()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .ping()
}

#[cfg(test)]
mod heuristics_tests {
    use super::*;

    fn metrics(working_set_mb: f64) -> FormatMetrics {
        FormatMetrics {
            elapsed_ms: 1,
            parse_diagnostics: 0,
            managed_memory_mb: None,
            working_set_mb: Some(working_set_mb),
            working_set_delta_mb: Some(0.0),
        }
    }

    #[test]
    fn test_pressure_warning_after_three_consecutive_hits() {
        let mut client = FormatClient::new(ClientConfig::default());
        let near = 512.0 * PRESSURE_FACTOR + 1.0;

        client.observe_memory(Some(&metrics(near)));
        client.observe_memory(Some(&metrics(near)));
        assert!(!client.pressure_warned);
        client.observe_memory(Some(&metrics(near)));
        assert!(client.pressure_warned);
    }

    #[test]
    fn test_pressure_streak_resets_below_threshold() {
        let mut client = FormatClient::new(ClientConfig::default());
        let near = 512.0 * PRESSURE_FACTOR + 1.0;

        client.observe_memory(Some(&metrics(near)));
        client.observe_memory(Some(&metrics(10.0)));
        client.observe_memory(Some(&metrics(near)));
        client.observe_memory(Some(&metrics(near)));
        assert!(!client.pressure_warned);
    }

    #[test]
    fn test_guard_warning_after_three_hits() {
        let mut client = FormatClient::new(ClientConfig::default());
        client.note_guard_hit();
        client.note_guard_hit();
        assert!(!client.guard_warned);
        client.note_guard_hit();
        assert!(client.guard_warned);
    }
}
