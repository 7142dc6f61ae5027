//! Append-only JSONL telemetry.

use chrono::{DateTime, Utc};
use csfmt_protocol::{ErrorCode, FormatMetrics, FormatOptions, TextRange};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;

/// One telemetry line, written per format call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    pub diagnostics: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub options: FormatOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<TextRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub managed_memory_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_set_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_set_delta_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub memory_budget_mb: u64,
}

impl TelemetryRecord {
    /// A success record from a delivered result.
    pub fn success(
        options: &FormatOptions,
        range: Option<TextRange>,
        diagnostics: usize,
        metrics: Option<&FormatMetrics>,
        memory_budget_mb: u64,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            success: true,
            elapsed_ms: metrics.map(|m| m.elapsed_ms),
            diagnostics,
            error: None,
            options: options.clone(),
            range,
            managed_memory_mb: metrics.and_then(|m| m.managed_memory_mb),
            working_set_mb: metrics.and_then(|m| m.working_set_mb),
            working_set_delta_mb: metrics.and_then(|m| m.working_set_delta_mb),
            error_code: None,
            memory_budget_mb,
        }
    }

    /// A failure record.
    pub fn failure(
        options: &FormatOptions,
        range: Option<TextRange>,
        error: String,
        error_code: Option<ErrorCode>,
        memory_budget_mb: u64,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            success: false,
            elapsed_ms: None,
            diagnostics: 0,
            error: Some(error),
            options: options.clone(),
            range,
            managed_memory_mb: None,
            working_set_mb: None,
            working_set_delta_mb: None,
            error_code,
            memory_budget_mb,
        }
    }
}

/// Appends JSONL records to the configured sink. A missing sink makes every
/// write a no-op.
pub struct TelemetrySink {
    path: Option<PathBuf>,
    write_failed: bool,
}

impl TelemetrySink {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            write_failed: false,
        }
    }

    /// Appends one record. Sink failures are logged once and then ignored;
    /// telemetry never breaks formatting.
    pub fn record(&mut self, record: &TelemetryRecord) {
        let Some(path) = &self.path else {
            return;
        };

        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| {
                let mut line = serde_json::to_vec(record).unwrap_or_default();
                line.push(b'\n');
                file.write_all(&line)
            });

        if let Err(e) = result {
            if !self.write_failed {
                tracing::warn!(path = %path.display(), error = %e, "telemetry sink write failed");
                self.write_failed = true;
            }
        }
    }
}
