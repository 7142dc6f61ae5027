//! # csfmt-client
//!
//! In-process supervisor for the csfmt formatting host.
//!
//! This crate provides:
//! - A worker thread that owns the host child process and its stdio
//! - Request/response correlation with per-request deadlines
//! - A bounded shared-memory hand-off of results to the calling thread
//! - Option/range normalisation, bounded restarts, and identity fallback
//! - Host binary resolution, JSONL telemetry, and the postinstall smoke test

pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod manifest;
pub mod options;
pub mod smoke;
pub mod spawn;
pub mod telemetry;
mod worker;

pub use buffer::{Delivery, ResponseBuffer};
pub use client::{format, ping, FormatClient, StatsSnapshot};
pub use config::{ClientConfig, ConfigError};
pub use error::ClientError;
pub use options::{normalize_range, FormatSettings};
pub use smoke::SmokeReport;
pub use spawn::{resolve_host, HostLaunch};
pub use telemetry::{TelemetryRecord, TelemetrySink};
