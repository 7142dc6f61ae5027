//! Host binary manifest.
//!
//! The manifest is produced by the binary distribution pipeline and consumed
//! here to locate the platform's host binary inside the cache directory.
//! Verification and downloading are the pipeline's concern, not the client's.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Manifest file name inside the host cache directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// One platform's binary entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the cache directory.
    pub path: String,
    pub sha256: String,
    pub size: u64,
    /// Download source; absent when the pipeline has not published one.
    #[serde(default)]
    pub url: Option<String>,
}

/// The binary manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub binaries: HashMap<String, ManifestEntry>,
}

impl Manifest {
    /// Loads a manifest from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// The entry for a canonical platform key (`linux-x64`, `osx-arm64`, …).
    pub fn entry_for(&self, platform_key: &str) -> Option<&ManifestEntry> {
        self.binaries.get(platform_key)
    }
}

/// The canonical platform key for the running process.
pub fn platform_key() -> Option<&'static str> {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("linux", "x86_64") => Some("linux-x64"),
        ("linux", "aarch64") => Some("linux-arm64"),
        ("macos", "x86_64") => Some("osx-x64"),
        ("macos", "aarch64") => Some("osx-arm64"),
        ("windows", "x86_64") => Some("win-x64"),
        _ => None,
    }
}
