//! Host binary resolution and launch command construction.
//!
//! Resolution order: explicit override → manifest entry inside the cache
//! directory → conventional build-output locations. Managed (`.dll`)
//! artefacts are launched through the `dotnet` runtime; native binaries run
//! directly.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::manifest::{self, Manifest, MANIFEST_FILE};
use std::path::{Path, PathBuf};

/// How to start the host process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLaunch {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments preceding the host's own (there are none today).
    pub args: Vec<String>,
}

impl HostLaunch {
    /// A launch that runs `program` directly with no arguments.
    pub fn direct(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// The launch command for an artefact path, routing `.dll` files through
    /// the dotnet runtime.
    pub fn for_artifact(path: &Path) -> Self {
        let is_dll = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"));
        if is_dll {
            Self {
                program: PathBuf::from("dotnet"),
                args: vec![path.to_string_lossy().into_owned()],
            }
        } else {
            Self::direct(path)
        }
    }
}

/// Resolves the host binary for this platform.
pub fn resolve_host(config: &ClientConfig) -> Result<HostLaunch, ClientError> {
    let mut tried = Vec::new();

    // 1. Explicit override: authoritative, never falls through.
    if let Some(path) = &config.host_path {
        if is_launchable(path) {
            tracing::debug!(path = %path.display(), "host resolved from explicit override");
            return Ok(HostLaunch::for_artifact(path));
        }
        return Err(ClientError::Resolution(format!(
            "configured host path {} does not exist or is not executable",
            path.display()
        )));
    }

    // 2. Manifest inside the cache directory.
    if let Some(cache) = &config.host_cache {
        match resolve_from_manifest(cache, &mut tried) {
            Ok(Some(launch)) => return Ok(launch),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "host manifest unusable, trying build outputs"),
        }
    }

    // 3. Conventional build outputs next to this executable and in target/.
    for candidate in build_output_candidates() {
        if is_launchable(&candidate) {
            tracing::debug!(path = %candidate.display(), "host resolved from build output");
            return Ok(HostLaunch::for_artifact(&candidate));
        }
        tried.push(candidate);
    }

    Err(ClientError::Resolution(format!(
        "no host binary found; tried: {}",
        tried
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

fn resolve_from_manifest(
    cache: &Path,
    tried: &mut Vec<PathBuf>,
) -> Result<Option<HostLaunch>, ClientError> {
    let manifest_path = cache.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        tried.push(manifest_path);
        return Ok(None);
    }

    let manifest = Manifest::load(&manifest_path).map_err(|e| {
        ClientError::Resolution(format!("manifest {} is unreadable: {e}", manifest_path.display()))
    })?;

    let Some(key) = manifest::platform_key() else {
        return Err(ClientError::Resolution(format!(
            "unsupported platform {}-{}",
            std::env::consts::OS,
            std::env::consts::ARCH
        )));
    };

    let Some(entry) = manifest.entry_for(key) else {
        tracing::warn!(platform = key, "manifest has no binary for this platform");
        return Ok(None);
    };

    let path = cache.join(&entry.path);
    if is_launchable(&path) {
        tracing::debug!(path = %path.display(), "host resolved from manifest");
        return Ok(Some(HostLaunch::for_artifact(&path)));
    }

    // The binary is listed but absent on disk. Without a download source the
    // host stays unavailable; the pipeline owns fetching either way.
    if entry.url.is_none() {
        tracing::warn!(
            path = %path.display(),
            "manifest entry has no binary on disk and no url; host unavailable from cache"
        );
    } else {
        tracing::warn!(
            path = %path.display(),
            "manifest entry has no binary on disk; run the binary fetch step"
        );
    }
    tried.push(path);
    Ok(None)
}

/// Conventional locations for a freshly built host.
fn build_output_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    let exe_name = host_executable_name();

    if let Ok(current) = std::env::current_exe() {
        if let Some(dir) = current.parent() {
            candidates.push(dir.join(exe_name));
        }
    }
    candidates.push(PathBuf::from("target/debug").join(exe_name));
    candidates.push(PathBuf::from("target/release").join(exe_name));
    candidates
}

fn host_executable_name() -> &'static str {
    if cfg!(windows) {
        "csfmt.exe"
    } else {
        "csfmt"
    }
}

/// A candidate is usable when it exists and is executable.
fn is_launchable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    // Managed artefacts are data files run through dotnet.
    if path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
    {
        return true;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
