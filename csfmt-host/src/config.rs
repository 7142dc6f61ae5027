//! Host configuration.
//!
//! The host is configured entirely through environment variables; its caller
//! (the client worker or a human at a shell) sets them before spawning.

/// Default working-set budget in MiB.
pub const DEFAULT_MEMORY_BUDGET_MB: u64 = 512;

/// Fraction of the budget the working set must drop below after reclaim for
/// the host to keep running.
pub const RECLAIM_FLOOR_FACTOR: f64 = 0.9;

/// Host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Working-set budget in MiB.
    pub memory_budget_mb: u64,
    /// Host version string reported during `initialize`.
    pub host_version: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            memory_budget_mb: DEFAULT_MEMORY_BUDGET_MB,
            host_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl HostConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("CSFMT_HOST_MEMORY_BUDGET_MB") {
            match raw.parse::<u64>() {
                Ok(mb) if mb > 0 => config.memory_budget_mb = mb,
                _ => {
                    tracing::warn!(value = %raw, "ignoring invalid CSFMT_HOST_MEMORY_BUDGET_MB");
                }
            }
        }
        config
    }

    /// The working set the host must fall back under after reclaim.
    pub fn reclaim_floor_mb(&self) -> f64 {
        self.memory_budget_mb as f64 * RECLAIM_FLOOR_FACTOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.memory_budget_mb, DEFAULT_MEMORY_BUDGET_MB);
        assert!(!config.host_version.is_empty());
    }

    #[test]
    fn test_reclaim_floor() {
        let config = HostConfig {
            memory_budget_mb: 100,
            ..Default::default()
        };
        assert!((config.reclaim_floor_mb() - 90.0).abs() < f64::EPSILON);
    }
}
