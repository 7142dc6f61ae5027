//! Working-set sampling for memory budget enforcement.

/// Returns the process resident set size in bytes, if the platform exposes
/// it. Linux reads `VmRSS` from `/proc/self/status`; other platforms report
/// `None` and the memory guard stays inert.
pub fn working_set_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        for line in status.lines() {
            if let Some(rest) = line.trim_start().strip_prefix("VmRSS:") {
                let kb = rest.trim().split_whitespace().next()?.parse::<u64>().ok()?;
                return Some(kb.saturating_mul(1024));
            }
        }
        None
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Returns the working set in MiB.
pub fn working_set_mb() -> Option<f64> {
    working_set_bytes().map(|b| b as f64 / (1024.0 * 1024.0))
}

/// A before/after working-set sample around one format invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySample {
    pub before_mb: Option<f64>,
    pub after_mb: Option<f64>,
}

impl MemorySample {
    /// Samples the working set for the "before" slot.
    pub fn begin() -> Self {
        Self {
            before_mb: working_set_mb(),
            after_mb: None,
        }
    }

    /// Samples the working set for the "after" slot.
    pub fn finish(mut self) -> Self {
        self.after_mb = working_set_mb();
        self
    }

    /// Growth across the invocation, floored at zero.
    pub fn delta_mb(&self) -> Option<f64> {
        match (self.before_mb, self.after_mb) {
            (Some(before), Some(after)) => Some((after - before).max(0.0)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn test_working_set_positive_on_linux() {
        let bytes = working_set_bytes().expect("VmRSS should be readable");
        assert!(bytes > 0);
    }

    #[test]
    fn test_sample_delta_floor() {
        let sample = MemorySample {
            before_mb: Some(100.0),
            after_mb: Some(40.0),
        };
        assert_eq!(sample.delta_mb(), Some(0.0));

        let sample = MemorySample {
            before_mb: Some(40.0),
            after_mb: Some(100.0),
        };
        assert_eq!(sample.delta_mb(), Some(60.0));
    }

    #[test]
    fn test_sample_delta_unavailable() {
        let sample = MemorySample {
            before_mb: None,
            after_mb: Some(10.0),
        };
        assert_eq!(sample.delta_mb(), None);
    }
}
