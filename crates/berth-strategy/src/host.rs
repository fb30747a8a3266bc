//! Host capacity detection and resource-limit validation.

use berth_core::ResourceLimits;

use crate::error::{StrategyError, StrategyResult};

/// Share of host memory a single deployment may request.
pub const MAX_MEMORY_SHARE: f64 = 0.8;

/// Host resource capacity used to validate requested limits.
#[derive(Debug, Clone, Copy)]
pub struct HostCapacity {
    pub memory_bytes: u64,
    pub cpu_cores: u32,
}

impl HostCapacity {
    /// Detect capacity from `/proc/meminfo` and the online core count.
    pub fn detect() -> Self {
        let memory_bytes = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|content| parse_meminfo(&content))
            .unwrap_or(0);
        Self {
            memory_bytes,
            cpu_cores: num_cpus::get() as u32,
        }
    }

    /// Reject requests for more than 80% of host memory or more CPU
    /// shares than the host has cores.
    pub fn validate(&self, resources: &ResourceLimits) -> StrategyResult<()> {
        let ceiling = self.memory_bytes as f64 * MAX_MEMORY_SHARE;
        if self.memory_bytes > 0 && resources.memory_bytes as f64 > ceiling {
            return Err(StrategyError::Configuration(format!(
                "requested memory {} exceeds 80% of host memory {}",
                resources.memory_bytes, self.memory_bytes
            )));
        }
        if self.cpu_cores > 0 && resources.cpu_shares > self.cpu_cores as f64 {
            return Err(StrategyError::Configuration(format!(
                "requested {} cpu shares exceeds {} host cores",
                resources.cpu_shares, self.cpu_cores
            )));
        }
        Ok(())
    }
}

/// Extract `MemTotal` (in bytes) from `/proc/meminfo` contents.
fn parse_meminfo(content: &str) -> Option<u64> {
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capacity() -> HostCapacity {
        HostCapacity {
            memory_bytes: 8 * 1024 * 1024 * 1024, // 8G
            cpu_cores: 4,
        }
    }

    fn request(memory_bytes: u64, cpu_shares: f64) -> ResourceLimits {
        ResourceLimits {
            memory_bytes,
            cpu_shares,
            storage_bytes: 1024 * 1024 * 1024,
        }
    }

    #[test]
    fn accepts_half_of_host_memory() {
        let half = 4 * 1024 * 1024 * 1024;
        assert!(capacity().validate(&request(half, 1.0)).is_ok());
    }

    #[test]
    fn rejects_more_than_eighty_percent_of_host_memory() {
        let too_much = 7 * 1024 * 1024 * 1024; // 7G of 8G
        let err = capacity().validate(&request(too_much, 1.0)).unwrap_err();
        assert!(matches!(err, StrategyError::Configuration(_)));
    }

    #[test]
    fn accepts_exactly_eighty_percent() {
        let exactly = (8u64 * 1024 * 1024 * 1024) * 8 / 10;
        assert!(capacity().validate(&request(exactly, 1.0)).is_ok());
    }

    #[test]
    fn rejects_more_cpu_shares_than_cores() {
        let err = capacity()
            .validate(&request(1024 * 1024, 4.5))
            .unwrap_err();
        assert!(matches!(err, StrategyError::Configuration(_)));
    }

    #[test]
    fn unknown_capacity_skips_checks() {
        let unknown = HostCapacity {
            memory_bytes: 0,
            cpu_cores: 0,
        };
        assert!(unknown.validate(&request(u64::MAX, 128.0)).is_ok());
    }

    #[test]
    fn parse_meminfo_extracts_total() {
        let content = "MemTotal:       16384000 kB\nMemFree:         1024000 kB\n";
        assert_eq!(parse_meminfo(content), Some(16384000 * 1024));
    }

    #[test]
    fn parse_meminfo_handles_missing_field() {
        assert_eq!(parse_meminfo("MemFree: 1 kB\n"), None);
    }
}
