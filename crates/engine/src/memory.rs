//! Process and system memory probes used by the eviction task.

use profstore_core::{Result, StoreError};

/// Source of memory figures.
pub trait MemoryProbe: Send + Sync {
    /// Total physical memory in bytes
    fn total_memory(&self) -> Result<u64>;

    /// Memory currently used by this process in bytes
    fn used_memory(&self) -> u64;
}

/// Reads memory figures from the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemory;

impl MemoryProbe for SystemMemory {
    #[cfg(target_os = "linux")]
    fn total_memory(&self) -> Result<u64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo")?;
        parse_kb(&meminfo, "MemTotal:")
            .map(|kb| kb * 1024)
            .ok_or_else(|| StoreError::MemoryProbe("MemTotal missing from /proc/meminfo".into()))
    }

    #[cfg(not(target_os = "linux"))]
    fn total_memory(&self) -> Result<u64> {
        Err(StoreError::MemoryProbe(
            "total memory probe is not supported on this platform".into(),
        ))
    }

    fn used_memory(&self) -> u64 {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| parse_kb(&status, "VmRSS:"))
            .map_or(0, |kb| kb * 1024)
    }
}

/// Value of a `Name:   1234 kB` line
fn parse_kb(content: &str, prefix: &str) -> Option<u64> {
    content
        .lines()
        .find(|l| l.starts_with(prefix))
        .and_then(|l| l.split_whitespace().nth(1).and_then(|s| s.parse().ok()))
}
