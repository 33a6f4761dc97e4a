//! Resource ceilings applied to every sandbox container

use serde::Deserialize;

/// Per-container limits
///
/// Translated into the container runtime's `HostConfig`: `Memory` (and
/// `MemorySwap` at the same value, so the ceiling cannot be dodged by
/// swapping), `NanoCpus`, `PidsLimit`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes
    pub memory_bytes: u64,

    /// CPU share (can be fractional, e.g. 0.5 for half a core)
    pub cpu_cores: f64,

    /// Maximum processes/threads inside the container
    pub pids_limit: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024, // 512MB
            cpu_cores: 1.0,
            pids_limit: 64,
        }
    }
}

impl ResourceLimits {
    /// Custom limits from a memory size in megabytes
    pub fn custom(cpu_cores: f64, memory_mb: u64) -> Self {
        Self {
            cpu_cores,
            memory_bytes: memory_mb * 1024 * 1024,
            ..Self::default()
        }
    }

    /// CPU share in the runtime's units (1e9 = one core)
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_cores * 1_000_000_000.0) as i64
    }
}
