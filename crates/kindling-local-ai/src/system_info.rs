//! Host capability facts used to size llama-server launches.

use serde::Serialize;
use sysinfo::System;

/// Snapshot of the host's CPU and memory capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostFacts {
    /// Logical CPU cores.
    pub cpu_count: usize,
    /// Estimated number of performance cores (see [`performance_core_estimate`]).
    pub performance_core_estimate: usize,
    /// Physical memory in bytes.
    pub total_memory_bytes: u64,
    /// Memory the OS reports as available right now.
    pub available_memory_bytes: u64,
}

impl HostFacts {
    /// Query the running host.
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        let cpu_count = match sys.cpus().len() {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        };

        Self {
            cpu_count,
            performance_core_estimate: performance_core_estimate(cpu_count),
            total_memory_bytes: sys.total_memory(),
            available_memory_bytes: sys.available_memory(),
        }
    }

    /// Facts for a host with `cpu_count` cores and `memory_bytes` of RAM.
    ///
    /// Used wherever a deterministic host is needed instead of the real one.
    pub fn synthetic(cpu_count: usize, memory_bytes: u64) -> Self {
        Self {
            cpu_count,
            performance_core_estimate: performance_core_estimate(cpu_count),
            total_memory_bytes: memory_bytes,
            available_memory_bytes: memory_bytes,
        }
    }
}

/// Estimate performance cores from the logical core count.
///
/// Hybrid CPUs split their cores into performance and efficiency clusters;
/// inference threads pinned to efficiency cores slow the whole batch down.
pub fn performance_core_estimate(cpu_count: usize) -> usize {
    match cpu_count {
        8 => 4,
        10 => 8,
        12 => 8,
        14 => 10,
        16 => 12,
        20 => 16,
        24 => 16,
        n => (n / 2).max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_performance_core_table() {
        assert_eq!(performance_core_estimate(8), 4);
        assert_eq!(performance_core_estimate(10), 8);
        assert_eq!(performance_core_estimate(12), 8);
        assert_eq!(performance_core_estimate(14), 10);
        assert_eq!(performance_core_estimate(16), 12);
        assert_eq!(performance_core_estimate(20), 16);
        assert_eq!(performance_core_estimate(24), 16);
    }

    #[test]
    fn test_unknown_core_counts_fall_back_to_half() {
        assert_eq!(performance_core_estimate(6), 3);
        assert_eq!(performance_core_estimate(32), 16);
        assert_eq!(performance_core_estimate(1), 1);
        assert_eq!(performance_core_estimate(0), 1);
    }

    #[test]
    fn test_detect_reports_something_sane() {
        let facts = HostFacts::detect();
        assert!(facts.cpu_count >= 1);
        assert!(facts.performance_core_estimate >= 1);
    }
}
