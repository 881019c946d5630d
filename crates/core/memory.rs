//! Process memory diagnostics read from `/proc/<pid>/status`.

use std::fmt;

use crate::error::{DroverError, Result};

/// Memory counters of one process, in kB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub rss_kb: u64,
    pub vm_kb: u64,
    pub data_kb: u64,
}

impl MemorySnapshot {
    /// Read the counters of `pid`.
    pub fn capture(pid: u32) -> Result<Self> {
        let path = format!("/proc/{}/status", pid);
        let status = std::fs::read_to_string(&path)
            .map_err(|e| DroverError::Process(format!("failed to read {}: {}", path, e)))?;
        Ok(Self::parse(&status))
    }

    /// Parse the contents of a `/proc/<pid>/status` file. Missing fields are
    /// left at zero.
    pub fn parse(status: &str) -> Self {
        let mut snapshot = Self::default();
        for line in status.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let kb = value
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse::<u64>()
                .unwrap_or(0);
            match key {
                "VmRSS" => snapshot.rss_kb = kb,
                "VmSize" => snapshot.vm_kb = kb,
                "VmData" => snapshot.data_kb = kb,
                _ => {}
            }
        }
        snapshot
    }

    /// Change relative to `baseline`.
    pub fn diff(&self, baseline: &MemorySnapshot) -> MemoryDiff {
        MemoryDiff {
            rss_kb: self.rss_kb as i64 - baseline.rss_kb as i64,
            vm_kb: self.vm_kb as i64 - baseline.vm_kb as i64,
            data_kb: self.data_kb as i64 - baseline.data_kb as i64,
        }
    }
}

/// Signed difference between two snapshots, in kB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryDiff {
    pub rss_kb: i64,
    pub vm_kb: i64,
    pub data_kb: i64,
}

impl fmt::Display for MemoryDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rss {:+} kB, vm {:+} kB, data {:+} kB",
            self.rss_kb, self.vm_kb, self.data_kb
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "Name:\tdrover\n\
        State:\tS (sleeping)\n\
        VmPeak:\t  20000 kB\n\
        VmSize:\t  18000 kB\n\
        VmRSS:\t    4096 kB\n\
        VmData:\t    2048 kB\n\
        Threads:\t4\n";

    #[test]
    fn test_parse() {
        let snapshot = MemorySnapshot::parse(STATUS);
        assert_eq!(
            snapshot,
            MemorySnapshot {
                rss_kb: 4096,
                vm_kb: 18000,
                data_kb: 2048,
            }
        );
    }

    #[test]
    fn test_parse_kernel_thread() {
        // Kernel threads have no Vm* lines.
        let snapshot = MemorySnapshot::parse("Name:\tkthreadd\nState:\tS\n");
        assert_eq!(snapshot, MemorySnapshot::default());
    }

    #[test]
    fn test_diff_display() {
        let baseline = MemorySnapshot::parse(STATUS);
        let now = MemorySnapshot {
            rss_kb: 5096,
            vm_kb: 18000,
            data_kb: 1048,
        };
        let diff = now.diff(&baseline);
        assert_eq!(diff.rss_kb, 1000);
        assert_eq!(diff.data_kb, -1000);
        assert_eq!(diff.to_string(), "rss +1000 kB, vm +0 kB, data -1000 kB");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_capture_self() {
        let snapshot = MemorySnapshot::capture(std::process::id()).unwrap();
        assert!(snapshot.rss_kb > 0);
        assert!(snapshot.vm_kb >= snapshot.rss_kb);
    }

    #[test]
    fn test_capture_missing_process() {
        assert!(MemorySnapshot::capture(u32::MAX).is_err());
    }
}
