use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::monitor::ResourceSnapshot;

/// Absolute memory growth tolerated across a plugin's lifetime before it is
/// classified as a leak. Deliberately coarse.
pub const MEMORY_LEAK_THRESHOLD_BYTES: u64 = 50 * 1024 * 1024;

/// One resource that did not return to baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeakFinding {
    pub metric: String,
    pub baseline: u64,
    pub current: u64,
}

/// Baseline-versus-final comparison for one plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeakReport {
    pub plugin: String,
    pub baseline: ResourceSnapshot,
    pub current: ResourceSnapshot,
    pub findings: Vec<LeakFinding>,
}

impl LeakReport {
    pub fn has_leaks(&self) -> bool {
        !self.findings.is_empty()
    }
}

/// Before/after snapshot comparator used at unload time.
///
/// Baselines are per-plugin, but the snapshots are process-wide: the deltas
/// are only attributable to a single plugin when plugins run sequentially in
/// the process. With several plugins live the report still describes the
/// process drift, without claiming attribution.
#[derive(Debug, Default)]
pub struct LeakDetector {
    baselines: HashMap<String, ResourceSnapshot>,
}

impl LeakDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the baseline for a plugin. Re-tracking replaces the baseline.
    pub fn track(&mut self, plugin: &str) {
        self.baselines
            .insert(plugin.to_string(), ResourceSnapshot::capture());
    }

    pub fn is_tracked(&self, plugin: &str) -> bool {
        self.baselines.contains_key(plugin)
    }

    /// Compare a fresh snapshot against the plugin's baseline. Returns
    /// `None` for untracked plugins.
    pub fn check(&self, plugin: &str) -> Option<LeakReport> {
        let baseline = *self.baselines.get(plugin)?;
        Some(Self::compare(plugin, baseline, ResourceSnapshot::capture()))
    }

    pub fn untrack(&mut self, plugin: &str) -> bool {
        self.baselines.remove(plugin).is_some()
    }

    fn compare(plugin: &str, baseline: ResourceSnapshot, current: ResourceSnapshot) -> LeakReport {
        let mut findings = Vec::new();
        if current.open_files > baseline.open_files {
            findings.push(LeakFinding {
                metric: "file_handles".into(),
                baseline: baseline.open_files,
                current: current.open_files,
            });
        }
        if current.threads > baseline.threads {
            findings.push(LeakFinding {
                metric: "threads".into(),
                baseline: baseline.threads,
                current: current.threads,
            });
        }
        if current.memory_bytes > baseline.memory_bytes + MEMORY_LEAK_THRESHOLD_BYTES {
            findings.push(LeakFinding {
                metric: "memory".into(),
                baseline: baseline.memory_bytes,
                current: current.memory_bytes,
            });
        }
        LeakReport {
            plugin: plugin.to_string(),
            baseline,
            current,
            findings,
        }
    }
}
