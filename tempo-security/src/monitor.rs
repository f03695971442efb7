use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// How many violations the monitor retains before evicting the oldest.
const MAX_VIOLATIONS: usize = 100;

/// Numeric ceilings attached to one sandbox. Set at load time; a reload
/// produces a new sandbox with new limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_mb: u64,
    pub max_cpu_percent: u64,
    pub max_file_handles: u64,
    pub max_threads: u64,
    pub max_execution_secs: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 256,
            max_cpu_percent: 50,
            max_file_handles: 64,
            max_threads: 8,
            max_execution_secs: 300,
        }
    }
}

/// Point-in-time OS resource reading for the host process.
///
/// `cpu_percent` needs two readings to compute; `capture` leaves it at zero
/// and the monitor fills it in between sample ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub memory_bytes: u64,
    pub open_files: u64,
    pub threads: u64,
    pub connections: u64,
    pub cpu_percent: u64,
}

impl ResourceSnapshot {
    /// Reads `/proc/self` on Linux; other platforms report zeros.
    pub fn capture() -> Self {
        #[cfg(target_os = "linux")]
        {
            let (memory_bytes, threads) = read_proc_status();
            let (open_files, connections) = count_fds();
            Self {
                memory_bytes,
                open_files,
                threads,
                connections,
                cpu_percent: 0,
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            Self::default()
        }
    }
}

#[cfg(target_os = "linux")]
fn read_proc_status() -> (u64, u64) {
    let status = std::fs::read_to_string("/proc/self/status").unwrap_or_default();
    let mut memory = 0;
    let mut threads = 0;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb = rest.trim().trim_end_matches("kB").trim();
            memory = kb.parse::<u64>().unwrap_or(0) * 1024;
        } else if let Some(rest) = line.strip_prefix("Threads:") {
            threads = rest.trim().parse().unwrap_or(0);
        }
    }
    (memory, threads)
}

/// Open descriptors total plus how many of them are sockets.
#[cfg(target_os = "linux")]
fn count_fds() -> (u64, u64) {
    let Ok(dir) = std::fs::read_dir("/proc/self/fd") else {
        return (0, 0);
    };
    let mut total = 0;
    let mut sockets = 0;
    for entry in dir.flatten() {
        total += 1;
        if let Ok(target) = std::fs::read_link(entry.path()) {
            if target.to_string_lossy().starts_with("socket:") {
                sockets += 1;
            }
        }
    }
    (total, sockets)
}

/// USER_HZ: the tick unit `/proc/<pid>/stat` reports CPU time in. Fixed at
/// 100 on Linux independently of the kernel's scheduling HZ.
#[cfg(target_os = "linux")]
const CLOCK_TICKS_PER_SEC: u64 = 100;

/// Cumulative CPU time (user + system) consumed by the process.
#[cfg(target_os = "linux")]
fn read_cpu_time() -> Duration {
    let stat = std::fs::read_to_string("/proc/self/stat").unwrap_or_default();
    // Fields 14 and 15 (utime, stime) counted after the parenthesised comm
    // field, which may itself contain spaces.
    let Some((_, rest)) = stat.rsplit_once(')') else {
        return Duration::ZERO;
    };
    let mut fields = rest.split_whitespace();
    let utime: u64 = fields.nth(11).and_then(|f| f.parse().ok()).unwrap_or(0);
    let stime: u64 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
    Duration::from_millis((utime + stime) * 1000 / CLOCK_TICKS_PER_SEC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Warning,
    Critical,
}

/// A threshold violation observed on one sample tick. Soft: recorded and
/// surfaced in summaries, never enforced preemptively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceViolation {
    pub metric: String,
    pub limit: u64,
    pub actual: u64,
    pub severity: ViolationSeverity,
    pub timestamp: String,
}

fn violation(metric: &str, limit: u64, actual: u64) -> ResourceViolation {
    ResourceViolation {
        metric: metric.into(),
        limit,
        actual,
        severity: if actual > limit * 2 {
            ViolationSeverity::Critical
        } else {
            ViolationSeverity::Warning
        },
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

/// Compare one snapshot against the limits. `elapsed` is wall-clock time
/// since monitoring began.
pub fn check_limits(
    limits: &ResourceLimits,
    snapshot: &ResourceSnapshot,
    elapsed: Duration,
) -> Vec<ResourceViolation> {
    let mut violations = Vec::new();
    let memory_limit = limits.max_memory_mb * 1024 * 1024;
    if limits.max_memory_mb > 0 && snapshot.memory_bytes > memory_limit {
        violations.push(violation("memory", memory_limit, snapshot.memory_bytes));
    }
    if limits.max_cpu_percent > 0 && snapshot.cpu_percent > limits.max_cpu_percent {
        violations.push(violation(
            "cpu",
            limits.max_cpu_percent,
            snapshot.cpu_percent,
        ));
    }
    if limits.max_file_handles > 0 && snapshot.open_files > limits.max_file_handles {
        violations.push(violation(
            "file_handles",
            limits.max_file_handles,
            snapshot.open_files,
        ));
    }
    if limits.max_threads > 0 && snapshot.threads > limits.max_threads {
        violations.push(violation("threads", limits.max_threads, snapshot.threads));
    }
    if limits.max_execution_secs > 0 && elapsed.as_secs() > limits.max_execution_secs {
        violations.push(violation(
            "execution_time",
            limits.max_execution_secs,
            elapsed.as_secs(),
        ));
    }
    violations
}

/// Current usage, configured limits, and recent violations.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSummary {
    pub current: ResourceSnapshot,
    pub limits: ResourceLimits,
    pub recent_violations: Vec<ResourceViolation>,
}

/// Background sampler for one sandbox. Samples at a fixed interval on its
/// own thread and appends threshold violations to a bounded log. An
/// execution-time overrun additionally cancels the sandbox token so that
/// cooperative plugin code can wind down.
pub struct ResourceMonitor {
    limits: ResourceLimits,
    violations: Arc<Mutex<Vec<ResourceViolation>>>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    token: CancellationToken,
}

impl ResourceMonitor {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            violations: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            token: CancellationToken::new(),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Token cancelled when `max_execution_secs` is exceeded.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Launch the sampling thread. A second call while running is a no-op.
    pub fn start(&self, interval: Duration) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let limits = self.limits;
        let violations = Arc::clone(&self.violations);
        let running = Arc::clone(&self.running);
        let token = self.token.clone();
        let started = Instant::now();

        let handle = std::thread::spawn(move || {
            #[cfg(target_os = "linux")]
            let mut last = (Instant::now(), read_cpu_time());
            while running.load(Ordering::SeqCst) {
                #[allow(unused_mut)]
                let mut snapshot = ResourceSnapshot::capture();
                #[cfg(target_os = "linux")]
                {
                    let now = (Instant::now(), read_cpu_time());
                    let wall = now.0.duration_since(last.0);
                    if !wall.is_zero() {
                        let used = now.1.saturating_sub(last.1);
                        snapshot.cpu_percent =
                            (used.as_millis() as u64 * 100) / wall.as_millis().max(1) as u64;
                    }
                    last = now;
                }
                let found = check_limits(&limits, &snapshot, started.elapsed());
                if !found.is_empty() {
                    if found.iter().any(|v| v.metric == "execution_time") {
                        token.cancel();
                    }
                    if let Ok(mut log) = violations.lock() {
                        for v in found {
                            tracing::warn!(
                                metric = %v.metric,
                                limit = v.limit,
                                actual = v.actual,
                                "resource limit exceeded"
                            );
                            log.push(v);
                            if log.len() > MAX_VIOLATIONS {
                                log.remove(0);
                            }
                        }
                    }
                }
                std::thread::sleep(interval);
            }
        });
        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
    }

    /// Stop sampling and join the thread. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn violations(&self) -> Vec<ResourceViolation> {
        self.violations.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn summary(&self) -> ResourceSummary {
        ResourceSummary {
            current: ResourceSnapshot::capture(),
            limits: self.limits,
            recent_violations: self.violations(),
        }
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
