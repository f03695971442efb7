use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLog, AuditResult, AuditSummary};
use crate::capability::{Capability, CapabilitySet};
use crate::monitor::{ResourceLimits, ResourceMonitor};
use crate::whitelist::{AccessMode, EnvWhitelist, NetworkWhitelist, PathWhitelist};

const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_millis(250);
const AUDIT_CAPACITY: usize = 10_000;

/// Errors surfaced by the sandbox facade. `PolicyDenied` is the only error
/// in the runtime that changes caller-visible control flow.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("policy denied {action} on '{resource}' for plugin '{plugin}'")]
    PolicyDenied {
        plugin: String,
        action: String,
        resource: String,
    },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the loader grants a plugin: capabilities plus the whitelists
/// constraining them.
#[derive(Debug, Clone, Default)]
pub struct SandboxPolicy {
    pub capabilities: CapabilitySet,
    pub paths: PathWhitelist,
    pub network: NetworkWhitelist,
    pub env: EnvWhitelist,
}

/// The enforcement object bound to one loaded plugin.
///
/// Plugins never receive direct OS access; every sensitive operation goes
/// through this facade, which runs a two-stage check (capability gate, then
/// whitelist gate) and appends an audit entry either way. There is no
/// process-global interception state, so any number of sandboxes can be
/// active at once without affecting each other.
pub struct Sandbox {
    plugin: String,
    policy: SandboxPolicy,
    audit: Mutex<AuditLog>,
    monitor: ResourceMonitor,
    monitor_interval: Duration,
    active: AtomicBool,
}

impl Sandbox {
    pub fn new(plugin: &str, policy: SandboxPolicy, limits: ResourceLimits) -> Self {
        Self::with_interval(plugin, policy, limits, DEFAULT_MONITOR_INTERVAL)
    }

    pub fn with_interval(
        plugin: &str,
        policy: SandboxPolicy,
        limits: ResourceLimits,
        monitor_interval: Duration,
    ) -> Self {
        Self {
            plugin: plugin.to_string(),
            policy,
            audit: Mutex::new(AuditLog::new(AUDIT_CAPACITY)),
            monitor: ResourceMonitor::new(limits),
            monitor_interval,
            active: AtomicBool::new(false),
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Token cancelled by the monitor when the execution-time limit is
    /// exceeded. Plugin code is expected to check it at yield points.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.monitor.cancellation_token()
    }

    /// Begin enforcing this sandbox: starts background resource monitoring.
    /// Calling it on an already-active sandbox is a no-op.
    pub fn activate(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            self.monitor.start(self.monitor_interval);
            tracing::debug!(plugin = %self.plugin, "sandbox activated");
        }
    }

    /// Stop monitoring. Idempotent: deactivating a sandbox that was never
    /// activated, or deactivating twice, leaves state unchanged.
    pub fn deactivate(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.monitor.stop();
            tracing::debug!(plugin = %self.plugin, "sandbox deactivated");
        }
    }

    /// Activate and return a guard that deactivates on drop, so the sandbox
    /// is released on every exit path out of the protected region,
    /// including panics and early returns.
    pub fn activate_scoped(self: &Arc<Self>) -> ActivationGuard {
        self.activate();
        ActivationGuard {
            sandbox: Some(Arc::clone(self)),
        }
    }

    fn record(&self, action: &str, resource: &str, result: AuditResult, details: Option<&str>) {
        if let Ok(mut log) = self.audit.lock() {
            log.record(&self.plugin, action, resource, result, details);
        }
    }

    fn denied(&self, action: &str, resource: &str) -> SandboxError {
        SandboxError::PolicyDenied {
            plugin: self.plugin.clone(),
            action: action.to_string(),
            resource: resource.to_string(),
        }
    }

    /// Bare capability check, audited as granted/denied.
    pub fn check_capability(&self, cap: Capability, resource: &str) -> bool {
        let granted = self.policy.capabilities.has(cap);
        let result = if granted {
            AuditResult::Granted
        } else {
            AuditResult::Denied
        };
        self.record(&format!("capability:{cap}"), resource, result, None);
        granted
    }

    /// Two-stage path check: the filesystem capability for `mode` must be
    /// granted and the path must fall under a whitelisted root. Reads of
    /// paths under the OS temp root also accept `fs.read.temp`.
    pub fn check_path_access(&self, path: &Path, mode: AccessMode) -> bool {
        let cap = match mode {
            AccessMode::Read => Capability::FsReadUser,
            AccessMode::Write => Capability::FsWriteUser,
        };
        let mut has_cap = self.policy.capabilities.has(cap);
        if !has_cap && mode == AccessMode::Read && path.starts_with(std::env::temp_dir()) {
            has_cap = self.policy.capabilities.has(Capability::FsReadTemp);
        }
        let whitelisted = self.policy.paths.is_allowed(path, mode);
        let allowed = has_cap && whitelisted;

        let details = if allowed {
            None
        } else if !has_cap {
            Some(format!("capability {cap} not granted"))
        } else {
            Some("path not whitelisted".to_string())
        };
        self.record(
            &format!("path_access:{}", mode.as_str()),
            &path.display().to_string(),
            if allowed {
                AuditResult::Allowed
            } else {
                AuditResult::Blocked
            },
            details.as_deref(),
        );
        allowed
    }

    /// Two-stage network check: `net.http` plus host/port whitelist.
    pub fn check_network_access(&self, host: &str, port: u16) -> bool {
        let has_cap = self.policy.capabilities.has(Capability::NetHttp);
        let allowed = has_cap && self.policy.network.is_allowed(host, port);
        let details = if allowed {
            None
        } else if !has_cap {
            Some("capability net.http not granted")
        } else {
            Some("host not whitelisted")
        };
        self.record(
            "net_access",
            &format!("{host}:{port}"),
            if allowed {
                AuditResult::Allowed
            } else {
                AuditResult::Blocked
            },
            details,
        );
        allowed
    }

    /// Two-stage environment check: `env.read`/`env.write` plus variable
    /// name whitelist.
    pub fn check_env_access(&self, name: &str, mode: AccessMode) -> bool {
        let cap = match mode {
            AccessMode::Read => Capability::EnvRead,
            AccessMode::Write => Capability::EnvWrite,
        };
        let has_cap = self.policy.capabilities.has(cap);
        let allowed = has_cap && self.policy.env.is_allowed(name, mode);
        let details = if allowed {
            None
        } else if !has_cap {
            Some(format!("capability {cap} not granted"))
        } else {
            Some("variable not whitelisted".to_string())
        };
        self.record(
            &format!("env_access:{}", mode.as_str()),
            name,
            if allowed {
                AuditResult::Allowed
            } else {
                AuditResult::Blocked
            },
            details.as_deref(),
        );
        allowed
    }

    // ------------------------------------------------------------------
    // Facade: the only way plugin code touches files, sockets, the
    // environment, or child processes.
    // ------------------------------------------------------------------

    /// Open a file after the two-stage path check. Write mode creates the
    /// file if missing and appends.
    pub fn open(&self, path: &Path, mode: AccessMode) -> Result<std::fs::File, SandboxError> {
        if !self.check_path_access(path, mode) {
            return Err(self.denied(
                &format!("path_access:{}", mode.as_str()),
                &path.display().to_string(),
            ));
        }
        let file = match mode {
            AccessMode::Read => std::fs::File::open(path)?,
            AccessMode::Write => std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        };
        Ok(file)
    }

    /// Connect a TCP socket after the two-stage network check.
    pub fn connect(&self, host: &str, port: u16) -> Result<std::net::TcpStream, SandboxError> {
        if !self.check_network_access(host, port) {
            return Err(self.denied("net_access", &format!("{host}:{port}")));
        }
        Ok(std::net::TcpStream::connect((host, port))?)
    }

    /// Read an environment variable after the two-stage check. A granted
    /// read of an unset variable returns `Ok(None)`.
    pub fn env_var(&self, name: &str) -> Result<Option<String>, SandboxError> {
        if !self.check_env_access(name, AccessMode::Read) {
            return Err(self.denied("env_access:r", name));
        }
        Ok(std::env::var(name).ok())
    }

    /// Spawn a child process, gated on the `sys.process` capability.
    pub fn spawn_process(
        &self,
        program: &str,
        args: &[&str],
    ) -> Result<std::process::Child, SandboxError> {
        if !self.check_capability(Capability::SysProcess, program) {
            return Err(self.denied("process_spawn", program));
        }
        Ok(std::process::Command::new(program).args(args).spawn()?)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn audit_entries(&self) -> Vec<crate::audit::AuditEntry> {
        self.audit
            .lock()
            .map(|log| log.entries().to_vec())
            .unwrap_or_default()
    }

    /// Aggregate counts by action:result, the most recent `recent_n`
    /// entries, and the current resource summary.
    pub fn audit_summary(&self, recent_n: usize) -> AuditSummary {
        let (counts, recent) = self
            .audit
            .lock()
            .map(|log| (log.counts(), log.recent(recent_n)))
            .unwrap_or_default();
        AuditSummary {
            counts,
            recent,
            resources: self.monitor.summary(),
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.deactivate();
    }
}

/// RAII guard returned by [`Sandbox::activate_scoped`]. `disarm` keeps the
/// sandbox active past the guard's scope (used once a load commits).
pub struct ActivationGuard {
    sandbox: Option<Arc<Sandbox>>,
}

impl ActivationGuard {
    pub fn disarm(mut self) {
        self.sandbox = None;
    }
}

impl Drop for ActivationGuard {
    fn drop(&mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            sandbox.deactivate();
        }
    }
}
