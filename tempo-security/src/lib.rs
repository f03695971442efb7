pub mod audit;
pub mod capability;
pub mod leak;
pub mod monitor;
pub mod sandbox;
pub mod whitelist;

// Re-export key types for convenience.
pub use audit::{AuditEntry, AuditLog, AuditResult, AuditSummary};
pub use capability::{effective_capabilities, Capability, CapabilitySet, LegacyPermission};
pub use leak::{LeakDetector, LeakFinding, LeakReport};
pub use monitor::{
    ResourceLimits, ResourceMonitor, ResourceSnapshot, ResourceSummary, ResourceViolation,
    ViolationSeverity,
};
pub use sandbox::{ActivationGuard, Sandbox, SandboxError, SandboxPolicy};
pub use whitelist::{AccessMode, EnvWhitelist, NetworkWhitelist, PathWhitelist};
