pub mod audit_trail;
pub mod config;

// Re-export key types for convenience.
pub use audit_trail::{AuditEvent, AuditTrail, AuditTrailError};
pub use config::{ConfigError, ConfigManager, PluginConfig};
