pub mod error;
pub mod hook;
pub mod lifecycle;
pub mod loader;
pub mod metadata;
pub mod registry;
pub mod version;

// Re-export key types for convenience.
pub use error::LoadError;
pub use hook::{HandlerError, HookContext, HookHandler, HookManager, HookType, DEFAULT_PRIORITY};
pub use lifecycle::{LifecycleEvent, LifecycleTracker, PluginState};
pub use loader::{PluginHandle, PluginLoader};
pub use metadata::{ConfigSchema, Plugin, PluginMetadata};
pub use registry::PluginFactoryRegistry;
pub use version::{FeatureFlags, VersionNegotiator};

// The capability model lives with the enforcement code; re-exported here so
// plugin manifests only need this crate.
pub use tempo_security::capability::{
    effective_capabilities, Capability, CapabilitySet, LegacyPermission,
};
