use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempo_persist::PluginConfig;
use tempo_security::{Capability, LegacyPermission, Sandbox};

use crate::hook::{HandlerError, HookHandler, HookType};

/// Declared configuration shape: which keys must be present, and the
/// built-in defaults merged under any persisted overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSchema {
    pub required: Vec<String>,
    pub defaults: PluginConfig,
}

impl ConfigSchema {
    /// Required keys absent from `config`.
    pub fn missing_keys(&self, config: &PluginConfig) -> Vec<String> {
        self.required
            .iter()
            .filter(|k| !config.contains_key(*k))
            .cloned()
            .collect()
    }
}

/// Declarative plugin manifest. Produced once per plugin and read-only
/// after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: Option<String>,
    /// Fine-grained capabilities this plugin asks for.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Coarse permissions kept for older manifests; expanded into
    /// capabilities at load time.
    #[serde(default)]
    pub legacy_permissions: Vec<LegacyPermission>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Hook types this plugin handles, mapped to the declared handler name.
    #[serde(default)]
    pub hooks: BTreeMap<HookType, String>,
    #[serde(default)]
    pub config_schema: ConfigSchema,
    /// Minimum app version this plugin supports.
    pub min_app_version: String,
    /// Maximum supported app version; `None` = open-ended.
    pub max_app_version: Option<String>,
}

/// The contract every extension implements.
///
/// Plugins never touch the OS directly: `initialize` and `shutdown` receive
/// the sandbox facade, and all file/network/env/process access goes through
/// it.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Pure. Called once at load; the result is treated as read-only.
    fn metadata(&self) -> PluginMetadata;

    /// Called once, inside an active sandbox. May perform I/O through the
    /// facade.
    async fn initialize(
        &self,
        sandbox: &Sandbox,
        config: &PluginConfig,
    ) -> Result<(), HandlerError>;

    /// Idempotent cleanup, inside the sandbox.
    async fn shutdown(&self, sandbox: &Sandbox);

    /// The handler backing one declared hook type. Must return `Some` for
    /// every hook type in `metadata().hooks`.
    fn hook_handler(&self, hook_type: HookType) -> Option<Arc<dyn HookHandler>>;
}
