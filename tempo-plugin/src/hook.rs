use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::loader::PluginHandle;

/// Priority assigned when a plugin manifest does not specify one.
pub const DEFAULT_PRIORITY: u8 = 50;

/// Host lifecycle events plugins can hook into.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    PreCommandExecute,
    PostCommandExecute,
    PreDataSave,
    PostDataSave,
    PreReportGenerate,
    PostReportGenerate,
    PreRecommendation,
    PostRecommendation,
    SystemStartup,
    SystemShutdown,
}

impl HookType {
    /// Tag used in audit entries and log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreCommandExecute => "pre_command_execute",
            Self::PostCommandExecute => "post_command_execute",
            Self::PreDataSave => "pre_data_save",
            Self::PostDataSave => "post_data_save",
            Self::PreReportGenerate => "pre_report_generate",
            Self::PostReportGenerate => "post_report_generate",
            Self::PreRecommendation => "pre_recommendation",
            Self::PostRecommendation => "post_recommendation",
            Self::SystemStartup => "system_startup",
            Self::SystemShutdown => "system_shutdown",
        }
    }
}

/// Mutable bag passed through the handler chain. Each handler sees the
/// mutations made by the handlers that ran before it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookContext {
    pub hook_type: HookType,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub metadata: BTreeMap<String, String>,
}

impl HookContext {
    pub fn new(hook_type: HookType) -> Self {
        Self {
            hook_type,
            data: serde_json::Map::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, key: &str, value: serde_json::Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn insert(&mut self, key: &str, value: serde_json::Value) {
        self.data.insert(key.to_string(), value);
    }
}

/// A hook handler failure. Isolated by the manager: it is logged and the
/// chain continues with the next handler.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A single hook handler. Handlers may mutate the context in place;
/// returning `Some` replaces the running context wholesale for the handlers
/// that follow.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, ctx: &mut HookContext) -> Result<Option<HookContext>, HandlerError>;
}

struct RegisteredHook {
    priority: u8,
    plugin: PluginHandle,
    enabled: bool,
    handler: Arc<dyn HookHandler>,
}

/// Priority-ordered handler lists keyed by hook type. Entries hold the
/// owning plugin's handle so a whole plugin can be unregistered in bulk.
#[derive(Default)]
pub struct HookManager {
    hooks: BTreeMap<HookType, Vec<RegisteredHook>>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler and re-sort ascending by priority (lower runs
    /// first; the sort is stable, so ties keep registration order).
    /// Duplicate registration is allowed.
    pub fn register(
        &mut self,
        hook_type: HookType,
        handler: Arc<dyn HookHandler>,
        plugin: PluginHandle,
        priority: u8,
    ) {
        let list = self.hooks.entry(hook_type).or_default();
        list.push(RegisteredHook {
            priority,
            plugin,
            enabled: true,
            handler,
        });
        list.sort_by_key(|h| h.priority);
    }

    /// Remove every handler owned by `plugin` across all hook types.
    /// Returns the number removed.
    pub fn unregister_plugin(&mut self, plugin: PluginHandle) -> usize {
        let mut removed = 0;
        for list in self.hooks.values_mut() {
            let before = list.len();
            list.retain(|h| h.plugin != plugin);
            removed += before - list.len();
        }
        removed
    }

    /// Enable or disable every handler owned by `plugin` without losing its
    /// registrations (used for suspend/resume). Returns the number touched.
    pub fn set_plugin_enabled(&mut self, plugin: PluginHandle, enabled: bool) -> usize {
        let mut touched = 0;
        for list in self.hooks.values_mut() {
            for hook in list.iter_mut().filter(|h| h.plugin == plugin) {
                hook.enabled = enabled;
                touched += 1;
            }
        }
        touched
    }

    pub fn handler_count(&self, hook_type: HookType) -> usize {
        self.hooks.get(&hook_type).map_or(0, Vec::len)
    }

    /// Run every enabled handler for `hook_type` sequentially in ascending
    /// priority order. A failing handler is logged and skipped; it never
    /// aborts the chain.
    pub async fn execute(&self, hook_type: HookType, mut ctx: HookContext) -> HookContext {
        let Some(list) = self.hooks.get(&hook_type) else {
            return ctx;
        };
        for hook in list.iter().filter(|h| h.enabled) {
            match hook.handler.handle(&mut ctx).await {
                Ok(Some(updated)) => ctx = updated,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        ?hook_type,
                        plugin = ?hook.plugin,
                        priority = hook.priority,
                        "hook handler failed: {err}"
                    );
                }
            }
        }
        ctx
    }
}
