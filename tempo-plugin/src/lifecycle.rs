use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Plugin lifecycle state. Transitions are monotonic through the load path
/// (`Unloaded` → `Loading` → `Initialized` → `Active`) except for reload,
/// which tears the instance down and rebuilds it. `Unloaded` and `Error`
/// are terminal for a given instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Unloaded,
    Loading,
    Initialized,
    Active,
    Suspended,
    Unloading,
    Error,
}

/// One recorded state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub plugin_name: String,
    pub from_state: PluginState,
    pub to_state: PluginState,
    pub timestamp: String,
    pub error: Option<String>,
}

/// Tracks the lifecycle state of every plugin the loader has seen.
#[derive(Debug, Clone, Default)]
pub struct LifecycleTracker {
    states: HashMap<String, PluginState>,
    events: Vec<LifecycleEvent>,
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transition(&mut self, plugin_name: &str, to_state: PluginState) {
        self.push_event(plugin_name, to_state, None);
    }

    /// Transition into `Error`, recording what went wrong.
    pub fn fail(&mut self, plugin_name: &str, error: &str) {
        self.push_event(plugin_name, PluginState::Error, Some(error.to_string()));
    }

    fn push_event(&mut self, plugin_name: &str, to_state: PluginState, error: Option<String>) {
        let from_state = self.state_of(plugin_name);
        self.states.insert(plugin_name.to_string(), to_state);
        self.events.push(LifecycleEvent {
            plugin_name: plugin_name.into(),
            from_state,
            to_state,
            timestamp: chrono::Utc::now().to_rfc3339(),
            error,
        });
    }

    pub fn state_of(&self, plugin_name: &str) -> PluginState {
        self.states
            .get(plugin_name)
            .copied()
            .unwrap_or(PluginState::Unloaded)
    }

    pub fn events_for(&self, plugin_name: &str) -> Vec<&LifecycleEvent> {
        self.events
            .iter()
            .filter(|e| e.plugin_name == plugin_name)
            .collect()
    }

    pub fn active_plugins(&self) -> Vec<&str> {
        self.states
            .iter()
            .filter(|(_, s)| **s == PluginState::Active)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
