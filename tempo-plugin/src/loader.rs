use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use tempo_persist::{AuditTrail, ConfigManager, PluginConfig};
use tempo_security::{
    effective_capabilities, AuditSummary, Capability, CapabilitySet, LeakDetector, ResourceLimits,
    Sandbox, SandboxError, SandboxPolicy,
};

use crate::error::{LoadError, Result};
use crate::hook::{HookContext, HookManager, HookType, DEFAULT_PRIORITY};
use crate::lifecycle::{LifecycleEvent, LifecycleTracker, PluginState};
use crate::metadata::{Plugin, PluginMetadata};
use crate::registry::PluginFactoryRegistry;
use crate::version::{FeatureFlags, VersionNegotiator};

/// Stable handle into the loader's plugin arena. Hook registrations hold
/// the handle rather than the plugin name, so an unload/reload cannot leave
/// dangling references behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginHandle(pub u64);

struct LoadedPlugin {
    name: String,
    plugin: Arc<dyn Plugin>,
    sandbox: Arc<Sandbox>,
    metadata: PluginMetadata,
    features: FeatureFlags,
}

/// Handle-indexed storage for loaded plugins. Handles are never reused
/// within a loader's lifetime.
#[derive(Default)]
struct PluginArena {
    next: u64,
    entries: HashMap<PluginHandle, LoadedPlugin>,
    by_name: HashMap<String, PluginHandle>,
}

impl PluginArena {
    fn allocate(&mut self) -> PluginHandle {
        self.next += 1;
        PluginHandle(self.next)
    }

    fn insert(&mut self, handle: PluginHandle, entry: LoadedPlugin) {
        self.by_name.insert(entry.name.clone(), handle);
        self.entries.insert(handle, entry);
    }

    fn handle_of(&self, name: &str) -> Option<PluginHandle> {
        self.by_name.get(name).copied()
    }

    fn get(&self, handle: PluginHandle) -> Option<&LoadedPlugin> {
        self.entries.get(&handle)
    }

    fn remove(&mut self, handle: PluginHandle) -> Option<LoadedPlugin> {
        let entry = self.entries.remove(&handle)?;
        self.by_name.remove(&entry.name);
        Some(entry)
    }

    fn names(&self) -> Vec<String> {
        self.by_name.keys().cloned().collect()
    }
}

/// Orchestrates discovery, instantiation, sandbox construction, lifecycle
/// transitions, and hook registration. The only component with write access
/// to the active-plugin registry.
pub struct PluginLoader {
    negotiator: VersionNegotiator,
    registry: PluginFactoryRegistry,
    hooks: RwLock<HookManager>,
    arena: RwLock<PluginArena>,
    lifecycle: Mutex<LifecycleTracker>,
    leaks: Mutex<LeakDetector>,
    // Serializes load/unload end to end so the duplicate check and the
    // registry commit are atomic. Hook dispatch does not take it.
    load_gate: Mutex<()>,
    audit_trail: AuditTrail,
    configs: ConfigManager,
    plugins_dir: PathBuf,
    monitor_interval: Duration,
}

impl PluginLoader {
    /// `base_dir` holds the per-plugin sandbox roots (`plugins/`), config
    /// files (`config/`), and the daily audit files (`audit/`).
    pub fn new(
        runtime_version: &str,
        base_dir: PathBuf,
        registry: PluginFactoryRegistry,
    ) -> Result<Self> {
        Ok(Self {
            negotiator: VersionNegotiator::new(runtime_version)?,
            registry,
            hooks: RwLock::new(HookManager::new()),
            arena: RwLock::new(PluginArena::default()),
            lifecycle: Mutex::new(LifecycleTracker::new()),
            leaks: Mutex::new(LeakDetector::new()),
            load_gate: Mutex::new(()),
            audit_trail: AuditTrail::new(base_dir.join("audit")),
            configs: ConfigManager::new(base_dir.join("config")),
            plugins_dir: base_dir.join("plugins"),
            monitor_interval: Duration::from_millis(250),
        })
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn registry(&self) -> &PluginFactoryRegistry {
        &self.registry
    }

    pub fn audit_trail(&self) -> &AuditTrail {
        &self.audit_trail
    }

    pub fn config_manager(&self) -> &ConfigManager {
        &self.configs
    }

    /// Capability-derived default whitelists. `fs.read.user`/`fs.write.user`
    /// seed a root under the per-plugin sandbox directory; `env.read` seeds
    /// a handful of harmless variables; `net.http` reads host specs from
    /// the plugin's `allowed_hosts` config key.
    fn build_policy(
        &self,
        name: &str,
        capabilities: CapabilitySet,
        config: &PluginConfig,
    ) -> Result<SandboxPolicy> {
        let mut policy = SandboxPolicy {
            capabilities,
            ..Default::default()
        };

        let root = self.plugins_dir.join(name);
        if policy.capabilities.has(Capability::FsWriteUser) {
            std::fs::create_dir_all(&root).map_err(SandboxError::Io)?;
            policy.paths.allow_write(root);
        } else if policy.capabilities.has(Capability::FsReadUser) {
            std::fs::create_dir_all(&root).map_err(SandboxError::Io)?;
            policy.paths.allow_read(root);
        }
        if policy.capabilities.has(Capability::FsReadTemp) {
            policy.paths.allow_read(std::env::temp_dir());
        }
        if policy.capabilities.has(Capability::EnvRead) {
            for var in ["HOME", "PATH", "LANG", "TZ"] {
                policy.env.allow_read(var);
            }
        }
        if policy.capabilities.has(Capability::NetHttp) {
            if let Some(hosts) = config.get("allowed_hosts").and_then(|v| v.as_array()) {
                for spec in hosts.iter().filter_map(|v| v.as_str()) {
                    policy.network.allow_spec(spec);
                }
            }
        }
        Ok(policy)
    }

    async fn reject(&self, name: &str, version: &str, err: LoadError) -> LoadError {
        let reason = err.to_string();
        self.lifecycle.lock().await.fail(name, &reason);
        self.audit_trail
            .record("load", name, Some(version), "failed", Some(&reason));
        tracing::warn!(plugin = name, "plugin load rejected: {reason}");
        err
    }

    /// Load a plugin through the full secure path. All-or-nothing: any
    /// failure deactivates the sandbox, rolls back hook registrations, and
    /// leaves no registry entry.
    pub async fn load_plugin(&self, id: &str, limits: ResourceLimits) -> Result<PluginHandle> {
        let _gate = self.load_gate.lock().await;
        if self.arena.read().await.handle_of(id).is_some() {
            return Err(LoadError::AlreadyLoaded(id.to_string()));
        }
        let Some(plugin) = self.registry.instantiate(id) else {
            return Err(LoadError::UnknownPlugin(id.to_string()));
        };
        self.lifecycle
            .lock()
            .await
            .transition(id, PluginState::Loading);

        let metadata = plugin.metadata();
        let name = metadata.name.clone();
        let version = metadata.version.clone();

        // Version gate, before any sandbox exists.
        match self
            .negotiator
            .is_compatible(&metadata.min_app_version, metadata.max_app_version.as_deref())
        {
            Ok(true) => {}
            Ok(false) => {
                let required = match &metadata.max_app_version {
                    Some(max) => format!(">={}, <={max}", metadata.min_app_version),
                    None => format!(">={}", metadata.min_app_version),
                };
                let err = LoadError::IncompatibleVersion {
                    plugin: name.clone(),
                    required,
                    runtime: self.negotiator.runtime_version().to_string(),
                };
                return Err(self.reject(&name, &version, err).await);
            }
            Err(parse) => {
                return Err(self.reject(&name, &version, parse.into()).await);
            }
        }
        let features = self.negotiator.negotiate_features(&metadata.version);

        // Effective capability set and capability-derived whitelists.
        let capabilities =
            effective_capabilities(&metadata.capabilities, &metadata.legacy_permissions);
        let config = match self.configs.load(&name, &metadata.config_schema.defaults) {
            Ok(config) => config,
            Err(err) => return Err(self.reject(&name, &version, err.into()).await),
        };
        let policy = match self.build_policy(&name, capabilities, &config) {
            Ok(policy) => policy,
            Err(err) => return Err(self.reject(&name, &version, err).await),
        };

        let sandbox = Arc::new(Sandbox::with_interval(
            &name,
            policy,
            limits,
            self.monitor_interval,
        ));
        // The guard releases the sandbox on every failure path below; it is
        // disarmed only once the load commits.
        let guard = sandbox.activate_scoped();

        let missing = metadata.config_schema.missing_keys(&config);
        if !missing.is_empty() {
            let err = LoadError::InvalidConfig {
                plugin: name.clone(),
                keys: missing,
            };
            return Err(self.reject(&name, &version, err).await);
        }

        // initialize() runs inside the active sandbox.
        if let Err(err) = plugin.initialize(&sandbox, &config).await {
            let err = LoadError::InitializationFailed {
                plugin: name.clone(),
                reason: err.to_string(),
            };
            return Err(self.reject(&name, &version, err).await);
        }
        self.lifecycle
            .lock()
            .await
            .transition(&name, PluginState::Initialized);

        // Hook registration, gated per hook type by hook.system. Partial
        // registrations are rolled back as a unit.
        let handle = self.arena.write().await.allocate();
        {
            let mut hooks = self.hooks.write().await;
            for hook_type in metadata.hooks.keys() {
                if !sandbox.check_capability(Capability::HookSystem, hook_type.as_str()) {
                    hooks.unregister_plugin(handle);
                    drop(hooks);
                    let err = LoadError::Policy(SandboxError::PolicyDenied {
                        plugin: name.clone(),
                        action: "hook_register".into(),
                        resource: hook_type.as_str().into(),
                    });
                    return Err(self.reject(&name, &version, err).await);
                }
                match plugin.hook_handler(*hook_type) {
                    Some(handler) => {
                        hooks.register(*hook_type, handler, handle, DEFAULT_PRIORITY);
                    }
                    None => {
                        hooks.unregister_plugin(handle);
                        drop(hooks);
                        let err = LoadError::MissingHandler {
                            plugin: name.clone(),
                            hook_type: *hook_type,
                        };
                        return Err(self.reject(&name, &version, err).await);
                    }
                }
            }
        }

        // Commit.
        self.leaks.lock().await.track(&name);
        guard.disarm();
        self.arena.write().await.insert(
            handle,
            LoadedPlugin {
                name: name.clone(),
                plugin,
                sandbox,
                metadata,
                features,
            },
        );
        self.lifecycle
            .lock()
            .await
            .transition(&name, PluginState::Active);
        self.audit_trail
            .record("load", &name, Some(&version), "success", None);
        tracing::info!(plugin = %name, version = %version, "plugin loaded");
        Ok(handle)
    }

    /// Unload a plugin: leak check (reported, never blocking), hook
    /// unregistration, `shutdown` inside the sandbox, sandbox deactivation,
    /// registry removal. Unknown names are a no-op returning `Ok(false)`.
    pub async fn unload_plugin(&self, name: &str) -> Result<bool> {
        let _gate = self.load_gate.lock().await;
        let Some(handle) = self.arena.read().await.handle_of(name) else {
            return Ok(false);
        };
        self.lifecycle
            .lock()
            .await
            .transition(name, PluginState::Unloading);

        if let Some(report) = self.leaks.lock().await.check(name) {
            if report.has_leaks() {
                let metrics: Vec<&str> =
                    report.findings.iter().map(|f| f.metric.as_str()).collect();
                tracing::warn!(plugin = name, ?metrics, "resource leak detected at unload");
                self.audit_trail.record(
                    "leak",
                    name,
                    None,
                    "detected",
                    Some(&metrics.join(",")),
                );
            }
        }

        let removed = self.hooks.write().await.unregister_plugin(handle);
        tracing::debug!(plugin = name, handlers = removed, "hooks unregistered");

        let Some(entry) = self.arena.write().await.remove(handle) else {
            return Ok(false);
        };
        // shutdown() runs while the sandbox is still active.
        entry.plugin.shutdown(&entry.sandbox).await;
        entry.sandbox.deactivate();

        self.leaks.lock().await.untrack(name);
        self.lifecycle
            .lock()
            .await
            .transition(name, PluginState::Unloaded);
        self.audit_trail
            .record("unload", name, Some(&entry.metadata.version), "success", None);
        tracing::info!(plugin = name, "plugin unloaded");
        Ok(true)
    }

    /// Operator pause: the plugin stays loaded but its handlers stop
    /// firing.
    pub async fn suspend(&self, name: &str) -> Result<()> {
        let Some(handle) = self.arena.read().await.handle_of(name) else {
            return Err(LoadError::UnknownPlugin(name.to_string()));
        };
        let state = self.lifecycle.lock().await.state_of(name);
        if state != PluginState::Active {
            return Err(LoadError::InvalidState {
                plugin: name.to_string(),
                state,
                expected: PluginState::Active,
            });
        }
        self.hooks.write().await.set_plugin_enabled(handle, false);
        self.lifecycle
            .lock()
            .await
            .transition(name, PluginState::Suspended);
        Ok(())
    }

    pub async fn resume(&self, name: &str) -> Result<()> {
        let Some(handle) = self.arena.read().await.handle_of(name) else {
            return Err(LoadError::UnknownPlugin(name.to_string()));
        };
        let state = self.lifecycle.lock().await.state_of(name);
        if state != PluginState::Suspended {
            return Err(LoadError::InvalidState {
                plugin: name.to_string(),
                state,
                expected: PluginState::Suspended,
            });
        }
        self.hooks.write().await.set_plugin_enabled(handle, true);
        self.lifecycle
            .lock()
            .await
            .transition(name, PluginState::Active);
        Ok(())
    }

    /// Tear down and rebuild a loaded plugin with fresh limits and a fresh
    /// sandbox instance.
    pub async fn reload(&self, name: &str, limits: ResourceLimits) -> Result<PluginHandle> {
        if !self.unload_plugin(name).await? {
            return Err(LoadError::UnknownPlugin(name.to_string()));
        }
        self.load_plugin(name, limits).await
    }

    /// The only entry point for triggering plugin behavior from the rest of
    /// the host application.
    pub async fn execute_hook(&self, hook_type: HookType, ctx: HookContext) -> HookContext {
        self.hooks.read().await.execute(hook_type, ctx).await
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub async fn is_loaded(&self, name: &str) -> bool {
        self.arena.read().await.handle_of(name).is_some()
    }

    pub async fn handle_of(&self, name: &str) -> Option<PluginHandle> {
        self.arena.read().await.handle_of(name)
    }

    pub async fn loaded_plugins(&self) -> Vec<String> {
        self.arena.read().await.names()
    }

    pub async fn state_of(&self, name: &str) -> PluginState {
        self.lifecycle.lock().await.state_of(name)
    }

    pub async fn lifecycle_events(&self, name: &str) -> Vec<LifecycleEvent> {
        self.lifecycle
            .lock()
            .await
            .events_for(name)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn metadata(&self, name: &str) -> Option<PluginMetadata> {
        let arena = self.arena.read().await;
        let handle = arena.handle_of(name)?;
        arena.get(handle).map(|e| e.metadata.clone())
    }

    pub async fn features(&self, name: &str) -> Option<FeatureFlags> {
        let arena = self.arena.read().await;
        let handle = arena.handle_of(name)?;
        arena.get(handle).map(|e| e.features)
    }

    /// The sandbox facade for a loaded plugin, handed to whatever runs the
    /// plugin's code.
    pub async fn sandbox(&self, name: &str) -> Option<Arc<Sandbox>> {
        let arena = self.arena.read().await;
        let handle = arena.handle_of(name)?;
        arena.get(handle).map(|e| Arc::clone(&e.sandbox))
    }

    pub async fn hook_handler_count(&self, hook_type: HookType) -> usize {
        self.hooks.read().await.handler_count(hook_type)
    }

    pub async fn audit_summary(&self, name: &str, recent_n: usize) -> Option<AuditSummary> {
        let sandbox = self.sandbox(name).await?;
        Some(sandbox.audit_summary(recent_n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::{HandlerError, HookHandler};
    use crate::metadata::ConfigSchema;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    type CallLog = Arc<StdMutex<Vec<String>>>;

    struct EchoHandler {
        plugin: String,
        calls: CallLog,
    }

    #[async_trait]
    impl HookHandler for EchoHandler {
        async fn handle(
            &self,
            ctx: &mut HookContext,
        ) -> std::result::Result<Option<HookContext>, HandlerError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("hook:{}", ctx.hook_type.as_str()));
            ctx.insert("handled_by", json!(self.plugin.clone()));
            Ok(None)
        }
    }

    struct TestPlugin {
        meta: PluginMetadata,
        fail_init: bool,
        slow_init: bool,
        expose_handlers: bool,
        calls: CallLog,
    }

    #[async_trait]
    impl Plugin for TestPlugin {
        fn metadata(&self) -> PluginMetadata {
            self.meta.clone()
        }

        async fn initialize(
            &self,
            sandbox: &Sandbox,
            _config: &PluginConfig,
        ) -> std::result::Result<(), HandlerError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("init:active={}", sandbox.is_active()));
            if self.slow_init {
                for _ in 0..8 {
                    tokio::task::yield_now().await;
                }
            }
            if self.fail_init {
                return Err(HandlerError::new("init refused"));
            }
            Ok(())
        }

        async fn shutdown(&self, sandbox: &Sandbox) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("shutdown:active={}", sandbox.is_active()));
        }

        fn hook_handler(&self, _hook_type: HookType) -> Option<Arc<dyn HookHandler>> {
            if !self.expose_handlers {
                return None;
            }
            Some(Arc::new(EchoHandler {
                plugin: self.meta.name.clone(),
                calls: self.calls.clone(),
            }))
        }
    }

    struct PluginSpec {
        name: &'static str,
        version: &'static str,
        min_app: &'static str,
        capabilities: Vec<Capability>,
        hooks: Vec<HookType>,
        required_keys: Vec<&'static str>,
        fail_init: bool,
        slow_init: bool,
        expose_handlers: bool,
    }

    impl Default for PluginSpec {
        fn default() -> Self {
            Self {
                name: "echo",
                version: "1.0.0",
                min_app: "0.1.0",
                capabilities: vec![Capability::HookSystem],
                hooks: vec![HookType::PostDataSave],
                required_keys: vec![],
                fail_init: false,
                slow_init: false,
                expose_handlers: true,
            }
        }
    }

    fn register(registry: &mut PluginFactoryRegistry, spec: PluginSpec) -> CallLog {
        let calls: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let calls_out = calls.clone();
        let meta = PluginMetadata {
            name: spec.name.into(),
            version: spec.version.into(),
            description: String::new(),
            author: None,
            capabilities: spec.capabilities,
            legacy_permissions: vec![],
            dependencies: vec![],
            hooks: spec
                .hooks
                .iter()
                .map(|h| (*h, format!("on_{}", h.as_str())))
                .collect::<BTreeMap<_, _>>(),
            config_schema: ConfigSchema {
                required: spec.required_keys.iter().map(|k| k.to_string()).collect(),
                defaults: PluginConfig::new(),
            },
            min_app_version: spec.min_app.into(),
            max_app_version: None,
        };
        let fail_init = spec.fail_init;
        let slow_init = spec.slow_init;
        let expose_handlers = spec.expose_handlers;
        registry
            .register(spec.name, move || {
                Arc::new(TestPlugin {
                    meta: meta.clone(),
                    fail_init,
                    slow_init,
                    expose_handlers,
                    calls: calls.clone(),
                })
            })
            .unwrap();
        calls_out
    }

    fn loader_with(
        runtime: &str,
        dir: &tempfile::TempDir,
        registry: PluginFactoryRegistry,
    ) -> PluginLoader {
        PluginLoader::new(runtime, dir.path().to_path_buf(), registry)
            .unwrap()
            .with_monitor_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_full_lifecycle_load_execute_unload() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PluginFactoryRegistry::new();
        let calls = register(&mut registry, PluginSpec::default());
        let loader = loader_with("1.0.0", &dir, registry);

        let handle = loader
            .load_plugin("echo", ResourceLimits::default())
            .await
            .unwrap();
        assert_eq!(loader.state_of("echo").await, PluginState::Active);
        assert_eq!(loader.handle_of("echo").await, Some(handle));
        assert_eq!(loader.hook_handler_count(HookType::PostDataSave).await, 1);

        // Initialization ran inside the active sandbox.
        assert_eq!(calls.lock().unwrap().as_slice(), ["init:active=true"]);

        let ctx = loader
            .execute_hook(HookType::PostDataSave, HookContext::new(HookType::PostDataSave))
            .await;
        assert_eq!(ctx.get("handled_by"), Some(&json!("echo")));

        assert!(loader.unload_plugin("echo").await.unwrap());
        assert_eq!(loader.state_of("echo").await, PluginState::Unloaded);
        assert!(!loader.is_loaded("echo").await);
        assert_eq!(loader.hook_handler_count(HookType::PostDataSave).await, 0);
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            [
                "init:active=true",
                "hook:post_data_save",
                "shutdown:active=true"
            ]
        );

        // Durable trail saw both lifecycle events with the session id.
        let events = loader.audit_trail().read_today().unwrap();
        let lifecycle: Vec<_> = events
            .iter()
            .filter(|e| e.event == "load" || e.event == "unload")
            .collect();
        assert_eq!(lifecycle.len(), 2);
        assert_eq!(lifecycle[0].event, "load");
        assert_eq!(lifecycle[0].status, "success");
        assert_eq!(lifecycle[1].event, "unload");
        assert!(events.iter().all(|e| e.session == loader.audit_trail().session()));
    }

    #[tokio::test]
    async fn test_version_gate_rejects_without_registry_entry_or_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PluginFactoryRegistry::new();
        let calls = register(
            &mut registry,
            PluginSpec {
                min_app: "0.9.0",
                ..Default::default()
            },
        );
        // Runtime older than the plugin's minimum.
        let loader = loader_with("0.8.0", &dir, registry);

        let err = loader.load_plugin("echo", ResourceLimits::default()).await;
        assert!(matches!(err, Err(LoadError::IncompatibleVersion { .. })));

        assert!(!loader.is_loaded("echo").await);
        assert_eq!(loader.state_of("echo").await, PluginState::Error);
        // initialize never ran: no sandbox was ever constructed.
        assert!(calls.lock().unwrap().is_empty());

        let events = loader.audit_trail().read_today().unwrap();
        assert_eq!(events[0].status, "failed");
        assert!(events[0].error.as_deref().unwrap().contains("requires app"));
    }

    #[tokio::test]
    async fn test_all_or_nothing_rollback_when_handler_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PluginFactoryRegistry::new();
        let calls = register(
            &mut registry,
            PluginSpec {
                hooks: vec![HookType::PostReportGenerate],
                expose_handlers: false,
                ..Default::default()
            },
        );
        let loader = loader_with("1.0.0", &dir, registry);

        let err = loader.load_plugin("echo", ResourceLimits::default()).await;
        assert!(matches!(err, Err(LoadError::MissingHandler { .. })));

        // It passed initialize but must not remain loaded.
        assert_eq!(calls.lock().unwrap().as_slice(), ["init:active=true"]);
        assert!(!loader.is_loaded("echo").await);
        assert_eq!(loader.state_of("echo").await, PluginState::Error);
        assert_eq!(
            loader.hook_handler_count(HookType::PostReportGenerate).await,
            0
        );
    }

    #[tokio::test]
    async fn test_hook_registration_requires_hook_system_capability() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PluginFactoryRegistry::new();
        register(
            &mut registry,
            PluginSpec {
                capabilities: vec![],
                ..Default::default()
            },
        );
        let loader = loader_with("1.0.0", &dir, registry);

        let err = loader.load_plugin("echo", ResourceLimits::default()).await;
        assert!(matches!(
            err,
            Err(LoadError::Policy(SandboxError::PolicyDenied { .. }))
        ));
        assert!(!loader.is_loaded("echo").await);
        assert_eq!(loader.hook_handler_count(HookType::PostDataSave).await, 0);
    }

    #[tokio::test]
    async fn test_missing_required_config_key_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PluginFactoryRegistry::new();
        let calls = register(
            &mut registry,
            PluginSpec {
                required_keys: vec!["output_dir"],
                ..Default::default()
            },
        );
        let loader = loader_with("1.0.0", &dir, registry);

        let err = loader.load_plugin("echo", ResourceLimits::default()).await;
        match err {
            Err(LoadError::InvalidConfig { keys, .. }) => {
                assert_eq!(keys, vec!["output_dir"]);
            }
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
        // Rejected before initialize.
        assert!(calls.lock().unwrap().is_empty());
        assert!(!loader.is_loaded("echo").await);
    }

    #[tokio::test]
    async fn test_persisted_config_override_satisfies_schema() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PluginFactoryRegistry::new();
        register(
            &mut registry,
            PluginSpec {
                required_keys: vec!["output_dir"],
                ..Default::default()
            },
        );
        let loader = loader_with("1.0.0", &dir, registry);

        let mut overrides = PluginConfig::new();
        let out = dir.path().join("exports");
        overrides.insert("output_dir".into(), json!(out.to_string_lossy()));
        loader.config_manager().save("echo", &overrides).unwrap();

        loader
            .load_plugin("echo", ResourceLimits::default())
            .await
            .unwrap();
        // Directory-valued config keys exist on disk after load.
        assert!(out.is_dir());
    }

    #[tokio::test]
    async fn test_initialization_failure_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PluginFactoryRegistry::new();
        register(
            &mut registry,
            PluginSpec {
                fail_init: true,
                ..Default::default()
            },
        );
        let loader = loader_with("1.0.0", &dir, registry);

        let err = loader.load_plugin("echo", ResourceLimits::default()).await;
        assert!(matches!(err, Err(LoadError::InitializationFailed { .. })));
        assert!(!loader.is_loaded("echo").await);
        assert_eq!(loader.state_of("echo").await, PluginState::Error);
    }

    #[tokio::test]
    async fn test_unload_unknown_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader_with("1.0.0", &dir, PluginFactoryRegistry::new());
        assert!(!loader.unload_plugin("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_double_load_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PluginFactoryRegistry::new();
        register(&mut registry, PluginSpec::default());
        let loader = loader_with("1.0.0", &dir, registry);

        loader
            .load_plugin("echo", ResourceLimits::default())
            .await
            .unwrap();
        let err = loader.load_plugin("echo", ResourceLimits::default()).await;
        assert!(matches!(err, Err(LoadError::AlreadyLoaded(_))));
    }

    #[tokio::test]
    async fn test_concurrent_loads_of_same_plugin_commit_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PluginFactoryRegistry::new();
        register(
            &mut registry,
            PluginSpec {
                slow_init: true,
                ..Default::default()
            },
        );
        let loader = Arc::new(loader_with("1.0.0", &dir, registry));

        // Two racing loads of the same id, with initialize suspending so
        // both tasks are in flight at once.
        let first = tokio::spawn({
            let loader = Arc::clone(&loader);
            async move { loader.load_plugin("echo", ResourceLimits::default()).await }
        });
        let second = tokio::spawn({
            let loader = Arc::clone(&loader);
            async move { loader.load_plugin("echo", ResourceLimits::default()).await }
        });
        let first = first.await.unwrap();
        let second = second.await.unwrap();

        // Exactly one commits; the loser sees AlreadyLoaded.
        assert!(first.is_ok() != second.is_ok());
        let loser = if first.is_err() { first } else { second };
        assert!(matches!(loser, Err(LoadError::AlreadyLoaded(_))));
        assert_eq!(loader.loaded_plugins().await, vec!["echo"]);
        assert_eq!(loader.hook_handler_count(HookType::PostDataSave).await, 1);

        // A single unload fully cleans up: nothing is left orphaned.
        assert!(loader.unload_plugin("echo").await.unwrap());
        assert_eq!(loader.hook_handler_count(HookType::PostDataSave).await, 0);
        assert!(loader.loaded_plugins().await.is_empty());
    }

    #[tokio::test]
    async fn test_suspend_and_resume_gate_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PluginFactoryRegistry::new();
        register(&mut registry, PluginSpec::default());
        let loader = loader_with("1.0.0", &dir, registry);
        loader
            .load_plugin("echo", ResourceLimits::default())
            .await
            .unwrap();

        loader.suspend("echo").await.unwrap();
        assert_eq!(loader.state_of("echo").await, PluginState::Suspended);
        let ctx = loader
            .execute_hook(HookType::PostDataSave, HookContext::new(HookType::PostDataSave))
            .await;
        assert!(ctx.get("handled_by").is_none());

        // Suspending twice is an invalid transition.
        assert!(matches!(
            loader.suspend("echo").await,
            Err(LoadError::InvalidState { .. })
        ));

        loader.resume("echo").await.unwrap();
        let ctx = loader
            .execute_hook(HookType::PostDataSave, HookContext::new(HookType::PostDataSave))
            .await;
        assert_eq!(ctx.get("handled_by"), Some(&json!("echo")));
    }

    #[tokio::test]
    async fn test_sequential_cycles_return_to_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PluginFactoryRegistry::new();
        register(&mut registry, PluginSpec::default());
        let loader = loader_with("1.0.0", &dir, registry);

        // Baseline before the churn; every monitor thread and file handle
        // opened during a cycle must be gone by the time it ends.
        let mut leaks = LeakDetector::new();
        leaks.track("churn");

        for _ in 0..10 {
            loader
                .load_plugin("echo", ResourceLimits::default())
                .await
                .unwrap();
            assert!(loader.unload_plugin("echo").await.unwrap());
        }

        let report = leaks.check("churn").unwrap();
        assert!(!report.has_leaks(), "findings: {:?}", report.findings);
        assert!(loader.loaded_plugins().await.is_empty());
        assert_eq!(loader.hook_handler_count(HookType::PostDataSave).await, 0);
        assert_eq!(loader.state_of("echo").await, PluginState::Unloaded);

        // 10 loads and 10 unloads in the durable trail, all successful.
        let events = loader.audit_trail().read_today().unwrap();
        let lifecycle: Vec<_> = events
            .iter()
            .filter(|e| e.event == "load" || e.event == "unload")
            .collect();
        assert_eq!(lifecycle.len(), 20);
        assert!(lifecycle.iter().all(|e| e.status == "success"));
    }

    #[tokio::test]
    async fn test_reload_builds_a_fresh_instance() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PluginFactoryRegistry::new();
        register(&mut registry, PluginSpec::default());
        let loader = loader_with("1.0.0", &dir, registry);

        let first = loader
            .load_plugin("echo", ResourceLimits::default())
            .await
            .unwrap();
        let second = loader
            .reload("echo", ResourceLimits::default())
            .await
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(loader.state_of("echo").await, PluginState::Active);
    }

    #[tokio::test]
    async fn test_capability_containment_visible_in_audit() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PluginFactoryRegistry::new();
        register(
            &mut registry,
            PluginSpec {
                capabilities: vec![Capability::HookSystem, Capability::FsReadUser],
                ..Default::default()
            },
        );
        let loader = loader_with("1.0.0", &dir, registry);
        loader
            .load_plugin("echo", ResourceLimits::default())
            .await
            .unwrap();

        let sandbox = loader.sandbox("echo").await.unwrap();
        let inside = dir.path().join("plugins/echo/notes.txt");
        assert!(sandbox.check_path_access(&inside, tempo_security::AccessMode::Read));
        assert!(!sandbox.check_path_access(
            std::path::Path::new("/etc/passwd"),
            tempo_security::AccessMode::Read
        ));

        let summary = loader.audit_summary("echo", 10).await.unwrap();
        assert_eq!(summary.counts.get("path_access:r:allowed"), Some(&1));
        assert_eq!(summary.counts.get("path_access:r:blocked"), Some(&1));
        // The hook registration capability grant is in the trail too.
        assert_eq!(
            summary.counts.get("capability:hook.system:granted"),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_legacy_plugin_negotiates_reduced_features() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PluginFactoryRegistry::new();
        register(
            &mut registry,
            PluginSpec {
                version: "0.5.0",
                ..Default::default()
            },
        );
        let loader = loader_with("1.0.0", &dir, registry);
        loader
            .load_plugin("echo", ResourceLimits::default())
            .await
            .unwrap();

        let features = loader.features("echo").await.unwrap();
        assert!(!features.capability_system);
        assert!(!features.async_handlers);
    }
}
