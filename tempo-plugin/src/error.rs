use crate::hook::HookType;
use crate::lifecycle::PluginState;

/// Errors produced by the plugin loader. None of these are fatal to the
/// host: a failed load tears down its own partial state and the host keeps
/// running.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("no factory registered for plugin '{0}'")]
    UnknownPlugin(String),

    #[error("plugin id '{0}' already registered")]
    DuplicateId(String),

    #[error("plugin '{0}' is already loaded")]
    AlreadyLoaded(String),

    #[error("plugin '{plugin}' requires app {required}, runtime is {runtime}")]
    IncompatibleVersion {
        plugin: String,
        required: String,
        runtime: String,
    },

    #[error("invalid semantic version: {0}")]
    InvalidVersion(#[from] semver::Error),

    #[error("plugin '{plugin}' config is missing required keys: {keys:?}")]
    InvalidConfig { plugin: String, keys: Vec<String> },

    #[error("plugin '{plugin}' failed to initialize: {reason}")]
    InitializationFailed { plugin: String, reason: String },

    #[error("plugin '{plugin}' declares hook {hook_type:?} but exposes no handler for it")]
    MissingHandler {
        plugin: String,
        hook_type: HookType,
    },

    #[error("plugin '{plugin}' is {state:?}, expected {expected:?}")]
    InvalidState {
        plugin: String,
        state: PluginState,
        expected: PluginState,
    },

    #[error("config: {0}")]
    Config(#[from] tempo_persist::ConfigError),

    #[error(transparent)]
    Policy(#[from] tempo_security::SandboxError),
}

pub type Result<T> = std::result::Result<T, LoadError>;
