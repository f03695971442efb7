use std::path::PathBuf;

use serde_json::Value;

/// Per-plugin configuration: a flat JSON object.
pub type PluginConfig = serde_json::Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config file for '{0}' is not a JSON object")]
    NotAnObject(String),
}

/// Loads, merges-with-defaults, and persists per-plugin configuration.
/// One `<name>.json` file per plugin under the config directory.
pub struct ConfigManager {
    dir: PathBuf,
}

impl ConfigManager {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Merge built-in defaults with the persisted override file; override
    /// wins key-by-key. String values of keys ending in `_dir` are created
    /// on disk before the config is returned.
    pub fn load(&self, name: &str, defaults: &PluginConfig) -> Result<PluginConfig, ConfigError> {
        let mut merged = defaults.clone();
        let path = self.config_path(name);
        if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            let value: Value = serde_json::from_str(&data)?;
            let overrides = value
                .as_object()
                .ok_or_else(|| ConfigError::NotAnObject(name.to_string()))?;
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
        }
        self.ensure_dirs(&merged)?;
        Ok(merged)
    }

    /// Persist the plugin's overrides, replacing any previous file.
    pub fn save(&self, name: &str, config: &PluginConfig) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(config)?;
        std::fs::write(self.config_path(name), json)?;
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<bool, ConfigError> {
        let path = self.config_path(name);
        if path.exists() {
            std::fs::remove_file(path)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn ensure_dirs(&self, config: &PluginConfig) -> Result<(), ConfigError> {
        for (key, value) in config {
            if key.ends_with("_dir") {
                if let Some(path) = value.as_str() {
                    std::fs::create_dir_all(path)?;
                }
            }
        }
        Ok(())
    }
}
