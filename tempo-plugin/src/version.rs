use semver::Version;
use serde::{Deserialize, Serialize};

/// Plugins declaring a version older than this negotiate with the newer
/// runtime features disabled.
const FEATURE_CUTOFF: Version = Version::new(0, 9, 0);

/// Feature flags handed to a plugin after negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub capability_system: bool,
    pub async_handlers: bool,
    pub config_schema: bool,
}

impl FeatureFlags {
    fn full() -> Self {
        Self {
            capability_system: true,
            async_handlers: true,
            config_schema: true,
        }
    }

    fn legacy() -> Self {
        Self {
            capability_system: false,
            async_handlers: false,
            config_schema: true,
        }
    }
}

/// Semantic-version compatibility gate between a plugin's declared
/// supported range and the running app version. Pure: no side effects, and
/// called before any sandbox is constructed.
#[derive(Debug, Clone)]
pub struct VersionNegotiator {
    runtime: Version,
}

impl VersionNegotiator {
    pub fn new(runtime: &str) -> Result<Self, semver::Error> {
        Ok(Self {
            runtime: Version::parse(runtime)?,
        })
    }

    pub fn runtime_version(&self) -> &Version {
        &self.runtime
    }

    /// Compatible iff runtime ≥ `min` and (no `max` or runtime ≤ `max`).
    pub fn is_compatible(&self, min: &str, max: Option<&str>) -> Result<bool, semver::Error> {
        let min = Version::parse(min)?;
        if self.runtime < min {
            return Ok(false);
        }
        if let Some(max) = max {
            let max = Version::parse(max)?;
            if self.runtime > max {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Fixed feature map keyed off the plugin's declared version. A version
    /// that does not parse is treated as pre-cutoff legacy.
    pub fn negotiate_features(&self, plugin_version: &str) -> FeatureFlags {
        match Version::parse(plugin_version) {
            Ok(v) if v >= FEATURE_CUTOFF => FeatureFlags::full(),
            _ => FeatureFlags::legacy(),
        }
    }
}
