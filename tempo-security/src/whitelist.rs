use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::Serialize;

/// Read/write distinction for path and environment access checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    /// Short form used as the suffix of audit action strings.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::Write => "w",
        }
    }
}

/// Filesystem allow-list. A path is allowed when it equals or is a
/// descendant of a whitelisted root for the requested mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathWhitelist {
    read_roots: Vec<PathBuf>,
    write_roots: Vec<PathBuf>,
}

impl PathWhitelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_read(&mut self, root: impl Into<PathBuf>) {
        self.read_roots.push(root.into());
    }

    /// Write access implies read access to the same root.
    pub fn allow_write(&mut self, root: impl Into<PathBuf>) {
        let root = root.into();
        self.read_roots.push(root.clone());
        self.write_roots.push(root);
    }

    pub fn is_allowed(&self, path: &Path, mode: AccessMode) -> bool {
        let roots = match mode {
            AccessMode::Read => &self.read_roots,
            AccessMode::Write => &self.write_roots,
        };
        // Component-wise prefix match, so "/plugins/photo" does not admit
        // "/plugins/photo-evil".
        roots.iter().any(|root| path.starts_with(root))
    }

    pub fn read_roots(&self) -> &[PathBuf] {
        &self.read_roots
    }

    pub fn write_roots(&self) -> &[PathBuf] {
        &self.write_roots
    }
}

/// Network allow-list of host plus optional port. A rule without a port
/// admits any port on that host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkWhitelist {
    rules: Vec<HostRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRule {
    pub host: String,
    pub port: Option<u16>,
}

impl NetworkWhitelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&mut self, host: impl Into<String>, port: Option<u16>) {
        self.rules.push(HostRule {
            host: host.into(),
            port,
        });
    }

    /// Parse a "host" or "host:port" rule string.
    pub fn allow_spec(&mut self, spec: &str) {
        match spec.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => self.allow(host, Some(port)),
                Err(_) => self.allow(spec, None),
            },
            None => self.allow(spec, None),
        }
    }

    pub fn is_allowed(&self, host: &str, port: u16) -> bool {
        self.rules
            .iter()
            .any(|r| r.host == host && r.port.is_none_or(|p| p == port))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Environment-variable allow-list, partitioned by read/write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvWhitelist {
    read_vars: BTreeSet<String>,
    write_vars: BTreeSet<String>,
}

impl EnvWhitelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_read(&mut self, name: impl Into<String>) {
        self.read_vars.insert(name.into());
    }

    pub fn allow_write(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.read_vars.insert(name.clone());
        self.write_vars.insert(name);
    }

    pub fn is_allowed(&self, name: &str, mode: AccessMode) -> bool {
        match mode {
            AccessMode::Read => self.read_vars.contains(name),
            AccessMode::Write => self.write_vars.contains(name),
        }
    }
}
