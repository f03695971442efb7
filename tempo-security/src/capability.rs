use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// An atomic permission tag scoping one category of sensitive operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    FsReadUser,
    FsWriteUser,
    FsReadTemp,
    NetHttp,
    SysProcess,
    EnvRead,
    EnvWrite,
    DataRead,
    DataWrite,
    ApiAccess,
    HookSystem,
}

impl Capability {
    /// Dotted tag used in audit entries and log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FsReadUser => "fs.read.user",
            Self::FsWriteUser => "fs.write.user",
            Self::FsReadTemp => "fs.read.temp",
            Self::NetHttp => "net.http",
            Self::SysProcess => "sys.process",
            Self::EnvRead => "env.read",
            Self::EnvWrite => "env.write",
            Self::DataRead => "data.read",
            Self::DataWrite => "data.write",
            Self::ApiAccess => "api.access",
            Self::HookSystem => "hook.system",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse permissions kept for plugins written against the pre-capability
/// manifest format. Each expands to a fixed set of capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyPermission {
    ReadData,
    WriteData,
    Network,
    Filesystem,
    Environment,
    System,
    Hooks,
}

impl LegacyPermission {
    /// Fixed expansion table. The mapping never grows at runtime.
    pub fn to_capabilities(self) -> &'static [Capability] {
        match self {
            Self::ReadData => &[Capability::DataRead],
            Self::WriteData => &[Capability::DataRead, Capability::DataWrite],
            Self::Network => &[Capability::NetHttp],
            Self::Filesystem => &[
                Capability::FsReadUser,
                Capability::FsWriteUser,
                Capability::FsReadTemp,
            ],
            Self::Environment => &[Capability::EnvRead],
            Self::System => &[Capability::SysProcess, Capability::ApiAccess],
            Self::Hooks => &[Capability::HookSystem],
        }
    }
}

/// The capabilities granted to one sandbox. Built once at load time and
/// never mutated afterward.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    caps: BTreeSet<Capability>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.caps.contains(&cap)
    }

    pub fn insert(&mut self, cap: Capability) -> bool {
        self.caps.insert(cap)
    }

    pub fn len(&self) -> usize {
        self.caps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.caps.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self {
            caps: iter.into_iter().collect(),
        }
    }
}

/// The effective grant for a plugin: its declared capabilities plus the
/// expansion of its declared legacy permissions, and nothing else.
pub fn effective_capabilities(
    declared: &[Capability],
    legacy: &[LegacyPermission],
) -> CapabilitySet {
    let mut set: CapabilitySet = declared.iter().copied().collect();
    for perm in legacy {
        for cap in perm.to_capabilities() {
            set.insert(*cap);
        }
    }
    set
}
