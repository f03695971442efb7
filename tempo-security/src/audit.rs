use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Outcome of an audited sandbox decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    /// A two-stage (capability + whitelist) check passed.
    Allowed,
    /// A two-stage check failed at either stage.
    Blocked,
    /// A bare capability check passed.
    Granted,
    /// A bare capability check failed.
    Denied,
}

impl AuditResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Blocked => "blocked",
            Self::Granted => "granted",
            Self::Denied => "denied",
        }
    }
}

/// A single immutable audit record. Ordering is append order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub plugin: String,
    pub action: String,
    pub resource: String,
    pub result: AuditResult,
    pub details: Option<String>,
}

/// Append-only bounded audit buffer owned by one sandbox.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    entries: Vec<AuditEntry>,
    max_entries: usize,
}

impl AuditLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries,
        }
    }

    pub fn record(
        &mut self,
        plugin: &str,
        action: &str,
        resource: &str,
        result: AuditResult,
        details: Option<&str>,
    ) {
        self.entries.push(AuditEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            plugin: plugin.into(),
            action: action.into(),
            resource: resource.into(),
            result,
            details: details.map(|s| s.into()),
        });
        if self.entries.len() > self.max_entries {
            self.entries.remove(0);
        }
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The most recent `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<AuditEntry> {
        let start = self.entries.len().saturating_sub(n);
        self.entries[start..].to_vec()
    }

    /// Entry counts keyed by "action:result".
    pub fn counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            let key = format!("{}:{}", entry.action, entry.result.as_str());
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }
}

/// Aggregate view returned by `Sandbox::audit_summary`.
#[derive(Debug, Clone, Serialize)]
pub struct AuditSummary {
    pub counts: BTreeMap<String, usize>,
    pub recent: Vec<AuditEntry>,
    pub resources: crate::monitor::ResourceSummary,
}
