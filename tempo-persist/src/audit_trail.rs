use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One load/unload event, written as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event: String,
    pub plugin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
    pub session: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditTrailError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Session-scoped, durable log of plugin load/unload events, independent of
/// each sandbox's per-action audit log. One JSONL file per day under the
/// audit directory; every line carries the process-lifetime session id.
pub struct AuditTrail {
    dir: PathBuf,
    session: String,
}

impl AuditTrail {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            session: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    fn day_file(&self, date: chrono::NaiveDate) -> PathBuf {
        self.dir.join(format!("audit-{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Append an event. Write failures are logged and swallowed: a broken
    /// audit disk must never abort a load or unload.
    pub fn record(
        &self,
        event: &str,
        plugin: &str,
        version: Option<&str>,
        status: &str,
        error: Option<&str>,
    ) {
        let record = AuditEvent {
            event: event.to_string(),
            plugin: plugin.to_string(),
            version: version.map(|v| v.to_string()),
            status: status.to_string(),
            error: error.map(|e| e.to_string()),
            timestamp: chrono::Utc::now().to_rfc3339(),
            session: self.session.clone(),
        };
        if let Err(err) = self.append(&record) {
            tracing::warn!(plugin, event, "failed to write audit event: {err}");
        }
    }

    fn append(&self, record: &AuditEvent) -> Result<(), AuditTrailError> {
        std::fs::create_dir_all(&self.dir)?;
        let line = serde_json::to_string(record)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.day_file(chrono::Utc::now().date_naive()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Read back every event recorded on `date`. Missing file = no events.
    pub fn read_day(&self, date: chrono::NaiveDate) -> Result<Vec<AuditEvent>, AuditTrailError> {
        let path = self.day_file(date);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(path)?;
        let mut events = Vec::new();
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            events.push(serde_json::from_str(line)?);
        }
        Ok(events)
    }

    /// Events recorded today.
    pub fn read_today(&self) -> Result<Vec<AuditEvent>, AuditTrailError> {
        self.read_day(chrono::Utc::now().date_naive())
    }
}
