// =============================================================================
// Startup Failure Tracker — on-disk record of agents that failed to start
// =============================================================================
//
// Capped JSON file inspected by operators after the fact. Tracking must
// never fail the caller; I/O problems are logged and swallowed.
// =============================================================================

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Retained failure records.
const MAX_RECORDS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupFailureRecord {
    pub timestamp: String,
    pub agent_name: String,
    pub error_message: String,
    pub retry_count: u32,
    pub last_seen: String,
}

pub struct StartupFailureTracker {
    path: PathBuf,
}

impl StartupFailureTracker {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Record a startup failure for `agent`; repeated failures bump the
    /// retry counter instead of adding rows.
    pub fn track(&self, agent: &str, message: &str) {
        let mut records = self.load();
        let now = Utc::now().to_rfc3339();

        if let Some(existing) = records.iter_mut().find(|r| r.agent_name == agent) {
            existing.retry_count += 1;
            existing.last_seen = now;
            existing.error_message = message.to_string();
        } else {
            records.push(StartupFailureRecord {
                timestamp: now.clone(),
                agent_name: agent.to_string(),
                error_message: message.to_string(),
                retry_count: 0,
                last_seen: now,
            });
        }

        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(MAX_RECORDS);

        if let Err(e) = self.write(&records) {
            error!(agent, error = %e, "failed to persist startup failure record");
        } else {
            warn!(agent, message, "startup failure recorded");
        }
    }

    pub fn load(&self) -> Vec<StartupFailureRecord> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Remove records for one agent, or all records when `agent` is `None`.
    pub fn clear(&self, agent: Option<&str>) {
        let records: Vec<StartupFailureRecord> = match agent {
            Some(name) => self
                .load()
                .into_iter()
                .filter(|r| r.agent_name != name)
                .collect(),
            None => Vec::new(),
        };
        if let Err(e) = self.write(&records) {
            error!(error = %e, "failed to clear startup failures");
        }
    }

    fn write(&self, records: &[StartupFailureRecord]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            &self.path,
            serde_json::to_string_pretty(records).unwrap_or_default(),
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_and_increments_retries() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StartupFailureTracker::new(dir.path().join("failures.json"));

        tracker.track("alpha", "missing config");
        tracker.track("alpha", "still missing config");
        tracker.track("beta", "other error");

        let records = tracker.load();
        assert_eq!(records.len(), 2);
        let alpha = records.iter().find(|r| r.agent_name == "alpha").unwrap();
        assert_eq!(alpha.retry_count, 1);
        assert_eq!(alpha.error_message, "still missing config");
    }

    #[test]
    fn clear_single_agent() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StartupFailureTracker::new(dir.path().join("failures.json"));
        tracker.track("alpha", "x");
        tracker.track("beta", "y");

        tracker.clear(Some("alpha"));
        let records = tracker.load();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].agent_name, "beta");

        tracker.clear(None);
        assert!(tracker.load().is_empty());
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StartupFailureTracker::new(dir.path().join("nope.json"));
        assert!(tracker.load().is_empty());
    }
}
