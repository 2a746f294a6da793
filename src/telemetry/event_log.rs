// =============================================================================
// Append-Only Telemetry Event Log — newline-delimited JSON
// =============================================================================
//
// One JSON object per line, UTF-8, append-only. Every append is flushed so a
// crash loses at most the line being written; readers skip partial or
// malformed lines silently. The equity curve consumed by the drawdown
// governor is a deterministic left-fold of the `reward` fields in log order.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A single telemetry event. Unknown envelope fields survive a round-trip via
/// the flattened `extra` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// RFC 3339 UTC timestamp.
    pub ts: String,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TelemetryEvent {
    /// Convenience constructor stamping the current UTC time.
    pub fn now(agent: impl Into<String>) -> Self {
        Self {
            ts: Utc::now().to_rfc3339(),
            agent: agent.into(),
            reward: None,
            latency_ms: None,
            cost_usd: None,
            errors: None,
            run_id: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Durable append-only event log backed by a single JSONL file.
pub struct EventLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl EventLog {
    /// Open (or create) the log at `path`. Parent directories are created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open event log at {}", path.display()))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Append a single event. O(1); the line is flushed before returning so a
    /// crash never leaves more than one partial line.
    pub fn append(&self, event: &TelemetryEvent) -> Result<()> {
        let line = serde_json::to_string(event).context("failed to serialise event")?;
        let mut file = self.file.lock();
        writeln!(file, "{line}").context("failed to append event line")?;
        file.flush().context("failed to flush event log")?;
        Ok(())
    }

    /// Return the last `last_n` events, most recent last. Malformed or
    /// partial lines are skipped with a debug log.
    pub fn iter_events(&self, last_n: usize) -> Vec<TelemetryEvent> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(last_n);

        let mut events = Vec::with_capacity(lines.len() - start);
        for ln in &lines[start..] {
            if ln.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TelemetryEvent>(ln) {
                Ok(e) => events.push(e),
                Err(_) => debug!("skipping malformed event line"),
            }
        }
        events
    }

    /// Project the `reward` values of the last `last_n` events, in log order.
    /// Events without a reward are skipped.
    pub fn rewards(&self, last_n: usize) -> Vec<f64> {
        self.iter_events(last_n)
            .into_iter()
            .filter_map(|e| e.reward)
            .collect()
    }

    /// Flush the underlying file. Called once more during shutdown.
    pub fn flush(&self) -> Result<()> {
        self.file.lock().flush().context("failed to flush event log")
    }
}
