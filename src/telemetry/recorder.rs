// =============================================================================
// Run Recorder — telemetry wrapper around a single agent run
// =============================================================================
//
// Every scheduled run is bracketed by a recorder: it assigns a UUID run id,
// measures wall-clock latency, and emits exactly one telemetry event when
// finished. The reward proxy for a successful run is the number of findings
// produced; a failed run records reward -1 and an error flag.
// =============================================================================

use std::time::Instant;

use tracing::warn;
use uuid::Uuid;

use crate::telemetry::{EventLog, TelemetryEvent};

/// In-flight recording for one agent run.
pub struct RunRecorder {
    agent: String,
    run_id: String,
    started: Instant,
}

impl RunRecorder {
    pub fn start(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            run_id: Uuid::new_v4().to_string(),
            started: Instant::now(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Record a successful run with `findings` used as the reward proxy.
    pub fn finish_ok(self, log: &EventLog, findings: usize) {
        self.emit(log, Some(findings as f64), None);
    }

    /// Record a failed run. Reward -1 feeds the decay model's penalty path.
    pub fn finish_err(self, log: &EventLog) {
        self.emit(log, Some(-1.0), Some(1));
    }

    fn emit(self, log: &EventLog, reward: Option<f64>, errors: Option<u32>) {
        let mut event = TelemetryEvent::now(&self.agent);
        event.reward = reward;
        event.latency_ms = Some(self.started.elapsed().as_millis() as u64);
        event.errors = errors;
        event.run_id = Some(self.run_id);

        // Telemetry must never fail a run.
        if let Err(e) = log.append(&event) {
            warn!(agent = %self.agent, error = %e, "failed to append run telemetry");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_run_records_reward_and_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path().join("events.jsonl")).unwrap();

        let rec = RunRecorder::start("alpha");
        let id = rec.run_id().to_string();
        rec.finish_ok(&log, 3);

        let events = log.iter_events(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reward, Some(3.0));
        assert_eq!(events[0].errors, None);
        assert_eq!(events[0].run_id.as_deref(), Some(id.as_str()));
        assert!(events[0].latency_ms.is_some());
    }

    #[test]
    fn failed_run_records_error_flag() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path().join("events.jsonl")).unwrap();

        RunRecorder::start("alpha").finish_err(&log);

        let events = log.iter_events(10);
        assert_eq!(events[0].reward, Some(-1.0));
        assert_eq!(events[0].errors, Some(1));
    }

    #[test]
    fn run_ids_are_unique() {
        let a = RunRecorder::start("x");
        let b = RunRecorder::start("x");
        assert_ne!(a.run_id(), b.run_id());
    }
}
