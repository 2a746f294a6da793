// =============================================================================
// Telemetry — append-only event log, rollups, and the per-run recorder
// =============================================================================

pub mod event_log;
pub mod recorder;
pub mod rollup;

pub use event_log::{EventLog, TelemetryEvent};
pub use recorder::RunRecorder;
