// =============================================================================
// Central Application State — Argus control plane
// =============================================================================
//
// The single source of truth shared across all async tasks via
// `Arc<AppState>`. Control-plane snapshots (regime, uncertainty, weights,
// allocation) follow a single-writer discipline: exactly one periodic job
// writes each slot, always publishing a fully computed value, so readers see
// either the old snapshot or the new one and never a mix.
//
// Thread safety:
//   - AtomicU64 for lock-free version tracking.
//   - parking_lot::RwLock for snapshot slots and ring buffers.
//   - parking_lot::Mutex for the allocator (one writer, exclusive).
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::allocator::{AllocationSnapshot, UcbAllocator, UcbConfig};
use crate::decay::{AgentDecayModel, RegimeHalfLives};
use crate::gate::GateOutcome;
use crate::governor::{DrawdownGovernor, RiskState};
use crate::heatmap::RegimeHeatmap;
use crate::regime::{RegimeSkillTable, RegimeSnapshot};
use crate::runtime_config::{BootSchedule, RuntimeConfig};
use crate::store::FindingsStore;
use crate::telemetry::EventLog;
use crate::uncertainty::UncertaintyControls;

/// Maximum retained error records.
const MAX_RECENT_ERRORS: usize = 50;
/// Maximum retained gate outcomes.
const MAX_RECENT_DECISIONS: usize = 100;

/// A recorded error event for the admin API error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub agent: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

// =============================================================================
// Control-plane snapshot slots
// =============================================================================

/// Read-mostly snapshot slots, each owned by exactly one writer job:
/// regime rotation writes `regime` + `regime_weights`, the uncertainty
/// update writes `uncertainty` + `agent_uncertainty`, the quarantine job
/// writes `quarantined`, and operators write `killed` through the API.
pub struct ControlPlane {
    pub regime: RwLock<RegimeSnapshot>,
    pub regime_weights: RwLock<HashMap<String, f64>>,
    pub uncertainty: RwLock<UncertaintyControls>,
    pub agent_uncertainty: RwLock<HashMap<String, f64>>,
    pub killed: RwLock<HashSet<String>>,
    pub quarantined: RwLock<HashSet<String>>,
}

impl ControlPlane {
    fn new() -> Self {
        Self {
            regime: RwLock::new(RegimeSnapshot::unknown()),
            regime_weights: RwLock::new(HashMap::new()),
            uncertainty: RwLock::new(UncertaintyControls::default()),
            agent_uncertainty: RwLock::new(HashMap::new()),
            killed: RwLock::new(HashSet::new()),
            quarantined: RwLock::new(HashSet::new()),
        }
    }

    pub fn regime_snapshot(&self) -> RegimeSnapshot {
        self.regime.read().clone()
    }

    pub fn uncertainty_snapshot(&self) -> UncertaintyControls {
        self.uncertainty.read().clone()
    }

    /// Effective regime weight for one agent; 1.0 while no rotation has
    /// published weights yet.
    pub fn regime_weight(&self, agent: &str) -> f64 {
        let weights = self.regime_weights.read();
        if weights.is_empty() {
            1.0
        } else {
            weights.get(agent).copied().unwrap_or(1.0)
        }
    }

    pub fn is_killed(&self, agent: &str) -> bool {
        self.killed.read().contains(agent) || self.quarantined.read().contains(agent)
    }
}

// =============================================================================
// AppState
// =============================================================================

pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    pub state_version: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub config: RuntimeConfig,
    pub schedule: RwLock<BootSchedule>,

    // ── Persistence ─────────────────────────────────────────────────────
    pub store: Arc<FindingsStore>,
    pub event_log: Arc<EventLog>,

    // ── Risk & control ──────────────────────────────────────────────────
    pub governor: Arc<DrawdownGovernor>,
    pub control: ControlPlane,

    // ── Meta models ─────────────────────────────────────────────────────
    pub decay: RwLock<AgentDecayModel>,
    pub heatmap: RwLock<RegimeHeatmap>,
    pub half_lives: RegimeHalfLives,
    pub skill_table: RwLock<RegimeSkillTable>,

    // ── Allocator (single writer: the rebalance job) ────────────────────
    pub allocator: Mutex<UcbAllocator>,
    pub allocation: RwLock<AllocationSnapshot>,

    // ── Audit rings ─────────────────────────────────────────────────────
    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub recent_decisions: RwLock<Vec<GateOutcome>>,

    // ── Timing ──────────────────────────────────────────────────────────
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        schedule: BootSchedule,
        store: Arc<FindingsStore>,
        event_log: Arc<EventLog>,
        skill_table: RegimeSkillTable,
    ) -> Self {
        let governor = Arc::new(DrawdownGovernor::new(
            event_log.clone(),
            config.drawdown_limit,
        ));
        let allocator = UcbAllocator::new(UcbConfig {
            window: config.ucb_window,
            exploration: config.ucb_exploration,
            ..Default::default()
        });

        Self {
            state_version: AtomicU64::new(1),
            schedule: RwLock::new(schedule),
            store,
            event_log,
            governor,
            control: ControlPlane::new(),
            decay: RwLock::new(AgentDecayModel::default()),
            heatmap: RwLock::new(RegimeHeatmap::default()),
            half_lives: RegimeHalfLives::from_env(),
            skill_table: RwLock::new(skill_table),
            allocator: Mutex::new(allocator),
            allocation: RwLock::new(AllocationSnapshot::default()),
            recent_errors: RwLock::new(Vec::new()),
            recent_decisions: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
            config,
        }
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Audit rings ─────────────────────────────────────────────────────

    pub fn push_error(&self, message: String, agent: Option<String>) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message,
            agent,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);
        self.increment_version();
    }

    pub fn push_decision(&self, outcome: GateOutcome) {
        let mut decisions = self.recent_decisions.write();
        decisions.push(outcome);
        while decisions.len() > MAX_RECENT_DECISIONS {
            decisions.remove(0);
        }
        drop(decisions);
        self.increment_version();
    }

    pub fn risk_state(&self) -> RiskState {
        self.governor.current()
    }

    // ── Snapshot builder ────────────────────────────────────────────────

    /// Full serialisable snapshot for `GET /api/v1/state`.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let agents = self.store.agent_statuses().unwrap_or_default();

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            regime: self.control.regime_snapshot(),
            uncertainty: self.control.uncertainty_snapshot(),
            risk: self.risk_state(),
            allocation: self.allocation.read().clone(),
            regime_weights: self.control.regime_weights.read().clone(),
            agents: agents.into_iter().map(AgentStatusView::from).collect(),
            recent_decisions: self.recent_decisions.read().clone(),
            recent_errors: self.recent_errors.read().clone(),
            heatmap: self.heatmap.read().snapshot(),
        }
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatusView {
    pub agent_name: String,
    pub is_active: bool,
    pub last_run: Option<String>,
    pub run_count: i64,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub schedule_interval: i64,
}

impl From<crate::store::AgentStatusRecord> for AgentStatusView {
    fn from(rec: crate::store::AgentStatusRecord) -> Self {
        Self {
            agent_name: rec.agent_name,
            is_active: rec.is_active,
            last_run: rec.last_run.map(|t| t.to_rfc3339()),
            run_count: rec.run_count,
            error_count: rec.error_count,
            last_error: rec.last_error,
            schedule_interval: rec.schedule_interval,
        }
    }
}

/// Full control-plane snapshot returned by the admin API.
#[derive(Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub regime: RegimeSnapshot,
    pub uncertainty: UncertaintyControls,
    pub risk: RiskState,
    pub allocation: AllocationSnapshot,
    pub regime_weights: HashMap<String, f64>,
    pub agents: Vec<AgentStatusView>,
    pub recent_decisions: Vec<GateOutcome>,
    pub recent_errors: Vec<ErrorRecord>,
    pub heatmap: std::collections::BTreeMap<String, crate::heatmap::HeatmapCell>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FindingsStore::open_in_memory().unwrap());
        let log = Arc::new(EventLog::open(dir.path().join("events.jsonl")).unwrap());
        let state = AppState::new(
            RuntimeConfig::default(),
            BootSchedule::default(),
            store,
            log,
            RegimeSkillTable::default(),
        );
        (dir, state)
    }

    #[test]
    fn version_increments() {
        let (_dir, state) = test_state();
        let v0 = state.current_state_version();
        state.increment_version();
        assert_eq!(state.current_state_version(), v0 + 1);
    }

    #[test]
    fn error_ring_is_capped() {
        let (_dir, state) = test_state();
        for i in 0..(MAX_RECENT_ERRORS + 10) {
            state.push_error(format!("err {i}"), None);
        }
        assert_eq!(state.recent_errors.read().len(), MAX_RECENT_ERRORS);
        // Oldest entries were evicted.
        assert!(state.recent_errors.read()[0].message.contains("10"));
    }

    #[test]
    fn regime_weight_defaults_to_one_before_rotation() {
        let (_dir, state) = test_state();
        assert!((state.control.regime_weight("anyone") - 1.0).abs() < f64::EPSILON);

        let mut weights = HashMap::new();
        weights.insert("muted".to_string(), 0.001);
        *state.control.regime_weights.write() = weights;
        assert!((state.control.regime_weight("muted") - 0.001).abs() < f64::EPSILON);
        // Agents missing from a published map default to 1.0.
        assert!((state.control.regime_weight("other") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn kill_list_includes_quarantine() {
        let (_dir, state) = test_state();
        assert!(!state.control.is_killed("a"));
        state.control.quarantined.write().insert("a".to_string());
        assert!(state.control.is_killed("a"));
    }

    #[test]
    fn snapshot_builds_with_defaults() {
        let (_dir, state) = test_state();
        let snapshot = state.build_snapshot();
        assert_eq!(snapshot.regime.active_regime, "unknown");
        assert!((snapshot.uncertainty.cadence_multiplier - 1.0).abs() < f64::EPSILON);
        assert!(!snapshot.risk.halt);
        assert!(snapshot.agents.is_empty());
    }
}
