// =============================================================================
// Drawdown Governor — portfolio circuit breaker from the telemetry log
// =============================================================================
//
// The reward stream is folded into an equity curve; the governor compares the
// worst peak-to-trough drawdown against a configured (negative) limit:
//
//   dd <= 1.5 * limit  => hard halt  (risk_multiplier = 0)
//   dd <= limit        => soft throttle
//                         risk_multiplier = max(0.2, 1 - (|dd|-|limit|)/(0.5*|limit|))
//   otherwise          => ok (risk_multiplier = 1)
//
// The assessment is a pure function of the log prefix and the limit, so the
// same history always yields the same decision. Fewer than 50 reward points
// is treated as insufficient history and reports ok.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::telemetry::EventLog;

/// Minimum number of reward points before the governor starts judging.
const MIN_HISTORY: usize = 50;
/// How many trailing events to fold into the equity curve.
const EVENT_WINDOW: usize = 5000;

/// Outcome of a drawdown assessment. Exactly one of ok / soft-throttle /
/// hard-halt holds: ok ⇔ multiplier 1, halt ⇔ multiplier 0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskState {
    pub ok: bool,
    /// Worst drawdown observed (negative or zero).
    pub dd: f64,
    /// Capital multiplier in [0, 1] applied by the allocator.
    pub risk_multiplier: f64,
    pub halt: bool,
}

impl Default for RiskState {
    fn default() -> Self {
        Self {
            ok: true,
            dd: 0.0,
            risk_multiplier: 1.0,
            halt: false,
        }
    }
}

/// Pure drawdown assessment over a reward history.
pub fn assess(rewards: &[f64], dd_limit: f64) -> RiskState {
    if rewards.len() < MIN_HISTORY {
        return RiskState::default();
    }

    let dd = max_drawdown(rewards);

    if dd <= dd_limit * 1.5 {
        warn!(dd, limit = dd_limit, "catastrophic drawdown — hard halt");
        return RiskState {
            ok: false,
            dd,
            risk_multiplier: 0.0,
            halt: true,
        };
    }

    if dd <= dd_limit {
        let span = (dd_limit * 0.5).abs().max(1e-9);
        let over = dd.abs() - dd_limit.abs();
        let mult = (1.0 - over / span).max(0.2);
        warn!(dd, multiplier = mult, "drawdown breach — soft throttle");
        return RiskState {
            ok: false,
            dd,
            risk_multiplier: mult,
            halt: false,
        };
    }

    RiskState {
        ok: true,
        dd,
        risk_multiplier: 1.0,
        halt: false,
    }
}

/// Worst drawdown of the equity curve implied by `rewards` (left fold of the
/// reward stream). Returns a value <= 0.
pub fn max_drawdown(rewards: &[f64]) -> f64 {
    let mut equity = 0.0;
    let mut peak = f64::NEG_INFINITY;
    let mut mdd = 0.0;
    for r in rewards {
        equity += r;
        if equity > peak {
            peak = equity;
        }
        let dd = equity - peak;
        if dd < mdd {
            mdd = dd;
        }
    }
    mdd
}

/// Shared governor: re-assesses from the event log on demand and caches the
/// latest state for cheap reads from the scheduler gate and the API.
pub struct DrawdownGovernor {
    log: Arc<EventLog>,
    dd_limit: f64,
    state: RwLock<RiskState>,
}

impl DrawdownGovernor {
    pub fn new(log: Arc<EventLog>, dd_limit: f64) -> Self {
        Self {
            log,
            dd_limit,
            state: RwLock::new(RiskState::default()),
        }
    }

    /// Recompute from the last [`EVENT_WINDOW`] events and publish the result.
    pub fn refresh(&self) -> RiskState {
        let rewards = self.log.rewards(EVENT_WINDOW);
        let next = assess(&rewards, self.dd_limit);
        *self.state.write() = next;
        next
    }

    /// Latest published state without touching the log.
    pub fn current(&self) -> RiskState {
        *self.state.read()
    }

    pub fn dd_limit(&self) -> f64 {
        self.dd_limit
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Pad a reward history to the minimum sample count without moving the
    /// equity curve.
    fn padded(mut rewards: Vec<f64>) -> Vec<f64> {
        while rewards.len() < MIN_HISTORY {
            rewards.push(0.0);
        }
        rewards
    }

    #[test]
    fn insufficient_history_is_ok() {
        let state = assess(&[-10.0; 10], -3.0);
        assert!(state.ok);
        assert!(!state.halt);
        assert!((state.risk_multiplier - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn flat_history_is_ok() {
        let state = assess(&padded(vec![]), -3.0);
        assert!(state.ok);
        assert!((state.dd - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn soft_throttle_scenario() {
        // Equity climbs to +10, declines to +6.5 => dd = -3.5 with limit -3.0.
        let mut rewards = vec![1.0; 10];
        rewards.push(-3.5);
        let state = assess(&padded(rewards), -3.0);

        assert!(!state.ok);
        assert!(!state.halt);
        assert!((state.dd - -3.5).abs() < 1e-9);
        // 1 - (0.5 / 1.5) = 0.666...
        assert!((state.risk_multiplier - (1.0 - 0.5 / 1.5)).abs() < 1e-9);
        assert!(state.risk_multiplier >= 0.2 && state.risk_multiplier < 1.0);
    }

    #[test]
    fn hard_halt_scenario() {
        // Equity climbs to +10, declines to +5.0 => dd = -5.0 <= 1.5 * -3.0.
        let mut rewards = vec![1.0; 10];
        rewards.push(-5.0);
        let state = assess(&padded(rewards), -3.0);

        assert!(state.halt);
        assert!(!state.ok);
        assert!((state.risk_multiplier - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn exactly_at_limit_is_soft_throttle_boundary() {
        let mut rewards = vec![1.0; 10];
        rewards.push(-3.0);
        let state = assess(&padded(rewards), -3.0);

        // dd == limit trips the soft branch with multiplier at the top of the
        // band (== 1.0 from above).
        assert!(!state.halt);
        assert!((state.risk_multiplier - 1.0).abs() < 1e-9);
    }

    #[test]
    fn multiplier_floor_is_point_two() {
        // Deep but not catastrophic: dd = -4.4 with limit -3.0 (1.5x = -4.5).
        let mut rewards = vec![1.0; 10];
        rewards.push(-4.4);
        let state = assess(&padded(rewards), -3.0);

        assert!(!state.halt);
        assert!((state.risk_multiplier - 0.2).abs() < 1e-9);
    }

    #[test]
    fn assessment_is_idempotent() {
        let mut rewards = vec![0.5; 30];
        rewards.extend([-2.0, 1.0, -1.5, 0.2]);
        let rewards = padded(rewards);
        let a = assess(&rewards, -2.5);
        let b = assess(&rewards, -2.5);
        assert_eq!(a.dd.to_bits(), b.dd.to_bits());
        assert_eq!(a.risk_multiplier.to_bits(), b.risk_multiplier.to_bits());
        assert_eq!(a.halt, b.halt);
    }

    #[test]
    fn max_drawdown_tracks_running_peak() {
        // Equity: 1, 3, 2, 5, 1 => worst dd = 1 - 5 = -4.
        let rewards = [1.0, 2.0, -1.0, 3.0, -4.0];
        assert!((max_drawdown(&rewards) - -4.0).abs() < 1e-12);
    }

    #[test]
    fn governor_refresh_reads_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(EventLog::open(dir.path().join("events.jsonl")).unwrap());
        for r in padded(vec![1.0; 10]).into_iter().chain([-5.0]) {
            let mut e = crate::telemetry::TelemetryEvent::now("a");
            e.reward = Some(r);
            log.append(&e).unwrap();
        }

        let gov = DrawdownGovernor::new(log, -3.0);
        assert!(!gov.current().halt); // default before refresh
        let state = gov.refresh();
        assert!(state.halt);
        assert!(gov.current().halt);
    }
}
