// =============================================================================
// Decay Model — regime-indexed and reward-recency decay curves
// =============================================================================
//
// Two orthogonal decay signals are composed multiplicatively by the
// allocator:
//
//   1. Regime-indexed exponential decay on the number of steps an agent has
//      been tracked in the current regime: exp(-age / half_life(regime)).
//   2. Reward-recency decay from a per-agent performance history where each
//      update decays the previous value and adds the new reward. Higher
//      uncertainty accelerates the decay; positive rewards restore it.
//
// Both signals are bounded to [MIN_DECAY_FLOOR, 1.0].
// =============================================================================

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tracing::debug;

/// Lower bound for every decay multiplier.
pub const MIN_DECAY_FLOOR: f64 = 0.15;

/// Samples retained per agent in the recency model.
const HISTORY_CAP: usize = 1000;
/// Window used to normalise the model decay.
const NORMALISE_WINDOW: usize = 10;

// =============================================================================
// Regime half-lives
// =============================================================================

/// Per-regime half-life (in steps) for the regime-indexed decay curve.
/// Fast regimes forget fast: an agent idling through a shock loses weight
/// twelve times quicker than one idling through risk_on.
#[derive(Debug, Clone, Serialize)]
pub struct RegimeHalfLives {
    pub risk_on: f64,
    pub risk_off: f64,
    pub transition: f64,
    pub shock: f64,
    pub unknown: f64,
}

impl Default for RegimeHalfLives {
    fn default() -> Self {
        Self {
            risk_on: 120.0,
            risk_off: 40.0,
            transition: 20.0,
            shock: 10.0,
            unknown: 60.0,
        }
    }
}

impl RegimeHalfLives {
    /// Build the table from defaults plus `REGIME_HALF_LIFE_<REGIME>` env
    /// overrides.
    pub fn from_env() -> Self {
        let mut table = Self::default();
        let mut read = |key: &str, slot: &mut f64| {
            if let Ok(v) = std::env::var(key) {
                if let Ok(parsed) = v.parse::<f64>() {
                    if parsed > 0.0 {
                        *slot = parsed;
                    }
                }
            }
        };
        read("REGIME_HALF_LIFE_RISK_ON", &mut table.risk_on);
        read("REGIME_HALF_LIFE_RISK_OFF", &mut table.risk_off);
        read("REGIME_HALF_LIFE_TRANSITION", &mut table.transition);
        read("REGIME_HALF_LIFE_SHOCK", &mut table.shock);
        read("REGIME_HALF_LIFE_UNKNOWN", &mut table.unknown);
        table
    }

    pub fn for_regime(&self, regime: &str) -> f64 {
        match regime {
            "risk_on" => self.risk_on,
            "risk_off" => self.risk_off,
            "transition" => self.transition,
            "shock" => self.shock,
            _ => self.unknown,
        }
    }
}

/// Regime-indexed decay multiplier for an agent tracked `age_steps` steps in
/// `regime`. Bounded below by [`MIN_DECAY_FLOOR`].
pub fn decay_multiplier(age_steps: usize, regime: &str, table: &RegimeHalfLives) -> f64 {
    let half_life = table.for_regime(regime).max(1.0);
    (-(age_steps as f64) / half_life).exp().max(MIN_DECAY_FLOOR)
}

// =============================================================================
// Reward-recency model
// =============================================================================

/// Per-agent reward-recency decay model with uncertainty acceleration.
///
/// Owned behind a `RwLock` by the runtime; the scheduler writes one update
/// per run and the allocator reads the normalised decay at rebalance time.
pub struct AgentDecayModel {
    half_life: f64,
    default_rate: f64,
    rates: HashMap<String, f64>,
    history: HashMap<String, VecDeque<f64>>,
    uncertainty: HashMap<String, VecDeque<f64>>,
}

impl AgentDecayModel {
    pub fn new(half_life: f64) -> Self {
        Self {
            half_life: half_life.max(1.0),
            default_rate: 1.0,
            rates: HashMap::new(),
            history: HashMap::new(),
            uncertainty: HashMap::new(),
        }
    }

    /// Record one run outcome. The previous tracked value is decayed by
    /// `exp(-(ln 2 / half_life) * rate * (1 + uncertainty))` and the reward
    /// is added on top, so sustained positive rewards hold the curve up while
    /// silence (or errors) lets it sink.
    pub fn update(&mut self, agent: &str, reward: f64, uncertainty: f64) -> f64 {
        let rate = self.rate_for(agent);
        let uncertainty = uncertainty.clamp(0.0, 1.0);
        let lambda = (std::f64::consts::LN_2 / self.half_life) * rate * (1.0 + uncertainty);

        let prev = self
            .history
            .get(agent)
            .and_then(|h| h.back().copied())
            .unwrap_or(1.0);
        let next = prev * (-lambda).exp() + reward;

        push_capped(self.history.entry(agent.to_string()).or_default(), next);
        push_capped(
            self.uncertainty.entry(agent.to_string()).or_default(),
            uncertainty,
        );

        debug!(agent, reward, uncertainty, value = next, "decay model updated");
        next
    }

    /// Normalised decay in [MIN_DECAY_FLOOR, 1]: the current tracked value
    /// relative to the recent maximum. Agents with fewer than two samples get
    /// 1.0 (no evidence of decay yet).
    pub fn model_decay(&self, agent: &str) -> f64 {
        let series = match self.history.get(agent) {
            Some(h) if h.len() >= 2 => h,
            _ => return 1.0,
        };
        let recent: Vec<f64> = series
            .iter()
            .rev()
            .take(NORMALISE_WINDOW)
            .copied()
            .collect();
        let max = recent.iter().cloned().fold(f64::MIN, f64::max);
        let max = if max > 0.0 { max } else { 1.0 };
        let current = *series.back().unwrap_or(&0.0);
        (current / max).clamp(MIN_DECAY_FLOOR, 1.0)
    }

    /// Last `last_n` tracked values for an agent, oldest first.
    pub fn series(&self, agent: &str, last_n: usize) -> Vec<f64> {
        self.history
            .get(agent)
            .map(|h| {
                let skip = h.len().saturating_sub(last_n);
                h.iter().skip(skip).copied().collect()
            })
            .unwrap_or_default()
    }

    /// Tune the decay rate for one agent. Values below 1.0 slow decay,
    /// above 1.0 accelerate it; clamped to [0.01, 2.0].
    pub fn tune_rate(&mut self, agent: &str, rate: f64) {
        self.rates
            .insert(agent.to_string(), rate.clamp(0.01, 2.0));
    }

    fn rate_for(&self, agent: &str) -> f64 {
        self.rates.get(agent).copied().unwrap_or(self.default_rate)
    }
}

impl Default for AgentDecayModel {
    fn default() -> Self {
        Self::new(200.0)
    }
}

fn push_capped(buf: &mut VecDeque<f64>, value: f64) {
    buf.push_back(value);
    while buf.len() > HISTORY_CAP {
        buf.pop_front();
    }
}
