// =============================================================================
// Regime Heatmap — agent × regime reward accumulation
// =============================================================================
//
// Tracks how each agent performs in each regime. The scheduler feeds one
// sample per run (findings count, or -1 on failure); the API exposes the
// aggregate for the dashboard and the quarantine job reads per-cell failure
// streaks.
// =============================================================================

use std::collections::BTreeMap;

use serde::Serialize;

/// One (agent, regime) cell.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HeatmapCell {
    pub samples: u64,
    pub total_reward: f64,
    pub failures: u64,
    /// Consecutive non-positive samples, reset by any positive reward.
    pub failure_streak: u64,
}

impl HeatmapCell {
    pub fn mean_reward(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.total_reward / self.samples as f64
        }
    }
}

/// Agent × regime reward heatmap. Wrapped in a `RwLock` by the owner.
#[derive(Debug, Default)]
pub struct RegimeHeatmap {
    cells: BTreeMap<(String, String), HeatmapCell>,
}

impl RegimeHeatmap {
    pub fn update(&mut self, agent: &str, regime: &str, reward: f64) {
        let cell = self
            .cells
            .entry((agent.to_string(), regime.to_string()))
            .or_default();
        cell.samples += 1;
        cell.total_reward += reward;
        if reward <= 0.0 {
            cell.failures += 1;
            cell.failure_streak += 1;
        } else {
            cell.failure_streak = 0;
        }
    }

    pub fn cell(&self, agent: &str, regime: &str) -> Option<&HeatmapCell> {
        self.cells.get(&(agent.to_string(), regime.to_string()))
    }

    /// Serialisable view keyed `agent/regime`.
    pub fn snapshot(&self) -> BTreeMap<String, HeatmapCell> {
        self.cells
            .iter()
            .map(|((a, r), cell)| (format!("{a}/{r}"), cell.clone()))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_per_cell() {
        let mut map = RegimeHeatmap::default();
        map.update("a", "risk_on", 3.0);
        map.update("a", "risk_on", 1.0);
        map.update("a", "shock", -1.0);

        let cell = map.cell("a", "risk_on").unwrap();
        assert_eq!(cell.samples, 2);
        assert!((cell.mean_reward() - 2.0).abs() < 1e-12);
        assert_eq!(cell.failures, 0);

        let shock = map.cell("a", "shock").unwrap();
        assert_eq!(shock.failures, 1);
    }

    #[test]
    fn failure_streak_resets_on_positive() {
        let mut map = RegimeHeatmap::default();
        map.update("a", "shock", -1.0);
        map.update("a", "shock", 0.0);
        assert_eq!(map.cell("a", "shock").unwrap().failure_streak, 2);
        map.update("a", "shock", 2.0);
        assert_eq!(map.cell("a", "shock").unwrap().failure_streak, 0);
    }
}
