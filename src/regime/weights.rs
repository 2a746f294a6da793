// =============================================================================
// Regime Weight Rotation — per-agent skill lookup under the active regime
// =============================================================================
//
// A static JSON stats file maps agent → regime → {mean_return, hit_rate}.
// Rotation scales each agent's base weight by
//
//   max(mean_return, 0) * hit_rate * regime_confidence
//
// and mutes agents with no recorded edge in the active regime (weight 0).
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::regime::RegimeSnapshot;

/// Recorded performance of one agent in one regime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SkillStat {
    pub mean_return: f64,
    pub hit_rate: f64,
}

/// agent → regime → skill stats, loaded from a boot-time JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegimeSkillTable {
    pub stats: HashMap<String, HashMap<String, SkillStat>>,
}

impl RegimeSkillTable {
    /// Load the table from `path`; a missing file yields an empty table (all
    /// agents muted under rotation until stats exist).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "regime skill stats missing — rotation will mute all agents");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read regime stats from {}", path.display()))?;
        let table: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse regime stats from {}", path.display()))?;
        info!(path = %path.display(), agents = table.stats.len(), "regime skill stats loaded");
        Ok(table)
    }

    pub fn get(&self, agent: &str, regime: &str) -> Option<SkillStat> {
        self.stats.get(agent).and_then(|m| m.get(regime)).copied()
    }
}

/// Rotate base weights into effective regime weights. Agents without stats
/// for the active regime get weight 0; under the `unknown` regime the base
/// weights pass through unchanged (the classifier had nothing to say).
pub fn rotate_weights(
    base_weights: &HashMap<String, f64>,
    snapshot: &RegimeSnapshot,
    table: &RegimeSkillTable,
) -> HashMap<String, f64> {
    if snapshot.active_regime == "unknown" {
        return base_weights.clone();
    }

    base_weights
        .iter()
        .map(|(agent, &base)| {
            let weight = match table.get(agent, &snapshot.active_regime) {
                Some(stat) => {
                    base * stat.mean_return.max(0.0) * stat.hit_rate * snapshot.confidence
                }
                None => 0.0,
            };
            (agent.clone(), weight)
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot(regime: &str, confidence: f64) -> RegimeSnapshot {
        RegimeSnapshot {
            active_regime: regime.to_string(),
            confidence,
            transition: false,
            distribution: BTreeMap::new(),
            asof: chrono::Utc::now(),
        }
    }

    fn table() -> RegimeSkillTable {
        let json = serde_json::json!({
            "momentum": {
                "risk_on": {"mean_return": 0.02, "hit_rate": 0.6},
                "risk_off": {"mean_return": -0.01, "hit_rate": 0.4}
            },
            "macro": {
                "risk_on": {"mean_return": 0.01, "hit_rate": 0.5}
            }
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn rotation_scales_by_skill_and_confidence() {
        let mut base = HashMap::new();
        base.insert("momentum".to_string(), 1.0);
        base.insert("macro".to_string(), 2.0);

        let rotated = rotate_weights(&base, &snapshot("risk_on", 0.8), &table());
        assert!((rotated["momentum"] - 1.0 * 0.02 * 0.6 * 0.8).abs() < 1e-12);
        assert!((rotated["macro"] - 2.0 * 0.01 * 0.5 * 0.8).abs() < 1e-12);
    }

    #[test]
    fn negative_mean_return_mutes_agent() {
        let mut base = HashMap::new();
        base.insert("momentum".to_string(), 1.0);
        let rotated = rotate_weights(&base, &snapshot("risk_off", 0.9), &table());
        assert!((rotated["momentum"] - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_stats_give_zero_weight() {
        let mut base = HashMap::new();
        base.insert("macro".to_string(), 1.0);
        let rotated = rotate_weights(&base, &snapshot("risk_off", 0.9), &table());
        assert!((rotated["macro"] - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_regime_passes_base_weights_through() {
        let mut base = HashMap::new();
        base.insert("momentum".to_string(), 0.7);
        let rotated = rotate_weights(&base, &RegimeSnapshot::unknown(), &table());
        assert!((rotated["momentum"] - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_stats_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let table = RegimeSkillTable::load(dir.path().join("nope.json")).unwrap();
        assert!(table.stats.is_empty());
    }
}
