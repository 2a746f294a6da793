// =============================================================================
// UCB Run Allocator — uncertainty-aware bandit over the agent fleet
// =============================================================================
//
// Each agent's score is an upper-confidence-bound estimate damped by a
// product of decay signals:
//
//   mean_i  = mean(recent rewards)
//   bonus_i = exploration * sqrt(ln(T) / n_i)
//   decay_i = recency * model * regime * global * uncertainty
//   score_i = decay_i * (mean_i + bonus_i)
//
// Redundant agents (binary firing vectors correlating >= 0.85 with an
// earlier agent) are penalised x0.3 before quota assignment. Quotas start
// from per-agent minimums and the remaining budget is distributed round-
// robin in descending score order, respecting per-agent maximums.
// =============================================================================

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::Serialize;
use tracing::{debug, info};

use crate::decay::{decay_multiplier, AgentDecayModel, RegimeHalfLives, MIN_DECAY_FLOOR};
use crate::telemetry::TelemetryEvent;

/// Score multiplier for agents flagged as redundant.
const REDUNDANCY_PENALTY: f64 = 0.3;
/// Pearson correlation at or above which two firing vectors are redundant.
const REDUNDANCY_CORRELATION: f64 = 0.85;
/// Minimum shared samples before a correlation is trusted.
const REDUNDANCY_MIN_SAMPLES: usize = 20;
/// Findings window for the firing-vector correlation.
pub const REDUNDANCY_LOOKBACK: usize = 300;
/// Agents below this effective weight are excluded from the run entirely.
pub const WEIGHT_EPSILON: f64 = 0.01;

/// Allocator tunables, sourced from the environment by the runtime config.
#[derive(Debug, Clone, Copy)]
pub struct UcbConfig {
    /// Reward ring-buffer size per agent.
    pub window: usize,
    /// Exploration bonus coefficient.
    pub exploration: f64,
    /// Half-life (in observations) for the last-positive recency decay.
    pub half_life: f64,
    /// Agents with fewer recorded rewards than this are skipped by scoring.
    pub min_signals: usize,
}

impl Default for UcbConfig {
    fn default() -> Self {
        Self {
            window: 500,
            exploration: 1.5,
            half_life: 200.0,
            min_signals: 15,
        }
    }
}

/// Published result of one rebalance pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AllocationSnapshot {
    pub scores: BTreeMap<String, f64>,
    pub quotas: BTreeMap<String, u32>,
    pub effective_budget: u32,
    pub redundant: Vec<String>,
    /// Capital weights after regime rotation, the drawdown risk multiplier,
    /// and cluster substitution.
    pub weights: BTreeMap<String, f64>,
}

/// Uncertainty-aware UCB allocator. Single writer (the rebalance job).
pub struct UcbAllocator {
    cfg: UcbConfig,
    /// Exploration coefficient, damped multiplicatively during spikes.
    pub exploration: f64,
    rewards: HashMap<String, VecDeque<f64>>,
    counts: HashMap<String, u64>,
    last_positive: HashMap<String, u64>,
    global_decay_multiplier: f64,
}

impl UcbAllocator {
    pub fn new(cfg: UcbConfig) -> Self {
        Self {
            exploration: cfg.exploration,
            cfg,
            rewards: HashMap::new(),
            counts: HashMap::new(),
            last_positive: HashMap::new(),
            global_decay_multiplier: 1.0,
        }
    }

    /// Fold telemetry events into the per-agent reward windows.
    pub fn ingest_events(&mut self, events: &[TelemetryEvent]) {
        for e in events {
            let Some(reward) = e.reward else { continue };
            let buf = self.rewards.entry(e.agent.clone()).or_default();
            buf.push_back(reward);
            while buf.len() > self.cfg.window {
                buf.pop_front();
            }
            let count = self.counts.entry(e.agent.clone()).or_insert(0);
            *count += 1;
            if reward > 0.0 {
                self.last_positive.insert(e.agent.clone(), *count);
            }
        }
    }

    pub fn observed_rewards(&self, agent: &str) -> usize {
        self.rewards.get(agent).map(|r| r.len()).unwrap_or(0)
    }

    /// Exponential decay on the distance from the last positive outcome.
    fn recency_decay(&self, agent: &str) -> f64 {
        let Some(&last_good) = self.last_positive.get(agent) else {
            return MIN_DECAY_FLOOR;
        };
        let count = self.counts.get(agent).copied().unwrap_or(0);
        let age = count.saturating_sub(last_good) as f64;
        let decay = (-std::f64::consts::LN_2 * age / self.cfg.half_life.max(1.0)).exp();
        decay.max(MIN_DECAY_FLOOR)
    }

    /// UCB score for one agent under the full decay product.
    #[allow(clippy::too_many_arguments)]
    pub fn score(
        &self,
        agent: &str,
        total_pulls: u64,
        uncertainty: f64,
        regime: &str,
        decay_model: &AgentDecayModel,
        half_lives: &RegimeHalfLives,
    ) -> f64 {
        let rewards = self.rewards.get(agent);
        let n = self.counts.get(agent).copied().unwrap_or(0).max(1) as f64;

        let mean = rewards
            .filter(|r| !r.is_empty())
            .map(|r| r.iter().sum::<f64>() / r.len() as f64)
            .unwrap_or(0.0);

        let bonus = self.exploration * ((total_pulls.max(2) as f64).ln() / n).sqrt();

        let age = self.observed_rewards(agent);
        let decay = self.recency_decay(agent)
            * decay_model.model_decay(agent)
            * decay_multiplier(age, regime, half_lives)
            * self.global_decay_multiplier
            * (1.0 - uncertainty).max(0.2);

        decay * (mean + bonus)
    }

    /// Allocate `total_budget_runs` across `agents`.
    ///
    /// Scores are computed under the decay product; agents with fewer than
    /// `min_signals` observed rewards are excluded from scoring and keep
    /// only their `min_runs` floor. Ties in the fill order break toward the
    /// agent with the lower historical run count.
    #[allow(clippy::too_many_arguments)]
    pub fn allocate(
        &mut self,
        agents: &[String],
        min_runs: &HashMap<String, u32>,
        max_runs: &HashMap<String, u32>,
        total_budget_runs: u32,
        uncertainty_decay: f64,
        agent_uncertainty: &HashMap<String, f64>,
        regime: &str,
        redundant: &HashSet<String>,
        decay_model: &AgentDecayModel,
        half_lives: &RegimeHalfLives,
    ) -> (BTreeMap<String, u32>, BTreeMap<String, f64>) {
        self.global_decay_multiplier = uncertainty_decay;

        let total_pulls: u64 = agents
            .iter()
            .map(|a| self.counts.get(a).copied().unwrap_or(0))
            .sum::<u64>()
            + 1;

        let mut scores: BTreeMap<String, f64> = BTreeMap::new();
        for agent in agents {
            let base = self.score(
                agent,
                total_pulls,
                agent_uncertainty.get(agent).copied().unwrap_or(0.0),
                regime,
                decay_model,
                half_lives,
            );
            let score = if redundant.contains(agent) {
                base * REDUNDANCY_PENALTY
            } else {
                base
            };
            scores.insert(agent.clone(), score);
        }

        let mut quotas: BTreeMap<String, u32> = agents
            .iter()
            .map(|a| (a.clone(), min_runs.get(a).copied().unwrap_or(0)))
            .collect();
        let assigned: u32 = quotas.values().sum();
        let mut remaining = total_budget_runs.saturating_sub(assigned);

        // Eligible agents ranked by score descending; ties go to the agent
        // with fewer historical runs, then by name for determinism.
        let mut ranked: Vec<&String> = agents
            .iter()
            .filter(|a| self.observed_rewards(a) >= self.cfg.min_signals)
            .collect();
        ranked.sort_by(|a, b| {
            scores[*b]
                .partial_cmp(&scores[*a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let ca = self.counts.get(*a).copied().unwrap_or(0);
                    let cb = self.counts.get(*b).copied().unwrap_or(0);
                    ca.cmp(&cb)
                })
                .then_with(|| a.cmp(b))
        });

        let mut i = 0;
        let mut stalled = 0;
        while remaining > 0 && !ranked.is_empty() {
            let agent = ranked[i % ranked.len()];
            let cap = max_runs.get(agent).copied().unwrap_or(total_budget_runs);
            let quota = quotas.get_mut(agent).expect("quota entry exists");
            if *quota < cap {
                *quota += 1;
                remaining -= 1;
                stalled = 0;
            } else {
                stalled += 1;
                // Everyone is at max; budget cannot be placed.
                if stalled >= ranked.len() {
                    break;
                }
            }
            i += 1;
        }

        debug!(
            budget = total_budget_runs,
            unplaced = remaining,
            regime,
            "allocation pass complete"
        );

        (quotas, scores)
    }
}

// =============================================================================
// Redundancy detection
// =============================================================================

/// Pearson correlation of two equal-length series.
fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a).powi(2);
        var_b += (y - mean_b).powi(2);
    }
    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

/// Find agents whose binary firing vectors correlate too highly with an
/// earlier agent. `firings` is (agent, timestamp-bucket) pairs, oldest
/// first, from the findings store. When a pair correlates, the later agent
/// (by sort order) is the redundant one.
pub fn find_redundant_agents(firings: &[(String, String)]) -> HashSet<String> {
    // Binary vector per agent across distinct time buckets.
    let mut buckets: Vec<&String> = Vec::new();
    let mut seen_buckets: HashSet<&String> = HashSet::new();
    for (_, ts) in firings {
        if seen_buckets.insert(ts) {
            buckets.push(ts);
        }
    }
    let mut fired: HashMap<&String, HashSet<&String>> = HashMap::new();
    for (agent, ts) in firings {
        fired.entry(agent).or_default().insert(ts);
    }

    let mut agents: Vec<&String> = fired.keys().copied().collect();
    agents.sort();

    let vectors: HashMap<&String, Vec<f64>> = agents
        .iter()
        .map(|agent| {
            let set = &fired[*agent];
            let v: Vec<f64> = buckets
                .iter()
                .map(|ts| if set.contains(*ts) { 1.0 } else { 0.0 })
                .collect();
            (*agent, v)
        })
        .collect();

    let mut redundant = HashSet::new();
    for (i, a1) in agents.iter().enumerate() {
        for a2 in agents.iter().skip(i + 1) {
            let v1 = &vectors[*a1];
            let v2 = &vectors[*a2];
            if v1.len() < REDUNDANCY_MIN_SAMPLES {
                continue;
            }
            if let Some(corr) = pearson(v1, v2) {
                if corr >= REDUNDANCY_CORRELATION {
                    debug!(kept = %a1, redundant = %a2, corr, "redundant agent pair");
                    redundant.insert((*a2).clone());
                }
            }
        }
    }
    redundant
}

// =============================================================================
// Fail-first penalty
// =============================================================================

/// Quota multiplier for agents that the council keeps voting IGNORE on in
/// the active regime. Only bites under uncertainty >= 0.5 and fail rates
/// above 0.2; bounded below by 0.5.
pub fn fail_first_multiplier(fail_rate: f64, uncertainty: f64) -> f64 {
    if uncertainty < 0.5 || fail_rate <= 0.2 {
        return 1.0;
    }
    let uncertainty_factor = ((uncertainty - 0.5) / 0.5).min(1.0);
    (1.0 - fail_rate * 0.5 * uncertainty_factor).max(0.5)
}

// =============================================================================
// Cluster substitution
// =============================================================================

/// Redistribute the weight of effectively-muted agents (< [`WEIGHT_EPSILON`])
/// to the best-weighted member of the same cluster. Lossless within a
/// cluster; never across clusters; weight with no viable recipient is kept
/// in place.
pub fn apply_substitution(
    weights: &HashMap<String, f64>,
    clusters: &HashMap<String, Vec<String>>,
) -> HashMap<String, f64> {
    let mut adjusted = weights.clone();

    for members in clusters.values() {
        // Best performer: the member currently carrying the highest weight.
        let best = members
            .iter()
            .filter(|m| adjusted.get(*m).copied().unwrap_or(0.0) >= WEIGHT_EPSILON)
            .max_by(|a, b| {
                let wa = adjusted.get(*a).copied().unwrap_or(0.0);
                let wb = adjusted.get(*b).copied().unwrap_or(0.0);
                wa.partial_cmp(&wb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned();

        let Some(best) = best else { continue };

        for member in members {
            if *member == best {
                continue;
            }
            let w = adjusted.get(member).copied().unwrap_or(0.0);
            if w > 0.0 && w < WEIGHT_EPSILON {
                *adjusted.entry(best.clone()).or_insert(0.0) += w;
                adjusted.insert(member.clone(), 0.0);
                info!(from = %member, to = %best, weight = w, "cluster substitution");
            }
        }
    }

    adjusted
}

/// Effective run budget after the uncertainty decay multiplier.
pub fn effective_budget(base_budget: u32, decay_multiplier: f64) -> u32 {
    ((base_budget as f64 * decay_multiplier).round() as u32).max(10)
}
