// =============================================================================
// Runtime Configuration — environment tunables + JSON boot schedule
// =============================================================================
//
// Two layers:
//   1. RuntimeConfig — process-wide tunables read from the environment once
//      at startup (drawdown limit, UCB parameters, council quorum/timeout,
//      bind address, data directory).
//   2. BootSchedule — the per-agent schedule file (interval, enabled, weight,
//      run bounds, cluster membership), hot-saveable with an atomic
//      tmp + rename so a crash never corrupts it. Every field carries a
//      serde default so older files keep loading after upgrades.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."`)
// =============================================================================

fn default_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_weight() -> f64 {
    1.0
}

// =============================================================================
// Boot schedule
// =============================================================================

/// Per-agent boot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentScheduleEntry {
    /// Base interval in minutes.
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Disabled agents are registered but never ticked.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base capital weight before regime rotation.
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Guaranteed runs per rebalance window.
    #[serde(default)]
    pub min_runs: u32,

    /// Optional cap on runs per rebalance window.
    #[serde(default)]
    pub max_runs: Option<u32>,

    /// System agents bypass every run gate.
    #[serde(default)]
    pub system: bool,

    /// Findings from deal-producing agents spawn idempotent deal records.
    #[serde(default)]
    pub deal_producing: bool,
}

impl Default for AgentScheduleEntry {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            enabled: true,
            weight: default_weight(),
            min_runs: 0,
            max_runs: None,
            system: false,
            deal_producing: false,
        }
    }
}

/// The on-disk boot schedule: agents plus the static cluster partition used
/// by allocator substitution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootSchedule {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentScheduleEntry>,

    /// cluster name -> member agents. Substitution is lossless within a
    /// cluster and never crosses clusters.
    #[serde(default)]
    pub clusters: HashMap<String, Vec<String>>,
}

impl BootSchedule {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read schedule from {}", path.display()))?;
        let schedule: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse schedule from {}", path.display()))?;
        info!(
            path = %path.display(),
            agents = schedule.agents.len(),
            clusters = schedule.clusters.len(),
            "boot schedule loaded"
        );
        Ok(schedule)
    }

    /// Atomic save: write to a `.tmp` sibling, then rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise boot schedule")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write tmp schedule to {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename tmp schedule to {}", path.display()))?;
        info!(path = %path.display(), "boot schedule saved (atomic)");
        Ok(())
    }

    pub fn entry(&self, agent: &str) -> AgentScheduleEntry {
        self.agents.get(agent).cloned().unwrap_or_default()
    }

    pub fn base_weights(&self) -> HashMap<String, f64> {
        self.agents
            .iter()
            .map(|(name, entry)| {
                let w = if entry.enabled { entry.weight } else { 0.0 };
                (name.clone(), w)
            })
            .collect()
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Process-wide tunables, frozen at startup.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeConfig {
    /// Portfolio drawdown threshold (negative), `DRAWDOWN_LIMIT`.
    pub drawdown_limit: f64,
    /// UCB exploration coefficient, `UCB_EXPLORATION`.
    pub ucb_exploration: f64,
    /// Reward ring-buffer size, `UCB_WINDOW`.
    pub ucb_window: usize,
    /// Total run quota per rebalance, `RUN_BUDGET`.
    pub run_budget: u32,
    /// Per-LLM-call wall-clock cap in seconds, `LLM_COUNCIL_TIMEOUT_SEC`.
    pub llm_council_timeout_sec: u64,
    /// Vote quorum for a non-spike consensus, `LLM_COUNCIL_MIN_AGREE`.
    pub llm_council_min_agree: usize,
    /// Shutdown grace period in seconds, `ARGUS_GRACE_PERIOD_SEC`.
    pub grace_period_secs: u64,
    /// Admin API bind address, `ARGUS_BIND_ADDR`.
    pub bind_addr: String,
    /// Admin API bearer token, `ARGUS_ADMIN_TOKEN`. `None` rejects every
    /// authenticated request. Never serialised.
    #[serde(skip)]
    pub admin_token: Option<String>,
    /// Root directory for the store, event log, and boot files,
    /// `ARGUS_DATA_DIR`.
    pub data_dir: PathBuf,
    /// Symbols driving regime feature extraction.
    pub regime_symbols: RegimeSymbols,
}

/// Symbols the regime rotation job fetches.
#[derive(Debug, Clone, Serialize)]
pub struct RegimeSymbols {
    pub equity: String,
    pub volatility: String,
    pub rates: String,
    pub commodities: Option<String>,
}

impl Default for RegimeSymbols {
    fn default() -> Self {
        Self {
            equity: "SPY".to_string(),
            volatility: "VIX".to_string(),
            rates: "TNX".to_string(),
            commodities: None,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            drawdown_limit: -3.0,
            ucb_exploration: 1.5,
            ucb_window: 500,
            run_budget: 30,
            llm_council_timeout_sec: 20,
            llm_council_min_agree: 2,
            grace_period_secs: 30,
            bind_addr: "0.0.0.0:3001".to_string(),
            admin_token: None,
            data_dir: PathBuf::from("data"),
            regime_symbols: RegimeSymbols::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => warn!(key, value = %raw, "ignoring unparseable env override"),
        }
    }
}

impl RuntimeConfig {
    /// Build the config from defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        env_parse("DRAWDOWN_LIMIT", &mut cfg.drawdown_limit);
        env_parse("UCB_EXPLORATION", &mut cfg.ucb_exploration);
        env_parse("UCB_WINDOW", &mut cfg.ucb_window);
        env_parse("RUN_BUDGET", &mut cfg.run_budget);
        env_parse("LLM_COUNCIL_TIMEOUT_SEC", &mut cfg.llm_council_timeout_sec);
        env_parse("LLM_COUNCIL_MIN_AGREE", &mut cfg.llm_council_min_agree);
        env_parse("ARGUS_GRACE_PERIOD_SEC", &mut cfg.grace_period_secs);
        if let Ok(addr) = std::env::var("ARGUS_BIND_ADDR") {
            if !addr.is_empty() {
                cfg.bind_addr = addr;
            }
        }
        cfg.admin_token = std::env::var("ARGUS_ADMIN_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());
        if let Ok(dir) = std::env::var("ARGUS_DATA_DIR") {
            if !dir.is_empty() {
                cfg.data_dir = PathBuf::from(dir);
            }
        }

        // A positive drawdown limit is meaningless; flip it for the operator.
        if cfg.drawdown_limit > 0.0 {
            warn!(limit = cfg.drawdown_limit, "DRAWDOWN_LIMIT must be negative — negating");
            cfg.drawdown_limit = -cfg.drawdown_limit;
        }

        cfg
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("argus.db")
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join("telemetry/events.jsonl")
    }

    pub fn rollup_path(&self) -> PathBuf {
        self.data_dir.join("telemetry/summary.json")
    }

    pub fn schedule_path(&self) -> PathBuf {
        self.data_dir.join("agent_schedule.json")
    }

    pub fn regime_stats_path(&self) -> PathBuf {
        self.data_dir.join("agent_regime_stats.json")
    }

    pub fn startup_failures_path(&self) -> PathBuf {
        self.data_dir.join("startup_failures.json")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RuntimeConfig::default();
        assert!((cfg.drawdown_limit - -3.0).abs() < f64::EPSILON);
        assert!((cfg.ucb_exploration - 1.5).abs() < f64::EPSILON);
        assert_eq!(cfg.ucb_window, 500);
        assert_eq!(cfg.run_budget, 30);
        assert_eq!(cfg.llm_council_timeout_sec, 20);
        assert_eq!(cfg.llm_council_min_agree, 2);
        assert_eq!(cfg.grace_period_secs, 30);
        assert!(cfg.admin_token.is_none());
    }

    #[test]
    fn schedule_entry_defaults() {
        let entry: AgentScheduleEntry = serde_json::from_str("{}").unwrap();
        assert_eq!(entry.interval, 30);
        assert!(entry.enabled);
        assert!((entry.weight - 1.0).abs() < f64::EPSILON);
        assert_eq!(entry.min_runs, 0);
        assert!(entry.max_runs.is_none());
        assert!(!entry.system);
        assert!(!entry.deal_producing);
    }

    #[test]
    fn partial_schedule_json_fills_defaults() {
        let json = r#"{
            "agents": {
                "macro_watcher": {"interval": 60, "min_runs": 1},
                "arb_finder": {"interval": 5, "max_runs": 12, "deal_producing": true}
            },
            "clusters": {"macro": ["macro_watcher"]}
        }"#;
        let schedule: BootSchedule = serde_json::from_str(json).unwrap();
        assert_eq!(schedule.agents["macro_watcher"].interval, 60);
        assert_eq!(schedule.agents["macro_watcher"].min_runs, 1);
        assert!(schedule.agents["macro_watcher"].enabled);
        assert_eq!(schedule.agents["arb_finder"].max_runs, Some(12));
        assert!(schedule.agents["arb_finder"].deal_producing);
        assert_eq!(schedule.clusters["macro"], vec!["macro_watcher"]);
    }

    #[test]
    fn schedule_roundtrip_via_atomic_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_schedule.json");

        let mut schedule = BootSchedule::default();
        schedule
            .agents
            .insert("alpha".to_string(), AgentScheduleEntry::default());
        schedule.save(&path).unwrap();

        let reread = BootSchedule::load(&path).unwrap();
        assert!(reread.agents.contains_key("alpha"));
        // No tmp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn disabled_agents_have_zero_base_weight() {
        let mut schedule = BootSchedule::default();
        schedule.agents.insert(
            "on".to_string(),
            AgentScheduleEntry {
                weight: 0.8,
                ..Default::default()
            },
        );
        schedule.agents.insert(
            "off".to_string(),
            AgentScheduleEntry {
                enabled: false,
                weight: 0.9,
                ..Default::default()
            },
        );
        let weights = schedule.base_weights();
        assert!((weights["on"] - 0.8).abs() < f64::EPSILON);
        assert!((weights["off"] - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_agent_gets_default_entry() {
        let schedule = BootSchedule::default();
        let entry = schedule.entry("mystery");
        assert_eq!(entry.interval, 30);
        assert!(entry.enabled);
    }
}
