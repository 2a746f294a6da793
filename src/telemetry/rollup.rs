// =============================================================================
// Telemetry Rollup — compact the event log into a per-agent summary
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::telemetry::EventLog;

/// Aggregate statistics for one agent over the whole log window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSummary {
    pub count: u64,
    pub avg_latency_ms: f64,
    pub total_cost_usd: f64,
    pub avg_reward: f64,
    pub error_rate: f64,
}

/// Rollup document written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollupSummary {
    pub generated_at: String,
    pub agents: BTreeMap<String, AgentSummary>,
}

/// Fold the last `last_n` events into per-agent summaries and write them to
/// `out_path` atomically (tmp + rename).
pub fn rollup(log: &EventLog, last_n: usize, out_path: impl AsRef<Path>) -> Result<RollupSummary> {
    struct Acc {
        count: u64,
        latency: u64,
        cost: f64,
        reward: f64,
        errors: u64,
    }

    let mut by_agent: BTreeMap<String, Acc> = BTreeMap::new();
    for e in log.iter_events(last_n) {
        let acc = by_agent.entry(e.agent.clone()).or_insert(Acc {
            count: 0,
            latency: 0,
            cost: 0.0,
            reward: 0.0,
            errors: 0,
        });
        acc.count += 1;
        acc.latency += e.latency_ms.unwrap_or(0);
        acc.cost += e.cost_usd.unwrap_or(0.0);
        acc.reward += e.reward.unwrap_or(0.0);
        if e.errors.unwrap_or(0) > 0 {
            acc.errors += 1;
        }
    }

    let agents = by_agent
        .into_iter()
        .map(|(agent, acc)| {
            let n = acc.count.max(1) as f64;
            (
                agent,
                AgentSummary {
                    count: acc.count,
                    avg_latency_ms: acc.latency as f64 / n,
                    total_cost_usd: acc.cost,
                    avg_reward: acc.reward / n,
                    error_rate: acc.errors as f64 / n,
                },
            )
        })
        .collect();

    let summary = RollupSummary {
        generated_at: Utc::now().to_rfc3339(),
        agents,
    };

    let out_path = out_path.as_ref();
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let content =
        serde_json::to_string_pretty(&summary).context("failed to serialise rollup summary")?;
    let tmp = out_path.with_extension("json.tmp");
    std::fs::write(&tmp, &content)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, out_path)
        .with_context(|| format!("failed to rename {}", tmp.display()))?;

    Ok(summary)
}
