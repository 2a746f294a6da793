// =============================================================================
// Agent Contract — the pluggable analysis interface
// =============================================================================
//
// An agent is anything that can look at the world and return finding drafts.
// The scheduler owns everything else: gating, telemetry, persistence, and
// post-run side effects. Agents must not block indefinitely; any error is
// caught by the scheduler, recorded, and counted.
// =============================================================================

pub mod price_watch;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::store::FindingsStore;
use crate::types::FindingDraft;

pub use price_watch::PriceWatchAgent;

/// Capability interface implemented by every market-signal agent.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;
    async fn analyze(&self) -> Result<Vec<FindingDraft>>;
}

/// Simple name-keyed agent registry handed to the scheduler at boot.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        debug!(agent = agent.name(), "agent registered");
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }
}

// =============================================================================
// Post-run hooks
// =============================================================================

/// Side effect invoked after a run's findings are committed. Hooks are
/// best-effort: a hook failure is logged and never fails the run.
pub trait PostRunHook: Send + Sync {
    fn name(&self) -> &str;
    fn after_findings(&self, agent: &str, finding_ids: &[i64]) -> Result<()>;
}

/// Creates one deal record per finding for deal-producing agents,
/// idempotent on the finding id.
pub struct DealHook {
    store: Arc<FindingsStore>,
    deal_agents: std::collections::HashSet<String>,
}

impl DealHook {
    pub fn new(store: Arc<FindingsStore>, deal_agents: impl IntoIterator<Item = String>) -> Self {
        Self {
            store,
            deal_agents: deal_agents.into_iter().collect(),
        }
    }
}

impl PostRunHook for DealHook {
    fn name(&self) -> &str {
        "deal_hook"
    }

    fn after_findings(&self, agent: &str, finding_ids: &[i64]) -> Result<()> {
        if !self.deal_agents.contains(agent) {
            return Ok(());
        }
        let mut created = 0;
        for &id in finding_ids {
            let Some(finding) = self.store.get_finding(id)? else {
                continue;
            };
            let reference = finding
                .metadata
                .get("address")
                .or_else(|| finding.metadata.get("name"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .or_else(|| finding.symbol.clone())
                .unwrap_or_else(|| format!("{agent} finding #{id}"));
            if self
                .store
                .insert_deal_if_absent(id, agent, &reference, &finding.metadata)?
            {
                created += 1;
            }
        }
        if created > 0 {
            debug!(agent, created, "deals auto-created from findings");
        }
        Ok(())
    }
}
