// =============================================================================
// Agent Scheduler — lifecycle, interval triggers, run gating, run protocol
// =============================================================================
//
// One spawned task per started agent ticks at the agent's interval. Each
// tick walks the run gate, in order:
//
//   1. system agents bypass everything
//   2. force-started agents bypass 3-6
//   3. kill list / quarantine
//   4. schedule says enabled = false
//   5. regime weight below epsilon ("muted by regime")
//   6. drawdown governor halt
//   7. run
//
// Run protocol: a telemetry recorder brackets the run (uuid run id, latency,
// reward = findings count); findings persist atomically per run in produced
// order; post-commit side effects (triple-confirmation on criticals, council
// backfill, hooks, decay + heatmap update) are best-effort and individually
// isolated. Per-agent runs never overlap: a tick that arrives while the
// previous run is in flight is dropped, not queued.
// =============================================================================

pub mod failures;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};

use crate::agents::{Agent, PostRunHook};
use crate::allocator::WEIGHT_EPSILON;
use crate::app_state::AppState;
use crate::gate::TripleGate;
use crate::providers::LlmProvider;
use crate::telemetry::RunRecorder;
use crate::types::{FindingDraft, Severity};

pub use failures::StartupFailureTracker;

/// Per-agent runtime entry.
struct AgentEntry {
    agent: Arc<dyn Agent>,
    /// Current interval in minutes; reads take effect at the next tick or
    /// on an explicit reschedule nudge.
    interval_minutes: AtomicU64,
    active: AtomicBool,
    system: bool,
    /// Serialises runs: a held lock means a run is in flight.
    run_lock: tokio::sync::Mutex<()>,
    /// Wakes the interval task to re-read its interval or active flag.
    reschedule: Notify,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

pub struct AgentScheduler {
    state: Arc<AppState>,
    gate: Arc<TripleGate>,
    /// Provider used for the optional council backfill (first configured).
    backfill_provider: Option<Arc<dyn LlmProvider>>,
    hooks: Vec<Arc<dyn PostRunHook>>,
    entries: RwLock<HashMap<String, Arc<AgentEntry>>>,
    forced: RwLock<HashSet<String>>,
    failures: StartupFailureTracker,
    shutdown_tx: broadcast::Sender<()>,
}

impl AgentScheduler {
    pub fn new(
        state: Arc<AppState>,
        gate: Arc<TripleGate>,
        providers: &[Arc<dyn LlmProvider>],
        hooks: Vec<Arc<dyn PostRunHook>>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let failures = StartupFailureTracker::new(state.config.startup_failures_path());
        Arc::new(Self {
            state,
            gate,
            backfill_provider: providers.first().cloned(),
            hooks,
            entries: RwLock::new(HashMap::new()),
            forced: RwLock::new(HashSet::new()),
            failures,
            shutdown_tx,
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Register an agent without starting it. Creates the status row and
    /// picks up interval/system flags from the boot schedule.
    pub fn register(&self, agent: Arc<dyn Agent>) -> Result<()> {
        let name = agent.name().to_string();
        let entry_cfg = self.state.schedule.read().entry(&name);

        self.state
            .store
            .ensure_agent(&name, entry_cfg.interval as i64)
            .with_context(|| format!("failed to register agent {name}"))?;

        let entry = Arc::new(AgentEntry {
            agent,
            interval_minutes: AtomicU64::new(entry_cfg.interval.max(1)),
            active: AtomicBool::new(false),
            system: entry_cfg.system,
            run_lock: tokio::sync::Mutex::new(()),
            reschedule: Notify::new(),
            handle: Mutex::new(None),
        });
        self.entries.write().insert(name.clone(), entry);
        info!(agent = %name, interval_min = entry_cfg.interval, "agent registered");
        Ok(())
    }

    /// Start the interval trigger for an agent. `force` bypasses the kill,
    /// ranking, regime, and drawdown gates for this agent until it is
    /// stopped again.
    pub fn start(self: &Arc<Self>, name: &str, force: bool) -> Result<()> {
        let Some(entry) = self.entries.read().get(name).cloned() else {
            let msg = format!("agent {name} is not registered");
            self.failures.track(name, &msg);
            anyhow::bail!(msg);
        };

        if force {
            self.forced.write().insert(name.to_string());
            info!(agent = %name, "force-starting agent (gates bypassed)");
        }

        if entry.active.swap(true, Ordering::SeqCst) {
            warn!(agent = %name, "agent is already scheduled");
            return Ok(());
        }

        self.state
            .store
            .set_agent_active(name, true)
            .with_context(|| format!("failed to activate agent {name}"))?;

        self.spawn_task(entry.clone());
        info!(
            agent = %name,
            interval_min = entry.interval_minutes.load(Ordering::SeqCst),
            "agent started"
        );
        Ok(())
    }

    /// Cancel the interval trigger. The currently executing run, if any,
    /// completes; no new tick fires.
    pub fn stop(&self, name: &str) -> Result<()> {
        let Some(entry) = self.entries.read().get(name).cloned() else {
            anyhow::bail!("agent {name} is not registered");
        };
        entry.active.store(false, Ordering::SeqCst);
        entry.reschedule.notify_one();
        self.forced.write().remove(name);
        self.state
            .store
            .set_agent_active(name, false)
            .with_context(|| format!("failed to deactivate agent {name}"))?;
        info!(agent = %name, "agent stopped");
        Ok(())
    }

    /// Replace the interval trigger; the new interval applies immediately.
    pub fn update_interval(&self, name: &str, minutes: u64) -> Result<()> {
        let Some(entry) = self.entries.read().get(name).cloned() else {
            anyhow::bail!("agent {name} is not registered");
        };
        let minutes = minutes.max(1);
        entry.interval_minutes.store(minutes, Ordering::SeqCst);
        entry.reschedule.notify_one();
        self.state
            .store
            .set_agent_interval(name, minutes as i64)
            .with_context(|| format!("failed to persist interval for {name}"))?;
        debug!(agent = %name, minutes, "interval updated");
        Ok(())
    }

    /// Out-of-band one-shot run. Walks the same gate as a scheduled tick.
    pub async fn run_now(self: &Arc<Self>, name: &str) -> Result<()> {
        let Some(entry) = self.entries.read().get(name).cloned() else {
            anyhow::bail!("agent {name} is not registered");
        };
        self.tick(&entry).await;
        Ok(())
    }

    /// Names of currently started agents.
    pub fn active_agents(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.active.load(Ordering::SeqCst))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Stop accepting ticks, wait up to `grace` for in-flight runs, then
    /// drop whatever is left and flush the event log.
    pub async fn shutdown(&self, grace: Duration) {
        info!(grace_secs = grace.as_secs(), "scheduler shutting down");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<tokio::task::JoinHandle<()>> = {
            let entries = self.entries.read();
            entries
                .values()
                .filter_map(|e| e.handle.lock().take())
                .collect()
        };
        let abort_handles: Vec<tokio::task::AbortHandle> =
            handles.iter().map(|h| h.abort_handle()).collect();

        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("grace period elapsed — dropping remaining agent work");
            for handle in abort_handles {
                handle.abort();
            }
        }

        if let Err(e) = self.state.event_log.flush() {
            error!(error = %e, "failed to flush event log on shutdown");
        }
        info!("scheduler shutdown complete");
    }

    // ── Interval task ───────────────────────────────────────────────────

    fn spawn_task(self: &Arc<Self>, entry: Arc<AgentEntry>) {
        let scheduler = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task_entry = entry.clone();

        let handle = tokio::spawn(async move {
            let name = task_entry.agent.name().to_string();
            loop {
                if !task_entry.active.load(Ordering::SeqCst) {
                    break;
                }
                let minutes = task_entry.interval_minutes.load(Ordering::SeqCst).max(1);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(minutes * 60)) => {}
                    _ = task_entry.reschedule.notified() => continue,
                    _ = shutdown_rx.recv() => break,
                }
                if !task_entry.active.load(Ordering::SeqCst) {
                    break;
                }
                scheduler.tick(&task_entry).await;
            }
            debug!(agent = %name, "agent interval task exited");
        });

        *entry.handle.lock() = Some(handle);
    }

    // ── Run gate ────────────────────────────────────────────────────────

    async fn tick(self: &Arc<Self>, entry: &Arc<AgentEntry>) {
        let name = entry.agent.name().to_string();

        // Per-agent serialization: a tick landing mid-run is dropped.
        let Ok(_guard) = entry.run_lock.try_lock() else {
            debug!(agent = %name, "previous run still in flight — tick dropped");
            return;
        };

        let forced = self.forced.read().contains(&name);
        if entry.system {
            debug!(agent = %name, "system agent bypassing run gates");
        } else if forced {
            info!(agent = %name, "force-started agent bypassing run gates");
        } else {
            if self.state.control.is_killed(&name) {
                warn!(agent = %name, "skipping run — agent is on the kill list");
                return;
            }
            if !self.state.schedule.read().entry(&name).enabled {
                debug!(agent = %name, "skipping run — disabled by ranking");
                return;
            }
            let weight = self.state.control.regime_weight(&name);
            if weight < WEIGHT_EPSILON {
                info!(agent = %name, weight, "skipping run — muted by regime");
                return;
            }
            if self.state.risk_state().halt {
                warn!(agent = %name, "skipping run — portfolio drawdown halt");
                return;
            }
        }

        self.run_agent(entry).await;
    }

    // ── Run protocol ────────────────────────────────────────────────────

    async fn run_agent(self: &Arc<Self>, entry: &Arc<AgentEntry>) {
        let name = entry.agent.name().to_string();
        let recorder = RunRecorder::start(&name);
        let run_id = recorder.run_id().to_string();
        let uncertainty = self.state.control.uncertainty_snapshot();
        let regime = self.state.control.regime_snapshot().active_regime;

        debug!(agent = %name, run_id = %run_id, "agent run starting");

        match entry.agent.analyze().await {
            Ok(drafts) => {
                let drafts: Vec<FindingDraft> = drafts
                    .into_iter()
                    .map(|d| stamp_provisional(d.sanitized(), &uncertainty))
                    .collect();
                let count = drafts.len();

                let ids = match self.state.store.insert_findings(&name, &drafts) {
                    Ok(ids) => ids,
                    Err(e) => {
                        // StoreUnavailable: the run is errored, not retried.
                        error!(agent = %name, error = %e, "findings commit failed");
                        let _ = self.state.store.record_run_error(&name, &e.to_string());
                        self.state.push_error(e.to_string(), Some(name.clone()));
                        recorder.finish_err(&self.state.event_log);
                        return;
                    }
                };

                if let Err(e) = self.state.store.record_run_ok(&name) {
                    warn!(agent = %name, error = %e, "failed to update run counters");
                }
                recorder.finish_ok(&self.state.event_log, count);

                self.post_commit(&name, &regime, &uncertainty, &ids, &drafts)
                    .await;

                info!(agent = %name, findings = count, "agent run complete");
                self.state.increment_version();
            }
            Err(e) => {
                error!(agent = %name, error = %e, "agent run failed");
                let _ = self.state.store.record_run_error(&name, &e.to_string());
                self.state.push_error(e.to_string(), Some(name.clone()));
                recorder.finish_err(&self.state.event_log);

                self.state.decay.write().update(&name, -1.0, uncertainty.score);
                self.state.heatmap.write().update(&name, &regime, -1.0);
            }
        }
    }

    /// Post-commit side effects. Each is best-effort: a failure is logged
    /// and never fails the run.
    async fn post_commit(
        self: &Arc<Self>,
        name: &str,
        regime: &str,
        uncertainty: &crate::uncertainty::UncertaintyControls,
        ids: &[i64],
        drafts: &[FindingDraft],
    ) {
        // a. Triple-confirmation gate on critical findings.
        for (&id, draft) in ids.iter().zip(drafts.iter()) {
            if draft.severity != Severity::Critical {
                continue;
            }
            match self.gate.analyze_and_alert(id, false, regime).await {
                Ok(outcome) => {
                    info!(
                        finding_id = id,
                        alerted = outcome.alerted,
                        "critical finding triple-confirmation complete"
                    );
                    self.state.push_decision(outcome);
                }
                Err(e) => error!(finding_id = id, error = %e, "triple-confirmation failed"),
            }
        }

        // b. Council verdict backfill.
        if let Err(e) = self.backfill_councils(ids, drafts).await {
            debug!(agent = %name, error = %e, "council backfill skipped");
        }

        // c. External hooks (deal creation and friends).
        for hook in &self.hooks {
            if let Err(e) = hook.after_findings(name, ids) {
                error!(hook = hook.name(), agent = %name, error = %e, "post-run hook failed");
            }
        }

        // d. Meta-model updates with the findings count as reward proxy.
        let reward = drafts.len() as f64;
        self.state
            .decay
            .write()
            .update(name, reward, uncertainty.score);
        self.state.heatmap.write().update(name, regime, reward);
    }

    /// One cheap LLM pass per finding to backfill the per-council verdict
    /// columns. Skipped entirely when no provider is configured.
    async fn backfill_councils(&self, ids: &[i64], drafts: &[FindingDraft]) -> Result<()> {
        let Some(provider) = &self.backfill_provider else {
            return Ok(());
        };

        for (&id, draft) in ids.iter().zip(drafts.iter()) {
            let prompt = format!(
                "Analyze this market finding.\nTitle: {}\nSeverity: {}\nSymbol: {}\n\
                 Description: {}\n\n\
                 For each council respond ACT, WATCH, or HOLD, one per line:\n\
                 ta_council=ACT|WATCH|HOLD\n\
                 fund_council=ACT|WATCH|HOLD\n\
                 real_estate_council=ACT|WATCH|HOLD|N/A",
                draft.title,
                draft.severity,
                draft.symbol.as_deref().unwrap_or("N/A"),
                &draft.description.chars().take(400).collect::<String>(),
            );

            let text = provider
                .call("Respond with only the requested lines.", &prompt)
                .await?;

            let mut ta = None;
            let mut fund = None;
            let mut real_estate = None;
            for line in text.lines() {
                let Some((key, value)) = line.split_once('=') else {
                    continue;
                };
                let value = value.trim().to_lowercase();
                if !matches!(value.as_str(), "act" | "watch" | "hold") {
                    continue;
                }
                let key = key.trim().to_lowercase();
                if key.contains("ta") {
                    ta = Some(value.clone());
                } else if key.contains("fund") {
                    fund = Some(value.clone());
                } else if key.contains("real") {
                    real_estate = Some(value.clone());
                }
            }

            // Real-estate-flavoured findings default to the TA verdict.
            let is_re = matches!(
                draft.market_type.as_deref(),
                Some("real_estate") | Some("private_equity") | Some("private_company")
            );
            if is_re && real_estate.is_none() {
                real_estate = ta.clone().or(Some("watch".to_string()));
            }

            self.state.store.set_council_backfill(
                id,
                ta.as_deref(),
                fund.as_deref(),
                real_estate.as_deref(),
            )?;
        }
        Ok(())
    }
}

/// Stamp a draft's metadata with the current uncertainty state so consumers
/// can tell provisional signals from normal ones.
fn stamp_provisional(
    mut draft: FindingDraft,
    uncertainty: &crate::uncertainty::UncertaintyControls,
) -> FindingDraft {
    let mut meta = match draft.metadata {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    meta.insert("provisional".to_string(), serde_json::json!(uncertainty.spike));
    meta.insert(
        "uncertainty_label".to_string(),
        serde_json::json!(uncertainty.label),
    );
    meta.insert(
        "uncertainty_score".to_string(),
        serde_json::json!(uncertainty.score),
    );
    draft.metadata = serde_json::Value::Object(meta);
    draft
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    use crate::gate::GateConfig;
    use crate::prices::NullPriceSource;
    use crate::regime::RegimeSkillTable;
    use crate::runtime_config::{AgentScheduleEntry, BootSchedule, RuntimeConfig};
    use crate::store::FindingsStore;
    use crate::telemetry::EventLog;
    use crate::types::FindingDraft;

    struct CountingAgent {
        name: String,
        runs: Arc<AtomicUsize>,
        drafts: Vec<FindingDraft>,
        delay: Duration,
    }

    #[async_trait]
    impl Agent for CountingAgent {
        fn name(&self) -> &str {
            &self.name
        }
        async fn analyze(&self) -> Result<Vec<FindingDraft>> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(self.drafts.clone())
        }
    }

    struct FailingAgent;

    #[async_trait]
    impl Agent for FailingAgent {
        fn name(&self) -> &str {
            "broken"
        }
        async fn analyze(&self) -> Result<Vec<FindingDraft>> {
            anyhow::bail!("data source exploded")
        }
    }

    fn draft(severity: Severity) -> FindingDraft {
        FindingDraft {
            title: "t".into(),
            description: "d".into(),
            severity,
            confidence: 0.6,
            symbol: Some("SPY".into()),
            market_type: None,
            metadata: serde_json::Value::Null,
        }
    }

    fn build_state(schedule: BootSchedule) -> (tempfile::TempDir, Arc<AppState>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::default();
        config.data_dir = dir.path().to_path_buf();
        let store = Arc::new(FindingsStore::open_in_memory().unwrap());
        let log = Arc::new(EventLog::open(dir.path().join("events.jsonl")).unwrap());
        let state = Arc::new(AppState::new(
            config,
            schedule,
            store,
            log,
            RegimeSkillTable::default(),
        ));
        (dir, state)
    }

    fn build_scheduler(state: &Arc<AppState>) -> Arc<AgentScheduler> {
        let gate = Arc::new(TripleGate::new(
            state.store.clone(),
            Vec::new(),
            Arc::new(NullPriceSource),
            None,
            GateConfig::default(),
        ));
        AgentScheduler::new(state.clone(), gate, &[], Vec::new())
    }

    fn counting_agent(
        name: &str,
        drafts: Vec<FindingDraft>,
    ) -> (Arc<CountingAgent>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(CountingAgent {
                name: name.into(),
                runs: runs.clone(),
                drafts,
                delay: Duration::ZERO,
            }),
            runs,
        )
    }

    #[tokio::test]
    async fn run_now_persists_findings_in_order() {
        let (_dir, state) = build_state(BootSchedule::default());
        let scheduler = build_scheduler(&state);
        let (agent, runs) = counting_agent(
            "alpha",
            vec![draft(Severity::Low), draft(Severity::Medium)],
        );
        scheduler.register(agent).unwrap();

        scheduler.run_now("alpha").await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let findings = state.store.recent_findings(10).unwrap();
        assert_eq!(findings.len(), 2);

        let statuses = state.store.agent_statuses().unwrap();
        assert_eq!(statuses[0].run_count, 1);
        assert_eq!(statuses[0].error_count, 0);

        // Telemetry event with reward = findings count.
        let events = state.event_log.iter_events(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reward, Some(2.0));
        assert!(events[0].run_id.is_some());
    }

    #[tokio::test]
    async fn failed_run_counts_error_and_never_kills_the_scheduler() {
        let (_dir, state) = build_state(BootSchedule::default());
        let scheduler = build_scheduler(&state);
        scheduler.register(Arc::new(FailingAgent)).unwrap();

        scheduler.run_now("broken").await.unwrap();

        let statuses = state.store.agent_statuses().unwrap();
        assert_eq!(statuses[0].error_count, 1);
        assert!(statuses[0].last_error.as_deref().unwrap().contains("exploded"));

        let events = state.event_log.iter_events(10);
        assert_eq!(events[0].reward, Some(-1.0));
        assert_eq!(events[0].errors, Some(1));

        // A second run still works.
        scheduler.run_now("broken").await.unwrap();
        assert_eq!(state.store.agent_statuses().unwrap()[0].error_count, 2);
    }

    #[tokio::test]
    async fn killed_agent_is_skipped() {
        let (_dir, state) = build_state(BootSchedule::default());
        let scheduler = build_scheduler(&state);
        let (agent, runs) = counting_agent("alpha", vec![]);
        scheduler.register(agent).unwrap();

        state.control.killed.write().insert("alpha".to_string());
        scheduler.run_now("alpha").await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn regime_muted_agent_is_skipped() {
        let (_dir, state) = build_state(BootSchedule::default());
        let scheduler = build_scheduler(&state);
        let (agent, runs) = counting_agent("alpha", vec![]);
        scheduler.register(agent).unwrap();

        let mut weights = HashMap::new();
        weights.insert("alpha".to_string(), 0.001);
        *state.control.regime_weights.write() = weights;

        scheduler.run_now("alpha").await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn force_started_agent_bypasses_gates() {
        let (_dir, state) = build_state(BootSchedule::default());
        let scheduler = build_scheduler(&state);
        let (agent, runs) = counting_agent("alpha", vec![]);
        scheduler.register(agent).unwrap();

        state.control.killed.write().insert("alpha".to_string());
        scheduler.start("alpha", true).unwrap();

        scheduler.run_now("alpha").await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        scheduler.stop("alpha").unwrap();
        // Stopping clears the force flag; the kill gate applies again.
        scheduler.run_now("alpha").await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn system_agent_bypasses_all_gates() {
        let mut schedule = BootSchedule::default();
        schedule.agents.insert(
            "sys".to_string(),
            AgentScheduleEntry {
                system: true,
                ..Default::default()
            },
        );
        let (_dir, state) = build_state(schedule);
        let scheduler = build_scheduler(&state);
        let (agent, runs) = counting_agent("sys", vec![]);
        scheduler.register(agent).unwrap();

        // Force a halt state through the kill list for a normal agent and
        // verify the system agent still runs.
        state.control.killed.write().insert("sys".to_string());
        scheduler.run_now("sys").await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_agent_is_skipped() {
        let mut schedule = BootSchedule::default();
        schedule.agents.insert(
            "off".to_string(),
            AgentScheduleEntry {
                enabled: false,
                ..Default::default()
            },
        );
        let (_dir, state) = build_state(schedule);
        let scheduler = build_scheduler(&state);
        let (agent, runs) = counting_agent("off", vec![]);
        scheduler.register(agent).unwrap();

        scheduler.run_now("off").await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn overlapping_ticks_are_dropped_not_queued() {
        let (_dir, state) = build_state(BootSchedule::default());
        let scheduler = build_scheduler(&state);
        let runs = Arc::new(AtomicUsize::new(0));
        let agent = Arc::new(CountingAgent {
            name: "slow".into(),
            runs: runs.clone(),
            drafts: vec![],
            delay: Duration::from_millis(300),
        });
        scheduler.register(agent).unwrap();

        let s1 = scheduler.clone();
        let s2 = scheduler.clone();
        let first = tokio::spawn(async move { s1.run_now("slow").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = tokio::spawn(async move { s2.run_now("slow").await });

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        // The overlapping tick was dropped.
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn critical_findings_trigger_the_gate() {
        let (_dir, state) = build_state(BootSchedule::default());
        let scheduler = build_scheduler(&state);
        let (agent, _) = counting_agent("alpha", vec![draft(Severity::Critical)]);
        scheduler.register(agent).unwrap();

        scheduler.run_now("alpha").await.unwrap();

        let findings = state.store.recent_findings(10).unwrap();
        assert_eq!(findings.len(), 1);
        // The gate ran: auto_analyzed is set even with zero providers
        // (consensus degrades to WATCH@0, TA degrades to WATCH@0.5).
        assert!(findings[0].auto_analyzed);
        assert!(!findings[0].alerted);
        assert_eq!(state.recent_decisions.read().len(), 1);
    }

    #[tokio::test]
    async fn provisional_metadata_is_stamped_under_spike() {
        let (_dir, state) = build_state(BootSchedule::default());
        {
            let mut u = state.control.uncertainty.write();
            u.spike = true;
            u.score = 0.8;
        }
        let scheduler = build_scheduler(&state);
        let (agent, _) = counting_agent("alpha", vec![draft(Severity::Low)]);
        scheduler.register(agent).unwrap();

        scheduler.run_now("alpha").await.unwrap();

        let findings = state.store.recent_findings(10).unwrap();
        assert_eq!(findings[0].metadata["provisional"], true);
        assert!((findings[0].metadata["uncertainty_score"].as_f64().unwrap() - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn start_unknown_agent_tracks_startup_failure() {
        let (_dir, state) = build_state(BootSchedule::default());
        let scheduler = build_scheduler(&state);
        assert!(scheduler.start("ghost", false).is_err());
        let records = scheduler.failures.load();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].agent_name, "ghost");
    }

    #[tokio::test]
    async fn start_stop_lifecycle_updates_store() {
        let (_dir, state) = build_state(BootSchedule::default());
        let scheduler = build_scheduler(&state);
        let (agent, _) = counting_agent("alpha", vec![]);
        scheduler.register(agent).unwrap();

        scheduler.start("alpha", false).unwrap();
        assert!(state.store.agent_statuses().unwrap()[0].is_active);
        assert_eq!(scheduler.active_agents(), vec!["alpha"]);

        scheduler.stop("alpha").unwrap();
        assert!(!state.store.agent_statuses().unwrap()[0].is_active);
        assert!(scheduler.active_agents().is_empty());
    }

    #[tokio::test]
    async fn shutdown_completes_within_grace() {
        let (_dir, state) = build_state(BootSchedule::default());
        let scheduler = build_scheduler(&state);
        let (agent, _) = counting_agent("alpha", vec![]);
        scheduler.register(agent).unwrap();
        scheduler.start("alpha", false).unwrap();

        let started = std::time::Instant::now();
        scheduler.shutdown(Duration::from_secs(2)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
