// =============================================================================
// Argus Market Sentinel — Main Entry Point
// =============================================================================
//
// Composition root: wires the findings store, telemetry log, drawdown
// governor, regime classifier, uncertainty council, UCB allocator, agent
// scheduler, and the admin API into one process. The process exits non-zero
// when the store cannot be initialised; everything else degrades.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod agents;
mod allocator;
mod api;
mod app_state;
mod control;
mod decay;
mod gate;
mod governor;
mod heatmap;
mod notify;
mod prices;
mod providers;
mod regime;
mod runtime_config;
mod scheduler;
mod store;
mod telemetry;
mod types;
mod uncertainty;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::agents::{AgentRegistry, DealHook, PostRunHook, PriceWatchAgent};
use crate::api::ApiContext;
use crate::app_state::AppState;
use crate::control::Orchestrator;
use crate::gate::{GateConfig, TripleGate};
use crate::regime::RegimeSkillTable;
use crate::runtime_config::{AgentScheduleEntry, BootSchedule, RuntimeConfig};
use crate::scheduler::AgentScheduler;
use crate::store::FindingsStore;
use crate::telemetry::EventLog;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Argus Market Sentinel — Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = RuntimeConfig::from_env();
    std::fs::create_dir_all(&config.data_dir)?;
    info!(
        data_dir = %config.data_dir.display(),
        drawdown_limit = config.drawdown_limit,
        run_budget = config.run_budget,
        "runtime configuration loaded"
    );

    // ── 2. Boot schedule ─────────────────────────────────────────────────
    let schedule_path = config.schedule_path();
    let schedule = match BootSchedule::load(&schedule_path) {
        Ok(schedule) => schedule,
        Err(e) => {
            warn!(error = %e, "boot schedule missing — creating default");
            let schedule = default_schedule();
            if let Err(e) = schedule.save(&schedule_path) {
                warn!(error = %e, "could not persist default schedule");
            }
            schedule
        }
    };

    // ── 3. Persistence (fatal on failure) ────────────────────────────────
    let store = match FindingsStore::open(config.store_path()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "findings store initialisation failed — aborting");
            std::process::exit(1);
        }
    };
    let event_log = Arc::new(EventLog::open(config.event_log_path())?);

    let skill_table = RegimeSkillTable::load(config.regime_stats_path()).unwrap_or_default();

    // ── 4. Shared state ──────────────────────────────────────────────────
    let state = Arc::new(AppState::new(
        config,
        schedule,
        store,
        event_log,
        skill_table,
    ));

    // Seed the risk snapshot from whatever history already exists.
    state.governor.refresh();

    // ── 5. External interfaces ───────────────────────────────────────────
    let llm_providers = providers::providers_from_env();
    let (notifier, recipients) = notify::notifier_from_env();
    let price_source = prices::price_source_from_env();

    // ── 6. Triple-confirmation gate ──────────────────────────────────────
    let gate = Arc::new(TripleGate::new(
        state.store.clone(),
        llm_providers.clone(),
        price_source.clone(),
        notifier.clone(),
        GateConfig {
            call_timeout: Duration::from_secs(state.config.llm_council_timeout_sec),
            min_agree: state.config.llm_council_min_agree,
            recipients: recipients.clone(),
        },
    ));

    // ── 7. Agents & scheduler ────────────────────────────────────────────
    let mut registry = AgentRegistry::new();
    let watch_symbols = std::env::var("ARGUS_WATCH_SYMBOLS")
        .unwrap_or_else(|_| "SPY".to_string());
    for symbol in watch_symbols.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        registry.register(Arc::new(PriceWatchAgent::new(
            symbol.to_uppercase(),
            price_source.clone(),
        )));
    }
    info!(agents = registry.len(), "agent registry assembled");

    let deal_agents: Vec<String> = state
        .schedule
        .read()
        .agents
        .iter()
        .filter(|(_, entry)| entry.deal_producing)
        .map(|(name, _)| name.clone())
        .collect();
    let hooks: Vec<Arc<dyn PostRunHook>> =
        vec![Arc::new(DealHook::new(state.store.clone(), deal_agents))];

    let agent_scheduler = AgentScheduler::new(state.clone(), gate, &llm_providers, hooks);
    for name in registry.names() {
        let agent = registry.get(&name).expect("registry is consistent");
        if let Err(e) = agent_scheduler.register(agent) {
            error!(agent = %name, error = %e, "agent registration failed");
            continue;
        }
        if state.schedule.read().entry(&name).enabled {
            if let Err(e) = agent_scheduler.start(&name, false) {
                error!(agent = %name, error = %e, "agent start failed");
            }
        } else {
            info!(agent = %name, "agent disabled by schedule — not starting");
        }
    }

    // ── 8. Admin API ─────────────────────────────────────────────────────
    let api_context = Arc::new(ApiContext {
        state: state.clone(),
        scheduler: agent_scheduler.clone(),
    });
    let bind_addr = state.config.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::router(api_context);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "admin API listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "admin API server failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind admin API"),
        }
    });

    // ── 9. Control-plane jobs ────────────────────────────────────────────
    let (job_shutdown, _) = broadcast::channel::<()>(1);
    let orchestrator = Orchestrator::new(
        state.clone(),
        agent_scheduler.clone(),
        llm_providers,
        notifier,
        recipients,
        price_source,
    );
    orchestrator.spawn_all(&job_shutdown);

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    let _ = job_shutdown.send(());
    let grace = Duration::from_secs(state.config.grace_period_secs);
    agent_scheduler.shutdown(grace).await;

    if let Err(e) = state.schedule.read().save(state.config.schedule_path()) {
        error!(error = %e, "failed to save boot schedule on shutdown");
    }

    info!("Argus shut down complete.");
    Ok(())
}

/// Default schedule written on first boot: one price watcher, hourly.
fn default_schedule() -> BootSchedule {
    let mut schedule = BootSchedule::default();
    schedule.agents.insert(
        "price_watch_spy".to_string(),
        AgentScheduleEntry {
            interval: 15,
            min_runs: 1,
            ..Default::default()
        },
    );
    schedule
}
