// =============================================================================
// Triple-Confirmation Gate
// =============================================================================
//
// For a single finding: deterministic TA vote + 3-LLM council consensus,
// blended into a combined confidence (0.65 council + 0.35 TA), written back
// atomically, and promoted to exactly one email alert when
//
//   severity == critical  AND  council == ACT  AND  TA == ACT
//
// `alerted` flips only after a successful send, so a failed delivery can be
// retried later and still fire exactly once. Re-running the gate on an
// already-analyzed finding is a no-op unless `force` is set.
// =============================================================================

pub mod council;
pub mod ta;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::notify::Notifier;
use crate::prices::PriceSource;
use crate::providers::LlmProvider;
use crate::store::{FindingAnalysis, FindingsStore};
use crate::types::{Severity, Verdict};

pub use council::{consensus, run_finding_council, Consensus, CouncilVote};
pub use ta::{ta_vote, TaVote};

/// Council weight in the combined confidence blend.
const COUNCIL_WEIGHT: f64 = 0.65;
/// TA weight in the combined confidence blend.
const TA_WEIGHT: f64 = 0.35;

/// Gate tunables sourced from the environment.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Per-provider call deadline.
    pub call_timeout: Duration,
    /// Vote-count quorum below which consensus falls back to weighted argmax.
    pub min_agree: usize,
    /// Alert recipients; empty disables alerting.
    pub recipients: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(20),
            min_agree: 2,
            recipients: Vec::new(),
        }
    }
}

/// Result of one gate invocation, kept in the recent-decisions audit ring.
#[derive(Debug, Clone, Serialize)]
pub struct GateOutcome {
    pub finding_id: i64,
    pub agent_name: String,
    pub consensus_action: Verdict,
    pub combined_confidence: f64,
    pub ta_vote: Verdict,
    pub ta_score: f64,
    pub disagreement: bool,
    pub triple_confirmed: bool,
    pub alerted: bool,
    pub already_analyzed: bool,
}

/// The gate itself. Providers may be empty (consensus degrades to WATCH@0),
/// the notifier may be absent (alerting disabled).
pub struct TripleGate {
    store: Arc<FindingsStore>,
    providers: Vec<Arc<dyn LlmProvider>>,
    prices: Arc<dyn PriceSource>,
    notifier: Option<Arc<dyn Notifier>>,
    cfg: GateConfig,
}

impl TripleGate {
    pub fn new(
        store: Arc<FindingsStore>,
        providers: Vec<Arc<dyn LlmProvider>>,
        prices: Arc<dyn PriceSource>,
        notifier: Option<Arc<dyn Notifier>>,
        cfg: GateConfig,
    ) -> Self {
        Self {
            store,
            providers,
            prices,
            notifier,
            cfg,
        }
    }

    /// Run the full gate on one finding.
    pub async fn analyze_and_alert(
        &self,
        finding_id: i64,
        force: bool,
        active_regime: &str,
    ) -> Result<GateOutcome> {
        let finding = self
            .store
            .get_finding(finding_id)
            .context("gate could not load finding")?
            .with_context(|| format!("finding {finding_id} not found"))?;

        // Idempotence: analysis fields mutate at most once without force.
        if finding.auto_analyzed && !force {
            return Ok(GateOutcome {
                finding_id,
                agent_name: finding.agent_name,
                consensus_action: finding.consensus_action.unwrap_or(Verdict::Watch),
                combined_confidence: finding.consensus_confidence.unwrap_or(0.0),
                ta_vote: Verdict::Watch,
                ta_score: 0.0,
                disagreement: finding.llm_disagreement,
                triple_confirmed: false,
                alerted: finding.alerted,
                already_analyzed: true,
            });
        }

        // ── 1. TA vote ──────────────────────────────────────────────────
        let ta = match &finding.symbol {
            Some(symbol) => match self.prices.load_closes(symbol).await {
                Ok(closes) => ta::ta_vote(&closes),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "price load failed — TA degrades to WATCH");
                    TaVote::insufficient(format!("price load failed: {e}"))
                }
            },
            None => TaVote::insufficient("no symbol"),
        };

        // ── 2. LLM council ──────────────────────────────────────────────
        let votes = council::run_finding_council(
            &self.providers,
            &finding.to_prompt_json(),
            self.cfg.call_timeout,
        )
        .await;

        // ── 3. Consensus ────────────────────────────────────────────────
        let consensus = council::consensus(&votes, self.cfg.min_agree)
            .unwrap_or_else(Consensus::no_votes);

        // ── 4. Combined confidence ──────────────────────────────────────
        let combined = COUNCIL_WEIGHT * consensus.confidence + TA_WEIGHT * ta.score;

        // ── 5. Persistence (atomic) ─────────────────────────────────────
        let votes_json = serde_json::Value::Object(
            votes
                .iter()
                .map(|v| {
                    (
                        v.model.clone(),
                        serde_json::Value::String(v.verdict.to_string()),
                    )
                })
                .collect(),
        );
        let analysis = FindingAnalysis {
            consensus_action: consensus.verdict,
            consensus_confidence: combined,
            llm_votes: votes_json,
            llm_disagreement: consensus.uncertainty_spike,
            ta_regime: Some(ta.vote.to_string()),
            council_agreement: consensus.confidence,
            council_uncertainty: if consensus.uncertainty_spike {
                1.0 - consensus.confidence
            } else {
                0.0
            },
        };
        self.store
            .apply_analysis(finding_id, &finding.agent_name, active_regime, &analysis)
            .context("gate write-back failed")?;

        // ── 6. Alert rule (idempotent) ──────────────────────────────────
        let triple_confirmed = finding.severity == Severity::Critical
            && consensus.verdict == Verdict::Act
            && ta.vote == Verdict::Act;

        let mut alerted = false;
        if triple_confirmed && !finding.alerted {
            alerted = self.send_alert(&finding, &consensus, &ta, combined).await;
            if alerted {
                self.store
                    .mark_alerted(finding_id)
                    .context("failed to mark finding alerted")?;
            }
        }

        info!(
            finding_id,
            agent = %finding.agent_name,
            action = %consensus.verdict,
            confidence = format!("{combined:.3}"),
            ta = %ta.vote,
            triple_confirmed,
            alerted,
            "triple-confirmation gate complete"
        );

        Ok(GateOutcome {
            finding_id,
            agent_name: finding.agent_name,
            consensus_action: consensus.verdict,
            combined_confidence: combined,
            ta_vote: ta.vote,
            ta_score: ta.score,
            disagreement: consensus.uncertainty_spike,
            triple_confirmed,
            alerted,
            already_analyzed: false,
        })
    }

    /// Best-effort alert delivery. Returns true only on confirmed success.
    async fn send_alert(
        &self,
        finding: &crate::store::FindingRecord,
        consensus: &Consensus,
        ta: &TaVote,
        combined: f64,
    ) -> bool {
        let Some(notifier) = &self.notifier else {
            warn!(finding_id = finding.id, "alert suppressed — no notifier configured");
            return false;
        };
        if self.cfg.recipients.is_empty() {
            warn!(finding_id = finding.id, "alert suppressed — empty recipient list");
            return false;
        }

        let subject = format!(
            "[ACT] {} ({})",
            finding.title,
            finding.symbol.as_deref().unwrap_or("N/A")
        );
        let text = format!(
            "Critical finding confirmed by TA + LLM council\n\n\
             Title: {}\nAgent: {}\nSymbol: {}\nSeverity: {}\n\
             Combined confidence: {:.3}\nTA: {} ({})\nSummary: {}\n\n{}",
            finding.title,
            finding.agent_name,
            finding.symbol.as_deref().unwrap_or("N/A"),
            finding.severity,
            combined,
            ta.vote,
            ta.reason,
            consensus.one_paragraph_summary,
            finding.description,
        );
        let html = format!("<pre>{text}</pre>");

        match notifier
            .send(&self.cfg.recipients, &subject, &text, &html)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                // Leave alerted = false; a later gate pass may retry.
                error!(finding_id = finding.id, error = %e, "alert send failed");
                false
            }
        }
    }
}
