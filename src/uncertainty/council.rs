// =============================================================================
// Uncertainty Council — multi-LLM uncertainty votes and derived controls
// =============================================================================
//
// Providers answer a compact prompt with a single line
//
//   uncertainty=0.42|label=transition|confidence=0.65
//
// Votes are aggregated confidence-weighted; the label wins by summed
// confidence; disagreement is the sample standard deviation of the
// uncertainty votes normalised by 0.35. A spike fires at score >= 0.65 or
// disagreement >= 0.60. When no provider produces a usable vote a single
// hard-coded fallback vote keeps the loop alive.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::providers::LlmProvider;
use crate::types::UncertaintyLabel;

/// Spike thresholds.
const SPIKE_SCORE: f64 = 0.65;
const SPIKE_DISAGREEMENT: f64 = 0.60;
/// Std-dev normaliser for the disagreement score.
const DISAGREEMENT_SCALE: f64 = 0.35;

const SYSTEM_PROMPT: &str = "You are a market uncertainty analyst. \
Respond with exactly one line in the format \
uncertainty=X.XX|label=LABEL|confidence=X.XX \
where LABEL is one of: calm, risk_off, transition, shock.";

/// One provider's vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UncertaintyVote {
    pub model: String,
    pub uncertainty: f64,
    pub label: UncertaintyLabel,
    pub confidence: f64,
}

/// Aggregated council outcome before control derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UncertaintyAssessment {
    pub score: f64,
    pub label: UncertaintyLabel,
    pub spike: bool,
    pub disagreement: f64,
    pub votes: Vec<UncertaintyVote>,
}

/// Published control state read by the scheduler and allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UncertaintyControls {
    pub score: f64,
    pub label: UncertaintyLabel,
    pub spike: bool,
    pub disagreement: f64,
    /// Interval multiplier (>= 1 slows the fleet down).
    pub cadence_multiplier: f64,
    /// Budget/decay multiplier (<= 1 tightens the allocator).
    pub decay_multiplier: f64,
    pub votes: Vec<UncertaintyVote>,
    pub asof: DateTime<Utc>,
}

impl Default for UncertaintyControls {
    fn default() -> Self {
        Self {
            score: 0.0,
            label: UncertaintyLabel::Calm,
            spike: false,
            disagreement: 0.0,
            cadence_multiplier: 1.0,
            decay_multiplier: 1.0,
            votes: Vec::new(),
            asof: Utc::now(),
        }
    }
}

impl UncertaintyControls {
    /// Capital multiplier applied to per-agent interval derivation:
    /// spikes throttle to 0.6, elevated scores to 0.8, calm runs at 1.0.
    pub fn capital_multiplier(&self) -> f64 {
        if self.spike {
            0.6
        } else if self.score >= 0.6 {
            0.8
        } else {
            1.0
        }
    }
}

// =============================================================================
// Vote parsing
// =============================================================================

/// Parse the `key=value|...` vote line. Out-of-range numbers are clamped;
/// a line without an uncertainty value is rejected.
pub fn parse_vote_line(model: &str, text: &str) -> Option<UncertaintyVote> {
    let mut uncertainty: Option<f64> = None;
    let mut label = UncertaintyLabel::Calm;
    let mut confidence = 0.5;

    // Models occasionally wrap the line in prose; scan all lines for one
    // that carries the expected keys.
    for line in text.lines() {
        for part in line.split('|') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "uncertainty" => {
                    if let Ok(v) = value.trim().parse::<f64>() {
                        uncertainty = Some(v.clamp(0.0, 1.0));
                    }
                }
                "label" => label = UncertaintyLabel::parse(value),
                "confidence" => {
                    if let Ok(v) = value.trim().parse::<f64>() {
                        confidence = v.clamp(0.0, 1.0);
                    }
                }
                _ => {}
            }
        }
    }

    uncertainty.map(|uncertainty| UncertaintyVote {
        model: model.to_string(),
        uncertainty,
        label,
        confidence,
    })
}

// =============================================================================
// Aggregation
// =============================================================================

fn disagreement_of(votes: &[UncertaintyVote]) -> f64 {
    if votes.len() <= 1 {
        return 0.0;
    }
    let n = votes.len() as f64;
    let mean = votes.iter().map(|v| v.uncertainty).sum::<f64>() / n;
    let var = votes
        .iter()
        .map(|v| (v.uncertainty - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0);
    (var.sqrt() / DISAGREEMENT_SCALE).clamp(0.0, 1.0)
}

/// Aggregate votes into a score, label, and spike flag. `votes` must be
/// non-empty (the council always supplies at least the fallback vote).
pub fn aggregate(votes: Vec<UncertaintyVote>) -> UncertaintyAssessment {
    let weight_sum: f64 = votes.iter().map(|v| v.confidence).sum();
    let weight_sum = if weight_sum > 0.0 { weight_sum } else { 1.0 };
    let score = votes
        .iter()
        .map(|v| v.uncertainty * v.confidence)
        .sum::<f64>()
        / weight_sum;
    let score = score.clamp(0.0, 1.0);

    // Label wins by summed confidence; ties resolve in fixed bucket order.
    let buckets = [
        UncertaintyLabel::Calm,
        UncertaintyLabel::RiskOff,
        UncertaintyLabel::Transition,
        UncertaintyLabel::Shock,
    ];
    let label = buckets
        .iter()
        .map(|&bucket| {
            let weight: f64 = votes
                .iter()
                .filter(|v| v.label == bucket)
                .map(|v| v.confidence)
                .sum();
            (bucket, weight)
        })
        .fold(
            (UncertaintyLabel::Calm, f64::MIN),
            |(best, best_w), (bucket, w)| {
                if w > best_w {
                    (bucket, w)
                } else {
                    (best, best_w)
                }
            },
        )
        .0;

    let disagreement = disagreement_of(&votes);
    let spike = score >= SPIKE_SCORE || disagreement >= SPIKE_DISAGREEMENT;

    UncertaintyAssessment {
        score,
        label,
        spike,
        disagreement,
        votes,
    }
}

// =============================================================================
// Control derivation
// =============================================================================

/// Derive cadence/decay multipliers from an assessment, with hysteresis
/// against the previous controls: calm readings recover gradually, hard
/// spikes tighten decay monotonically.
pub fn compute_controls(
    assessment: UncertaintyAssessment,
    prev: Option<&UncertaintyControls>,
) -> UncertaintyControls {
    let (mut cadence, mut decay): (f64, f64) = match assessment.label {
        UncertaintyLabel::Shock => (3.0, 0.35),
        UncertaintyLabel::Transition => (2.0, 0.55),
        UncertaintyLabel::RiskOff => (1.7, 0.65),
        UncertaintyLabel::Calm => (1.0, 1.0),
    };

    cadence = cadence.min(1.0 + 2.0 * assessment.score);

    if let Some(prev) = prev {
        if !assessment.spike && assessment.score < 0.35 {
            decay = (prev.decay_multiplier + 0.10).min(1.0);
            cadence = (prev.cadence_multiplier - 0.15).max(1.0);
        }
        if assessment.spike && assessment.score > 0.75 {
            decay = decay.min(prev.decay_multiplier * 0.90).max(0.25);
        }
    }

    UncertaintyControls {
        score: assessment.score,
        label: assessment.label,
        spike: assessment.spike,
        disagreement: assessment.disagreement,
        cadence_multiplier: cadence,
        decay_multiplier: decay,
        votes: assessment.votes,
        asof: Utc::now(),
    }
}

// =============================================================================
// Council runner
// =============================================================================

/// Fan the uncertainty prompt out to every provider in parallel. A provider
/// that errors, times out, or returns an unparseable line is dropped; when
/// nothing usable comes back a single fallback vote is used so downstream
/// consumers always see a state.
pub async fn run_uncertainty_council(
    providers: &[Arc<dyn LlmProvider>],
    summary: &str,
    timeout: Duration,
) -> Vec<UncertaintyVote> {
    let user = format!(
        "Rate current market uncertainty from 0 (calm) to 1 (extreme) given:\n{summary}"
    );

    let mut tasks = tokio::task::JoinSet::new();
    for provider in providers {
        let provider = provider.clone();
        let user = user.clone();
        tasks.spawn(async move {
            let name = provider.name().to_string();
            match tokio::time::timeout(timeout, provider.call(SYSTEM_PROMPT, &user)).await {
                Ok(Ok(text)) => parse_vote_line(&name, &text),
                Ok(Err(e)) => {
                    warn!(model = %name, error = %e, "uncertainty council call failed");
                    None
                }
                Err(_) => {
                    warn!(model = %name, "uncertainty council call timed out");
                    None
                }
            }
        });
    }

    let mut votes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        if let Ok(Some(vote)) = joined {
            votes.push(vote);
        }
    }
    // Stable order regardless of completion order.
    votes.sort_by(|a, b| a.model.cmp(&b.model));

    if votes.is_empty() {
        info!("no usable uncertainty votes — using fallback");
        votes.push(UncertaintyVote {
            model: "fallback".to_string(),
            uncertainty: 0.15,
            label: UncertaintyLabel::Calm,
            confidence: 0.40,
        });
    }

    votes
}
