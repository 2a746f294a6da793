// =============================================================================
// Finding Council — 3-LLM strict-JSON verdict consensus
// =============================================================================
//
// Each provider is asked for strict JSON with a verdict, confidence, and
// supporting fields. Parsing is defensive: a pure JSON body is accepted
// first, then the outermost `{...}` slice; anything else drops that vote.
//
// Consensus: count votes per verdict and take the top; if the top count is
// below the quorum, fall back to the argmax of confidence-weighted scores
// and flag an uncertainty spike. Confidence is the mean confidence of the
// voters behind the winning verdict, scaled x0.75 under a spike.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::providers::LlmProvider;
use crate::types::Verdict;

const SYSTEM_PROMPT: &str = "You are an investment risk and market signal analyst. \
Return strict JSON only. No markdown.";

/// One parsed provider vote.
#[derive(Debug, Clone, Serialize)]
pub struct CouncilVote {
    pub model: String,
    pub verdict: Verdict,
    pub confidence: f64,
    pub parsed: serde_json::Value,
}

/// Consensus over the usable votes.
#[derive(Debug, Clone, Serialize)]
pub struct Consensus {
    pub verdict: Verdict,
    /// Mean confidence of the voters behind `verdict` (spike-scaled).
    pub confidence: f64,
    pub uncertainty_spike: bool,
    pub key_drivers: Vec<String>,
    pub what_to_verify: Vec<String>,
    pub time_horizon: String,
    pub one_paragraph_summary: String,
}

impl Consensus {
    /// Consensus when zero votes parsed: WATCH at zero confidence with the
    /// disagreement flag raised.
    pub fn no_votes() -> Self {
        Self {
            verdict: Verdict::Watch,
            confidence: 0.0,
            uncertainty_spike: true,
            key_drivers: Vec::new(),
            what_to_verify: Vec::new(),
            time_horizon: "days".to_string(),
            one_paragraph_summary: String::new(),
        }
    }
}

/// Build the strict-JSON prompt for one finding payload.
pub fn council_prompt(finding: &serde_json::Value) -> String {
    format!(
        r#"Given this finding, output STRICT JSON ONLY matching the schema below.

FINDING_JSON:
{finding}

SCHEMA:
{{
  "verdict": "ACT" | "WATCH" | "IGNORE",
  "severity": "low" | "medium" | "high" | "critical",
  "confidence": number,
  "key_drivers": [string, ...],
  "what_to_verify": [string, ...],
  "time_horizon": "intraday" | "days" | "weeks" | "months",
  "positioning": {{
    "bias": "risk-on" | "risk-off" | "neutral",
    "suggested_actions": [string, ...]
  }},
  "one_paragraph_summary": string
}}

Rules:
- Be conservative: if uncertain, choose WATCH.
- confidence must reflect uncertainty.
- If missing data, put it into what_to_verify."#
    )
}

/// Extract a JSON object from a model response: direct parse first, then the
/// outermost brace-delimited slice.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(text) {
        if v.is_object() {
            return Some(v);
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

fn vote_from_parsed(model: &str, parsed: serde_json::Value) -> CouncilVote {
    let verdict = parsed
        .get("verdict")
        .and_then(|v| v.as_str())
        .map(Verdict::parse)
        .unwrap_or(Verdict::Watch);
    let confidence = parsed
        .get("confidence")
        .and_then(|c| c.as_f64())
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);
    CouncilVote {
        model: model.to_string(),
        verdict,
        confidence,
        parsed,
    }
}

/// Fan the finding out to all providers in parallel with a hard per-call
/// deadline. Votes that error, time out, or fail to parse are dropped.
pub async fn run_finding_council(
    providers: &[Arc<dyn LlmProvider>],
    finding: &serde_json::Value,
    timeout: Duration,
) -> Vec<CouncilVote> {
    let prompt = council_prompt(finding);

    let mut tasks = tokio::task::JoinSet::new();
    for provider in providers {
        let provider = provider.clone();
        let prompt = prompt.clone();
        tasks.spawn(async move {
            let name = provider.name().to_string();
            match tokio::time::timeout(timeout, provider.call(SYSTEM_PROMPT, &prompt)).await {
                Ok(Ok(text)) => extract_json(&text).map(|parsed| vote_from_parsed(&name, parsed)),
                Ok(Err(e)) => {
                    warn!(model = %name, error = %e, "finding council call failed");
                    None
                }
                Err(_) => {
                    warn!(model = %name, "finding council call timed out");
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
    votes.sort_by(|a, b| a.model.cmp(&b.model));
    votes
}

/// Merge an ordered, deduped string list field across the usable votes.
fn merge_list(votes: &[CouncilVote], field: &str, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for vote in votes {
        if let Some(items) = vote.parsed.get(field).and_then(|v| v.as_array()) {
            for item in items {
                if let Some(s) = item.as_str() {
                    let s = s.trim();
                    if !s.is_empty() && seen.insert(s.to_string()) {
                        out.push(s.to_string());
                    }
                }
            }
        }
        if out.len() >= limit {
            break;
        }
    }
    out.truncate(limit);
    out
}

/// Compute the consensus over the usable votes. Returns `None` when there
/// are no votes at all (the caller substitutes [`Consensus::no_votes`]).
pub fn consensus(votes: &[CouncilVote], min_agree: usize) -> Option<Consensus> {
    if votes.is_empty() {
        return None;
    }

    // Fixed verdict order keeps count/weight ties deterministic.
    let verdicts = [Verdict::Act, Verdict::Watch, Verdict::Ignore];

    let count_of = |v: Verdict| votes.iter().filter(|vote| vote.verdict == v).count();
    let weight_of = |v: Verdict| -> f64 {
        votes
            .iter()
            .filter(|vote| vote.verdict == v)
            .map(|vote| vote.confidence)
            .sum()
    };

    let mut counts: Vec<(Verdict, usize)> = verdicts.iter().map(|&v| (v, count_of(v))).collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    let (mut top_verdict, top_count) = counts[0];
    let second_count = counts[1].1;

    let uncertainty_spike;
    if top_count < min_agree {
        uncertainty_spike = true;
        top_verdict = verdicts
            .iter()
            .copied()
            .fold((Verdict::Watch, f64::MIN), |(best, best_w), v| {
                let w = weight_of(v);
                if w > best_w {
                    (v, w)
                } else {
                    (best, best_w)
                }
            })
            .0;
    } else {
        uncertainty_spike = second_count == top_count;
    }

    let winners: Vec<&CouncilVote> = votes.iter().filter(|v| v.verdict == top_verdict).collect();
    let mut confidence = if winners.is_empty() {
        0.0
    } else {
        winners.iter().map(|v| v.confidence).sum::<f64>() / winners.len() as f64
    };
    if uncertainty_spike {
        confidence *= 0.75;
    }

    // Narrative fields come from the single most confident vote.
    let best = votes
        .iter()
        .max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .expect("votes is non-empty");

    Some(Consensus {
        verdict: top_verdict,
        confidence,
        uncertainty_spike,
        key_drivers: merge_list(votes, "key_drivers", 6),
        what_to_verify: merge_list(votes, "what_to_verify", 5),
        time_horizon: best
            .parsed
            .get("time_horizon")
            .and_then(|v| v.as_str())
            .unwrap_or("days")
            .to_string(),
        one_paragraph_summary: best
            .parsed
            .get("one_paragraph_summary")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn vote(model: &str, verdict: &str, confidence: f64) -> CouncilVote {
        vote_from_parsed(
            model,
            serde_json::json!({"verdict": verdict, "confidence": confidence}),
        )
    }

    #[test]
    fn extract_json_direct() {
        let v = extract_json(r#"{"verdict": "ACT"}"#).unwrap();
        assert_eq!(v["verdict"], "ACT");
    }

    #[test]
    fn extract_json_embedded() {
        let text = "Here is my analysis:\n```json\n{\"verdict\": \"WATCH\", \"confidence\": 0.6}\n```\nThanks!";
        let v = extract_json(text).unwrap();
        assert_eq!(v["verdict"], "WATCH");
    }

    #[test]
    fn extract_json_garbage_is_none() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("} backwards {").is_none());
    }

    #[test]
    fn majority_consensus_without_spike() {
        // Scenario: gpt=ACT@0.8, claude=ACT@0.7, gemini=WATCH@0.6.
        let votes = vec![
            vote("gpt", "ACT", 0.8),
            vote("claude", "ACT", 0.7),
            vote("gemini", "WATCH", 0.6),
        ];
        let c = consensus(&votes, 2).unwrap();
        assert_eq!(c.verdict, Verdict::Act);
        assert!(!c.uncertainty_spike);
        // Mean confidence of the ACT voters: (0.8 + 0.7) / 2.
        assert!((c.confidence - 0.75).abs() < 1e-12);
    }

    #[test]
    fn split_vote_spikes_and_uses_weighted_argmax() {
        // Scenario: one vote each — quorum unmet.
        let votes = vec![
            vote("gpt", "ACT", 0.9),
            vote("claude", "WATCH", 0.5),
            vote("gemini", "IGNORE", 0.4),
        ];
        let c = consensus(&votes, 2).unwrap();
        assert!(c.uncertainty_spike);
        // ACT carries the most weighted confidence.
        assert_eq!(c.verdict, Verdict::Act);
        // Winner confidence scaled by 0.75: 0.9 * 0.75.
        assert!((c.confidence - 0.675).abs() < 1e-12);
    }

    #[test]
    fn two_way_count_tie_spikes() {
        let votes = vec![
            vote("a", "ACT", 0.6),
            vote("b", "ACT", 0.6),
            vote("c", "WATCH", 0.9),
            vote("d", "WATCH", 0.9),
        ];
        let c = consensus(&votes, 2).unwrap();
        assert!(c.uncertainty_spike);
    }

    #[test]
    fn empty_votes_yield_none() {
        assert!(consensus(&[], 2).is_none());
        let fallback = Consensus::no_votes();
        assert_eq!(fallback.verdict, Verdict::Watch);
        assert!((fallback.confidence - 0.0).abs() < f64::EPSILON);
        assert!(fallback.uncertainty_spike);
    }

    #[test]
    fn merged_lists_are_deduped_and_capped() {
        let mk = |drivers: Vec<&str>| {
            vote_from_parsed(
                "m",
                serde_json::json!({
                    "verdict": "WATCH",
                    "confidence": 0.5,
                    "key_drivers": drivers,
                }),
            )
        };
        let votes = vec![
            mk(vec!["rates", "credit", "vol"]),
            mk(vec!["credit", "fx", "breadth", "liquidity", "momentum"]),
        ];
        let c = consensus(&votes, 2).unwrap();
        assert_eq!(
            c.key_drivers,
            vec!["rates", "credit", "vol", "fx", "breadth", "liquidity"]
        );
        assert!(c.key_drivers.len() <= 6);
    }

    #[test]
    fn malformed_verdict_defaults_to_watch() {
        let v = vote_from_parsed("m", serde_json::json!({"verdict": "PANIC", "confidence": 3.0}));
        assert_eq!(v.verdict, Verdict::Watch);
        assert!((v.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn prompt_embeds_finding_payload() {
        let finding = serde_json::json!({"title": "Credit stress", "symbol": "HYG"});
        let prompt = council_prompt(&finding);
        assert!(prompt.contains("Credit stress"));
        assert!(prompt.contains("STRICT JSON"));
    }
}
