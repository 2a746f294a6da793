// =============================================================================
// Regime Classifier — feature rules, softmax scoring, hysteresis
// =============================================================================
//
// Each regime in the menu declares the feature values it requires; a regime's
// raw score is the number of matching rules. Scores are converted to a
// probability distribution via softmax. Hysteresis keeps the previously
// active regime while its probability stays above HYSTERESIS_PROB, so the
// platform does not thrash between regimes on marginal evidence.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// VIX level separating high from low volatility.
const VIX_HIGH: f64 = 25.0;
/// 10Y yield 20-period change above which rates count as rising.
const RATE_MOVE_THRESHOLD: f64 = 0.1;
/// Previous regime sticks while its probability exceeds this.
const HYSTERESIS_PROB: f64 = 0.35;
/// Below this confidence the classification is flagged as transitional.
const TRANSITION_CONFIDENCE: f64 = 0.60;

/// Feature requirements per regime. A rule referencing a feature the input
/// does not carry (e.g. commodities) simply never matches.
const REGIME_RULES: &[(&str, &[(&str, &str)])] = &[
    (
        "risk_on",
        &[
            ("spy_trend", "up"),
            ("volatility", "low"),
            ("rates_trend", "down_or_flat"),
        ],
    ),
    (
        "risk_off",
        &[
            ("spy_trend", "down"),
            ("volatility", "high"),
            ("rates_trend", "up"),
        ],
    ),
    ("inflation", &[("rates_trend", "up"), ("commodities", "up")]),
    ("deflation", &[("rates_trend", "down"), ("commodities", "down")]),
];

// =============================================================================
// Features
// =============================================================================

/// Observable market features extracted from recent close series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarketFeatures {
    /// "up" | "down" — sign of the SPY 20-period return.
    pub spy_trend: &'static str,
    /// "high" | "low" — VIX level against [`VIX_HIGH`].
    pub volatility: &'static str,
    /// "up" | "down_or_flat" — 10Y yield 20-period change.
    pub rates_trend: &'static str,
    /// "up" | "down" when a commodities series was supplied.
    pub commodities: Option<&'static str>,
}

impl MarketFeatures {
    fn get(&self, key: &str) -> Option<&'static str> {
        match key {
            "spy_trend" => Some(self.spy_trend),
            "volatility" => Some(self.volatility),
            "rates_trend" => Some(self.rates_trend),
            "commodities" => self.commodities,
            _ => None,
        }
    }
}

/// Extract features from close series (latest last). Returns `None` when the
/// SPY or rates history is too short for a 20-period lookback, or the VIX
/// series is empty.
pub fn extract_features(
    spy: &[f64],
    vix: &[f64],
    rates: &[f64],
    commodities: Option<&[f64]>,
) -> Option<MarketFeatures> {
    if spy.len() < 21 || rates.len() < 21 {
        return None;
    }
    let vix_level = *vix.last()?;

    let spy_now = *spy.last()?;
    let spy_then = spy[spy.len() - 21];
    if spy_then == 0.0 {
        return None;
    }
    let spy_return = spy_now / spy_then - 1.0;

    let rates_change = rates[rates.len() - 1] - rates[rates.len() - 21];

    let commodities = commodities.and_then(|c| {
        if c.len() < 21 || c[c.len() - 21] == 0.0 {
            return None;
        }
        let ret = c[c.len() - 1] / c[c.len() - 21] - 1.0;
        Some(if ret > 0.0 { "up" } else { "down" })
    });

    Some(MarketFeatures {
        spy_trend: if spy_return > 0.0 { "up" } else { "down" },
        volatility: if vix_level > VIX_HIGH { "high" } else { "low" },
        rates_trend: if rates_change > RATE_MOVE_THRESHOLD {
            "up"
        } else {
            "down_or_flat"
        },
        commodities,
    })
}

// =============================================================================
// Scoring & classification
// =============================================================================

/// Count matching rules per regime.
pub fn score_regimes(features: &MarketFeatures) -> BTreeMap<String, f64> {
    let mut scores = BTreeMap::new();
    for (regime, rules) in REGIME_RULES {
        let score = rules
            .iter()
            .filter(|(key, required)| features.get(key) == Some(*required))
            .count() as f64;
        scores.insert((*regime).to_string(), score);
    }
    scores
}

/// Snapshot of the active regime published by the regime rotation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub active_regime: String,
    pub confidence: f64,
    pub transition: bool,
    pub distribution: BTreeMap<String, f64>,
    pub asof: DateTime<Utc>,
}

impl RegimeSnapshot {
    /// Fallback when no market data is available: the allocator treats
    /// regime weights as base weights under this snapshot.
    pub fn unknown() -> Self {
        Self {
            active_regime: "unknown".to_string(),
            confidence: 0.0,
            transition: true,
            distribution: BTreeMap::new(),
            asof: Utc::now(),
        }
    }
}

/// Convert raw scores into a probability distribution and pick the active
/// regime, applying hysteresis against `prev`.
pub fn regime_confidence(scores: &BTreeMap<String, f64>, prev: Option<&str>) -> RegimeSnapshot {
    if scores.is_empty() {
        return RegimeSnapshot::unknown();
    }

    // All-zero scores carry no information; softmax over ones gives a
    // uniform distribution instead of a degenerate one.
    let max_score = scores.values().cloned().fold(f64::MIN, f64::max);
    let effective: Vec<(&String, f64)> = scores
        .iter()
        .map(|(k, &v)| (k, if max_score == 0.0 { 1.0 } else { v }))
        .collect();

    let peak = effective
        .iter()
        .map(|(_, v)| *v)
        .fold(f64::MIN, f64::max);
    let denom: f64 = effective.iter().map(|(_, v)| (v - peak).exp()).sum();
    let distribution: BTreeMap<String, f64> = effective
        .iter()
        .map(|(k, v)| ((*k).clone(), (v - peak).exp() / denom))
        .collect();

    let (mut active, mut confidence) = distribution
        .iter()
        .fold((String::new(), f64::MIN), |(name, best), (k, &p)| {
            if p > best {
                (k.clone(), p)
            } else {
                (name, best)
            }
        });

    if let Some(prev) = prev {
        let prev_prob = distribution.get(prev).copied().unwrap_or(0.0);
        if prev_prob > HYSTERESIS_PROB {
            active = prev.to_string();
            confidence = prev_prob;
        }
    }

    let transition = confidence < TRANSITION_CONFIDENCE;

    debug!(
        regime = %active,
        confidence = format!("{confidence:.3}"),
        transition,
        "regime classified"
    );

    RegimeSnapshot {
        active_regime: active,
        confidence,
        transition,
        distribution,
        asof: Utc::now(),
    }
}

/// Full pipeline: features → scores → classification with hysteresis.
/// Missing features degrade to the `unknown` snapshot.
pub fn classify(features: Option<&MarketFeatures>, prev: Option<&str>) -> RegimeSnapshot {
    match features {
        Some(f) => regime_confidence(&score_regimes(f), prev),
        None => RegimeSnapshot::unknown(),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn risk_on_features() -> MarketFeatures {
        MarketFeatures {
            spy_trend: "up",
            volatility: "low",
            rates_trend: "down_or_flat",
            commodities: None,
        }
    }

    #[test]
    fn extract_features_basic() {
        let spy: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let vix = vec![18.0];
        let rates: Vec<f64> = (0..30).map(|_| 4.0).collect();

        let f = extract_features(&spy, &vix, &rates, None).unwrap();
        assert_eq!(f.spy_trend, "up");
        assert_eq!(f.volatility, "low");
        assert_eq!(f.rates_trend, "down_or_flat");
        assert!(f.commodities.is_none());
    }

    #[test]
    fn extract_features_requires_lookback() {
        let short = vec![1.0; 10];
        let long = vec![1.0; 30];
        assert!(extract_features(&short, &[20.0], &long, None).is_none());
        assert!(extract_features(&long, &[], &long, None).is_none());
    }

    #[test]
    fn extract_features_high_vol_rising_rates() {
        let spy: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        let vix = vec![31.0];
        let mut rates = vec![4.0; 30];
        rates[29] = 4.5;
        let comm: Vec<f64> = (0..30).map(|i| 50.0 + i as f64).collect();

        let f = extract_features(&spy, &vix, &rates, Some(&comm)).unwrap();
        assert_eq!(f.spy_trend, "down");
        assert_eq!(f.volatility, "high");
        assert_eq!(f.rates_trend, "up");
        assert_eq!(f.commodities, Some("up"));
    }

    #[test]
    fn risk_on_scores_highest() {
        let scores = score_regimes(&risk_on_features());
        assert!((scores["risk_on"] - 3.0).abs() < f64::EPSILON);
        assert!((scores["risk_off"] - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn classify_risk_on_scenario() {
        let snapshot = classify(Some(&risk_on_features()), None);
        assert_eq!(snapshot.active_regime, "risk_on");
        let max_other = snapshot
            .distribution
            .iter()
            .filter(|(k, _)| *k != "risk_on")
            .map(|(_, v)| *v)
            .fold(f64::MIN, f64::max);
        assert!(snapshot.confidence >= max_other);
        assert!(!snapshot.transition);
    }

    #[test]
    fn hysteresis_keeps_previous_regime() {
        // Previous regime still above the 0.35 hysteresis bar stays active
        // even when another regime outscores it.
        let mut scores = BTreeMap::new();
        scores.insert("risk_on".to_string(), 0.5);
        scores.insert("shock".to_string(), 0.4);
        let snapshot = regime_confidence(&scores, Some("shock"));
        // softmax(0.5, 0.4) => shock ≈ 0.475 > 0.35.
        assert_eq!(snapshot.active_regime, "shock");
        assert!(snapshot.confidence > 0.35);
        assert!(snapshot.transition);
    }

    #[test]
    fn hysteresis_releases_when_prob_drops() {
        let mut scores = BTreeMap::new();
        scores.insert("risk_on".to_string(), 3.0);
        scores.insert("risk_off".to_string(), 0.0);
        let snapshot = regime_confidence(&scores, Some("risk_off"));
        assert_eq!(snapshot.active_regime, "risk_on");
    }

    #[test]
    fn same_regime_hysteresis_is_stable() {
        let snapshot1 = classify(Some(&risk_on_features()), Some("risk_on"));
        assert_eq!(snapshot1.active_regime, "risk_on");
    }

    #[test]
    fn classification_is_deterministic() {
        let a = classify(Some(&risk_on_features()), None);
        let b = classify(Some(&risk_on_features()), None);
        assert_eq!(a.active_regime, b.active_regime);
        for (k, v) in &a.distribution {
            assert_eq!(v.to_bits(), b.distribution[k].to_bits());
        }
    }

    #[test]
    fn zero_scores_yield_uniform_distribution() {
        let mut scores = BTreeMap::new();
        scores.insert("a".to_string(), 0.0);
        scores.insert("b".to_string(), 0.0);
        let snapshot = regime_confidence(&scores, None);
        assert!((snapshot.distribution["a"] - 0.5).abs() < 1e-12);
        assert!(snapshot.transition);
    }

    #[test]
    fn missing_features_degrade_to_unknown() {
        let snapshot = classify(None, Some("risk_on"));
        assert_eq!(snapshot.active_regime, "unknown");
        assert!((snapshot.confidence - 0.0).abs() < f64::EPSILON);
        assert!(snapshot.transition);
    }

    #[test]
    fn probabilities_sum_to_one() {
        let snapshot = classify(Some(&risk_on_features()), None);
        let sum: f64 = snapshot.distribution.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
