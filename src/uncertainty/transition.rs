// =============================================================================
// Regime Transition Early-Warning Detector
// =============================================================================
//
// Scans recent uncertainty events for the precursors of a regime flip:
// a large score delta inside the window, an absolute critical level, a
// rising trend, or repeated spikes. High-severity warnings fan out through
// the notification channel.
// =============================================================================

use serde::Serialize;

use crate::store::UncertaintyEventRecord;

/// Score delta inside the window that flags a transition.
const SPIKE_THRESHOLD: f64 = 0.5;
/// Absolute level that flags a transition outright.
const CRITICAL_LEVEL: f64 = 0.67;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionWarning {
    pub transition: bool,
    pub delta: f64,
    pub current: f64,
    pub trend: f64,
    pub spike_count: usize,
    pub samples: usize,
    pub severity: WarningSeverity,
    pub reason: String,
}

/// Analyse a window of uncertainty events (oldest first).
pub fn detect_transition(events: &[UncertaintyEventRecord]) -> TransitionWarning {
    if events.len() < 3 {
        return TransitionWarning {
            transition: false,
            delta: 0.0,
            current: events.last().map(|e| e.score).unwrap_or(0.0),
            trend: 0.0,
            spike_count: 0,
            samples: events.len(),
            severity: WarningSeverity::Low,
            reason: "insufficient_events".to_string(),
        };
    }

    let levels: Vec<f64> = events.iter().map(|e| e.score).collect();
    let current = *levels.last().unwrap_or(&0.0);
    let min = levels.iter().cloned().fold(f64::MAX, f64::min);
    let max = levels.iter().cloned().fold(f64::MIN, f64::max);
    let delta = max - min;

    let half = levels.len() / 2;
    let avg_early = levels[..half].iter().sum::<f64>() / half.max(1) as f64;
    let avg_late = levels[half..].iter().sum::<f64>() / (levels.len() - half).max(1) as f64;
    let trend = avg_late - avg_early;

    let spike_count = events.iter().filter(|e| e.spike).count();

    let mut transition = false;
    let mut severity = WarningSeverity::Low;
    let mut reasons: Vec<String> = Vec::new();

    if delta >= SPIKE_THRESHOLD {
        transition = true;
        severity = WarningSeverity::Medium;
        reasons.push(format!("delta_spike({delta:.2})"));
    }
    if current >= CRITICAL_LEVEL {
        transition = true;
        severity = WarningSeverity::High;
        reasons.push(format!("critical_level({current:.2})"));
    }
    if trend > 0.3 && current > 0.5 {
        transition = true;
        if severity == WarningSeverity::Low {
            severity = WarningSeverity::Medium;
        }
        reasons.push(format!("rising_trend({trend:.2})"));
    }
    if spike_count >= 2 {
        transition = true;
        severity = WarningSeverity::High;
        reasons.push(format!("multiple_spikes({spike_count})"));
    }

    TransitionWarning {
        transition,
        delta,
        current,
        trend,
        spike_count,
        samples: levels.len(),
        severity,
        reason: if reasons.is_empty() {
            "stable".to_string()
        } else {
            reasons.join(", ")
        },
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(score: f64, spike: bool) -> UncertaintyEventRecord {
        UncertaintyEventRecord {
            id: 0,
            timestamp: Utc::now(),
            label: "calm".into(),
            score,
            spike,
            disagreement: 0.0,
            votes: serde_json::Value::Null,
            active_regime: None,
            regime_confidence: None,
            cadence_multiplier: 1.0,
            decay_multiplier: 1.0,
        }
    }

    #[test]
    fn too_few_events_is_stable() {
        let warning = detect_transition(&[event(0.9, true)]);
        assert!(!warning.transition);
        assert_eq!(warning.reason, "insufficient_events");
    }

    #[test]
    fn stable_low_levels_raise_nothing() {
        let events: Vec<_> = (0..6).map(|_| event(0.1, false)).collect();
        let warning = detect_transition(&events);
        assert!(!warning.transition);
        assert_eq!(warning.reason, "stable");
    }

    #[test]
    fn large_delta_flags_medium() {
        let events = vec![event(0.05, false), event(0.1, false), event(0.6, false)];
        let warning = detect_transition(&events);
        assert!(warning.transition);
        assert_eq!(warning.severity, WarningSeverity::Medium);
        assert!(warning.reason.contains("delta_spike"));
    }

    #[test]
    fn critical_level_flags_high() {
        let events = vec![event(0.5, false), event(0.6, false), event(0.7, false)];
        let warning = detect_transition(&events);
        assert!(warning.transition);
        assert_eq!(warning.severity, WarningSeverity::High);
        assert!(warning.reason.contains("critical_level"));
    }

    #[test]
    fn repeated_spikes_flag_high() {
        let events = vec![event(0.2, true), event(0.25, true), event(0.3, false)];
        let warning = detect_transition(&events);
        assert!(warning.transition);
        assert_eq!(warning.spike_count, 2);
        assert_eq!(warning.severity, WarningSeverity::High);
    }

    #[test]
    fn rising_trend_flags_transition() {
        let events = vec![
            event(0.20, false),
            event(0.22, false),
            event(0.55, false),
            event(0.60, false),
        ];
        let warning = detect_transition(&events);
        assert!(warning.transition);
        assert!(warning.reason.contains("rising_trend"));
    }
}
