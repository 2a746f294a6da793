// =============================================================================
// Shared types used across the Argus signal platform
// =============================================================================

use serde::{Deserialize, Serialize};

/// Ordinal severity attached to every finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Medium
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl Severity {
    /// Parse a severity string; anything unrecognised falls back to `Medium`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            "critical" => Self::Critical,
            _ => Self::Medium,
        }
    }
}

/// Council / gate decision on a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Act,
    Watch,
    Ignore,
}

impl Default for Verdict {
    fn default() -> Self {
        Self::Watch
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Act => write!(f, "ACT"),
            Self::Watch => write!(f, "WATCH"),
            Self::Ignore => write!(f, "IGNORE"),
        }
    }
}

impl Verdict {
    /// Parse a model-produced verdict string; unrecognised input maps to
    /// `Watch` so a sloppy model response never escalates a finding.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACT" => Self::Act,
            "IGNORE" => Self::Ignore,
            _ => Self::Watch,
        }
    }
}

/// System-wide uncertainty label produced by the uncertainty council.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UncertaintyLabel {
    Calm,
    RiskOff,
    Transition,
    Shock,
}

impl Default for UncertaintyLabel {
    fn default() -> Self {
        Self::Calm
    }
}

impl std::fmt::Display for UncertaintyLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Calm => write!(f, "calm"),
            Self::RiskOff => write!(f, "risk_off"),
            Self::Transition => write!(f, "transition"),
            Self::Shock => write!(f, "shock"),
        }
    }
}

impl UncertaintyLabel {
    /// Parse a label string; anything unrecognised is treated as `Calm`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "risk_off" => Self::RiskOff,
            "transition" => Self::Transition,
            "shock" => Self::Shock,
            _ => Self::Calm,
        }
    }
}

/// Payload an agent hands back from `analyze()`. The scheduler persists one
/// finding row per draft, in the order produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingDraft {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub market_type: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_confidence() -> f64 {
    0.5
}

impl FindingDraft {
    /// Clamp confidence into [0, 1] so a buggy agent cannot break the store
    /// invariant.
    pub fn sanitized(mut self) -> Self {
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self
    }
}
