// =============================================================================
// Regime Classification Module
// =============================================================================
//
// Macro regime scoring from observable market features:
// - SPY 20-period return direction
// - VIX level against a volatility threshold
// - 10Y yield 20-period change
// - optional commodities 20-period direction
//
// Rule-count scores are softmaxed into a probability distribution with
// hysteresis on the previously active regime, and the active regime drives
// per-agent weight rotation through the skill table.

pub mod classifier;
pub mod weights;

pub use classifier::{classify, extract_features, score_regimes, MarketFeatures, RegimeSnapshot};
pub use weights::{rotate_weights, RegimeSkillTable, SkillStat};
