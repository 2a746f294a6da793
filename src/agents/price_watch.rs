// =============================================================================
// Price-Watch Agent — reference agent built on the price-series contract
// =============================================================================
//
// Flags outsized 20-bar moves on a watched symbol. Mostly a wiring example:
// real deployments register their own fleets against the `Agent` trait.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::agents::Agent;
use crate::prices::PriceSource;
use crate::types::{FindingDraft, Severity};

/// Absolute 20-bar return that rates a high-severity finding.
const HIGH_MOVE: f64 = 0.08;
/// Absolute 20-bar return below which nothing is reported.
const MIN_MOVE: f64 = 0.03;

pub struct PriceWatchAgent {
    name: String,
    symbol: String,
    prices: Arc<dyn PriceSource>,
}

impl PriceWatchAgent {
    pub fn new(symbol: impl Into<String>, prices: Arc<dyn PriceSource>) -> Self {
        let symbol = symbol.into();
        Self {
            name: format!("price_watch_{}", symbol.to_lowercase()),
            symbol,
            prices,
        }
    }

    fn draft_for_move(&self, move_20: f64, price: f64) -> FindingDraft {
        let (severity, confidence) = if move_20.abs() >= HIGH_MOVE {
            (Severity::High, 0.75)
        } else {
            (Severity::Medium, 0.55)
        };
        let direction = if move_20 > 0.0 { "up" } else { "down" };
        FindingDraft {
            title: format!(
                "{} moved {:.1}% over 20 bars",
                self.symbol,
                move_20 * 100.0
            ),
            description: format!(
                "{} is {} {:.2}% over the last 20 bars (last price {:.2}).",
                self.symbol,
                direction,
                move_20.abs() * 100.0,
                price
            ),
            severity,
            confidence,
            symbol: Some(self.symbol.clone()),
            market_type: Some("equity".to_string()),
            metadata: serde_json::json!({
                "move_20bar": move_20,
                "last_price": price,
            }),
        }
    }
}

#[async_trait]
impl Agent for PriceWatchAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn analyze(&self) -> Result<Vec<FindingDraft>> {
        let closes = self.prices.load_closes(&self.symbol).await?;
        if closes.len() < 21 {
            return Ok(Vec::new());
        }

        let now = closes[closes.len() - 1];
        let then = closes[closes.len() - 21];
        if then == 0.0 {
            return Ok(Vec::new());
        }
        let move_20 = now / then - 1.0;

        if move_20.abs() < MIN_MOVE {
            return Ok(Vec::new());
        }
        Ok(vec![self.draft_for_move(move_20, now)])
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPrices(Vec<f64>);

    #[async_trait]
    impl PriceSource for FixedPrices {
        async fn load_closes(&self, _symbol: &str) -> Result<Vec<f64>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn quiet_market_produces_nothing() {
        let closes = vec![100.0; 40];
        let agent = PriceWatchAgent::new("SPY", Arc::new(FixedPrices(closes)));
        assert!(agent.analyze().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn large_move_produces_high_severity() {
        let mut closes = vec![100.0; 30];
        closes.push(112.0); // +12% vs 20 bars ago
        let agent = PriceWatchAgent::new("SPY", Arc::new(FixedPrices(closes)));
        let findings = agent.analyze().await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::High);
        assert_eq!(findings[0].symbol.as_deref(), Some("SPY"));
    }

    #[tokio::test]
    async fn short_history_produces_nothing() {
        let agent = PriceWatchAgent::new("SPY", Arc::new(FixedPrices(vec![1.0; 5])));
        assert!(agent.analyze().await.unwrap().is_empty());
    }
}
