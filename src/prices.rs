// =============================================================================
// Price Series Source — close-series loader behind a capability trait
// =============================================================================
//
// The core only ever needs a time-ordered close series per symbol. The HTTP
// implementation hits a configurable JSON endpoint; when no endpoint is
// configured the null source returns empty series and the TA vote degrades
// to WATCH.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

/// Loads a time-indexed close series (oldest first) for a symbol. An empty
/// or short series is valid output; callers degrade accordingly.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn load_closes(&self, symbol: &str) -> Result<Vec<f64>>;
}

/// Pick the price source from the environment: `ARGUS_PRICE_API_URL` enables
/// the HTTP source, otherwise the null source is used.
pub fn price_source_from_env() -> std::sync::Arc<dyn PriceSource> {
    match std::env::var("ARGUS_PRICE_API_URL") {
        Ok(url) if !url.is_empty() => {
            info!(url = %url, "HTTP price source configured");
            std::sync::Arc::new(HttpPriceSource::new(url))
        }
        _ => {
            info!("no price API configured — TA degrades to WATCH");
            std::sync::Arc::new(NullPriceSource)
        }
    }
}

// =============================================================================
// HTTP source
// =============================================================================

/// Fetches `{base_url}?symbol=<S>&limit=<N>` and accepts either a bare JSON
/// array of numbers or an array of objects carrying a close field.
pub struct HttpPriceSource {
    base_url: String,
    limit: usize,
    client: reqwest::Client,
}

impl HttpPriceSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            limit: 250,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    fn parse_closes(body: &serde_json::Value) -> Vec<f64> {
        let Some(rows) = body.as_array() else {
            return Vec::new();
        };
        rows.iter()
            .filter_map(|row| {
                if let Some(n) = row.as_f64() {
                    return Some(n);
                }
                // Object rows: accept "close" / "Close" / "c", string or number.
                let field = row
                    .get("close")
                    .or_else(|| row.get("Close"))
                    .or_else(|| row.get("c"))?;
                field
                    .as_f64()
                    .or_else(|| field.as_str().and_then(|s| s.parse().ok()))
            })
            .collect()
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn load_closes(&self, symbol: &str) -> Result<Vec<f64>> {
        let url = format!("{}?symbol={}&limit={}", self.base_url, symbol, self.limit);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("price request for {symbol} failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse price response for {symbol}"))?;
        if !status.is_success() {
            anyhow::bail!("price API returned {status} for {symbol}");
        }

        let closes = Self::parse_closes(&body);
        debug!(symbol, bars = closes.len(), "price series fetched");
        Ok(closes)
    }
}

/// Source used when no price API is configured.
pub struct NullPriceSource;

#[async_trait]
impl PriceSource for NullPriceSource {
    async fn load_closes(&self, _symbol: &str) -> Result<Vec<f64>> {
        Ok(Vec::new())
    }
}
