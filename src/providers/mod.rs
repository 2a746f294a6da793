// =============================================================================
// LLM Provider Adapters — unified interface for GPT, Claude, and Gemini
// =============================================================================
//
// Each provider implements `call(system, user) -> String`. Providers are
// constructed from environment credentials; a missing key means the provider
// is simply absent and the councils degrade gracefully. API keys are never
// logged or serialised.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

/// HTTP timeout applied at the client level. Councils additionally enforce
/// their own per-call deadline.
const HTTP_TIMEOUT_SECS: u64 = 45;

/// Capability interface for a single LLM backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn call(&self, system: &str, user: &str) -> Result<String>;
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .unwrap_or_default()
}

/// Build every provider that has credentials configured, in a fixed order.
pub fn providers_from_env() -> Vec<Arc<dyn LlmProvider>> {
    let mut providers: Vec<Arc<dyn LlmProvider>> = Vec::new();
    if let Some(p) = OpenAiProvider::from_env() {
        providers.push(Arc::new(p));
    }
    if let Some(p) = AnthropicProvider::from_env() {
        providers.push(Arc::new(p));
    }
    if let Some(p) = GeminiProvider::from_env() {
        providers.push(Arc::new(p));
    }
    info!(count = providers.len(), "LLM providers configured");
    providers
}

// =============================================================================
// OpenAI
// =============================================================================

pub struct OpenAiProvider {
    model: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty())?;
        Some(Self {
            model: std::env::var("OPENAI_COUNCIL_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            api_key,
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            client: http_client(),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "gpt"
    }

    async fn call(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": 0.2,
            "max_tokens": 1500,
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("OpenAI request failed")?;

        let status = resp.status();
        let body: serde_json::Value =
            resp.json().await.context("failed to parse OpenAI response")?;
        if !status.is_success() {
            anyhow::bail!("OpenAI returned {status}: {body}");
        }

        let text = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .trim()
            .to_string();
        debug!(model = %self.model, chars = text.len(), "OpenAI call complete");
        Ok(text)
    }
}

// =============================================================================
// Anthropic
// =============================================================================

pub struct AnthropicProvider {
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())?;
        Some(Self {
            model: std::env::var("ANTHROPIC_COUNCIL_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-20250514".into()),
            api_key,
            client: http_client(),
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "claude"
    }

    async fn call(&self, system: &str, user: &str) -> Result<String> {
        let payload = serde_json::json!({
            "model": self.model,
            "max_tokens": 1500,
            "temperature": 0.2,
            "system": system,
            "messages": [{"role": "user", "content": user}],
        });

        let resp = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&payload)
            .send()
            .await
            .context("Anthropic request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse Anthropic response")?;
        if !status.is_success() {
            anyhow::bail!("Anthropic returned {status}: {body}");
        }

        let text: String = body["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"].as_str() == Some("text"))
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        debug!(model = %self.model, chars = text.len(), "Anthropic call complete");
        Ok(text.trim().to_string())
    }
}

// =============================================================================
// Gemini
// =============================================================================

pub struct GeminiProvider {
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())?;
        Some(Self {
            model: std::env::var("GEMINI_COUNCIL_MODEL")
                .unwrap_or_else(|_| "gemini-2.0-flash".into()),
            api_key,
            client: http_client(),
        })
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn call(&self, system: &str, user: &str) -> Result<String> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let payload = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [{"text": format!("SYSTEM:\n{system}\n\nUSER:\n{user}")}]
            }],
            "generationConfig": {"temperature": 0.2, "maxOutputTokens": 1500},
        });

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("Gemini request failed")?;

        let status = resp.status();
        let body: serde_json::Value =
            resp.json().await.context("failed to parse Gemini response")?;
        if !status.is_success() {
            anyhow::bail!("Gemini returned {status}: {body}");
        }

        let text: String = body["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        debug!(model = %self.model, chars = text.len(), "Gemini call complete");
        Ok(text.trim().to_string())
    }
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl std::fmt::Debug for GeminiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiProvider")
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .finish()
    }
}
