// =============================================================================
// Notification Channel — email delivery behind a capability trait
// =============================================================================
//
// `send` either delivers or errors; the caller owns idempotency (the gate
// only flips `alerted` after a successful send). The SendGrid adapter is
// enabled by `SENDGRID_API_KEY` + `ALERT_EMAIL_FROM`; recipients come from
// the comma-separated `ALERT_EMAIL_TO` whitelist.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, to: &[String], subject: &str, text: &str, html: &str) -> Result<()>;
}

/// Build the notifier and recipient whitelist from the environment. `None`
/// disables alerting entirely; the gate then leaves `alerted = false`.
pub fn notifier_from_env() -> (Option<Arc<dyn Notifier>>, Vec<String>) {
    let recipients: Vec<String> = std::env::var("ALERT_EMAIL_TO")
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let notifier = SendgridNotifier::from_env().map(|n| {
        info!(recipients = recipients.len(), "email notifier configured");
        Arc::new(n) as Arc<dyn Notifier>
    });

    (notifier, recipients)
}

// =============================================================================
// SendGrid adapter
// =============================================================================

pub struct SendgridNotifier {
    api_key: String,
    from: String,
    client: reqwest::Client,
}

impl SendgridNotifier {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("SENDGRID_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())?;
        let from = std::env::var("ALERT_EMAIL_FROM")
            .ok()
            .filter(|f| !f.is_empty())?;
        Some(Self {
            api_key,
            from,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl Notifier for SendgridNotifier {
    async fn send(&self, to: &[String], subject: &str, text: &str, html: &str) -> Result<()> {
        if to.is_empty() {
            anyhow::bail!("no recipients configured");
        }

        let personalizations: Vec<serde_json::Value> = to
            .iter()
            .map(|addr| serde_json::json!({"to": [{"email": addr}]}))
            .collect();
        let payload = serde_json::json!({
            "personalizations": personalizations,
            "from": {"email": self.from},
            "subject": subject,
            "content": [
                {"type": "text/plain", "value": text},
                {"type": "text/html", "value": html},
            ],
        });

        let resp = self
            .client
            .post("https://api.sendgrid.com/v3/mail/send")
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("SendGrid request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("SendGrid returned {status}: {body}");
        }

        info!(recipients = to.len(), subject, "alert email sent");
        Ok(())
    }
}

impl std::fmt::Debug for SendgridNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendgridNotifier")
            .field("api_key", &"<redacted>")
            .field("from", &self.from)
            .finish()
    }
}
