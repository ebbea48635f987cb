//! Digest sinks: where published digests go.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::error::ExternalError;
use crate::pipeline::digest::DigestSummary;

/// Destination for digest summaries.
#[async_trait]
pub trait DigestSink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, summary: &DigestSummary) -> Result<(), ExternalError>;
}

/// Posts the digest to a chat-style webhook as an embed.
pub struct WebhookDigestSink {
    url: SecretString,
    client: reqwest::Client,
}

impl WebhookDigestSink {
    pub fn new(url: SecretString) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }

    /// Request body for one digest.
    pub fn payload(summary: &DigestSummary) -> serde_json::Value {
        let lines = |pairs: Vec<String>| {
            if pairs.is_empty() {
                "None".to_string()
            } else {
                pairs.join("\n")
            }
        };
        let categories = lines(
            summary
                .category_counts
                .iter()
                .map(|(category, count)| format!("{category}: {count}"))
                .collect(),
        );
        let urgency = lines(
            summary
                .urgency_counts
                .iter()
                .map(|(urgency, count)| format!("{urgency}: {count}"))
                .collect(),
        );

        serde_json::json!({
            "content": summary.render_text(),
            "embeds": [{
                "title": "Daily Mail Digest",
                "description": format!("Messages processed on {}", summary.date),
                "fields": [
                    { "name": "Total", "value": format!("{} messages processed", summary.total), "inline": false },
                    { "name": "Categories", "value": categories, "inline": true },
                    { "name": "Urgency", "value": urgency, "inline": true },
                    { "name": "Auto-replied", "value": format!("{} messages", summary.auto_replied_count), "inline": true },
                ],
                "timestamp": summary.generated_at.to_rfc3339(),
            }],
        })
    }
}

#[async_trait]
impl DigestSink for WebhookDigestSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn publish(&self, summary: &DigestSummary) -> Result<(), ExternalError> {
        let resp = self
            .client
            .post(self.url.expose_secret())
            .json(&Self::payload(summary))
            .send()
            .await
            .map_err(|e| ExternalError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExternalError::Api {
                service: "digest webhook".into(),
                reason: format!("{status}: {body}"),
            });
        }
        Ok(())
    }
}

/// Writes the digest to the log only.
pub struct LogDigestSink;

#[async_trait]
impl DigestSink for LogDigestSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, summary: &DigestSummary) -> Result<(), ExternalError> {
        info!(
            date = %summary.date,
            total = summary.total,
            auto_replied = summary.auto_replied_count,
            "{}",
            summary.render_text()
        );
        Ok(())
    }
}
