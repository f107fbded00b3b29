//! HTTP broker backend: POSTs the envelope to a per-topic URL.

use async_trait::async_trait;

use super::BrokerPublisher;
use crate::service::Envelope;

pub const WEBHOOK_TOKEN_HEADER: &str = "x-gitrelay-token";

#[derive(Debug, Clone, serde::Deserialize)]
struct HttpConfig {
    /// Base URL; the topic is appended as a path segment.
    base_url: Option<String>,
    /// Templated URL; `{topic}` is replaced with the topic name. Takes
    /// precedence over `base_url`.
    url_template: Option<String>,
    webhook_token: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug)]
pub struct HttpPublisher {
    client: reqwest::Client,
    base_url: Option<String>,
    url_template: Option<String>,
    webhook_token: Option<String>,
}

impl HttpPublisher {
    pub fn from_config(config: &serde_json::Value) -> anyhow::Result<Self> {
        let parsed: HttpConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("invalid http driver config: {e}"))?;
        if parsed.base_url.is_none() && parsed.url_template.is_none() {
            anyhow::bail!("http driver config requires `base_url` or `url_template`");
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(
                parsed.timeout_ms.unwrap_or(10_000),
            ))
            .build()?;
        Ok(Self {
            client,
            base_url: parsed.base_url,
            url_template: parsed.url_template,
            webhook_token: parsed.webhook_token,
        })
    }

    fn url_for(&self, topic: &str) -> String {
        if let Some(template) = &self.url_template {
            return template.replace("{topic}", topic);
        }
        let base = self.base_url.as_deref().unwrap_or_default();
        format!("{}/{topic}", base.trim_end_matches('/'))
    }
}

#[async_trait]
impl BrokerPublisher for HttpPublisher {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn publish(&self, topic: &str, envelope: &Envelope) -> anyhow::Result<()> {
        let mut request = self.client.post(self.url_for(topic)).json(envelope);
        for (key, value) in envelope.metadata() {
            request = request.header(format!("x-gitrelay-{key}").replace('_', "-"), value);
        }
        if let Some(token) = &self.webhook_token {
            request = request.header(WEBHOOK_TOKEN_HEADER, token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("http sink responded {status}");
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_from_base() {
        let publisher = HttpPublisher::from_config(&serde_json::json!({
            "base_url": "https://sink.example.com/hooks/",
        }))
        .unwrap();
        assert_eq!(
            publisher.url_for("pr.opened"),
            "https://sink.example.com/hooks/pr.opened"
        );
    }

    #[test]
    fn url_from_template() {
        let publisher = HttpPublisher::from_config(&serde_json::json!({
            "url_template": "https://sink.example.com/t/{topic}/deliver",
        }))
        .unwrap();
        assert_eq!(
            publisher.url_for("pr.opened"),
            "https://sink.example.com/t/pr.opened/deliver"
        );
    }

    #[test]
    fn config_requires_a_url() {
        assert!(HttpPublisher::from_config(&serde_json::json!({})).is_err());
    }
}
