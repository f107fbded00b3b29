//! NATS broker backend.

use async_trait::async_trait;

use super::BrokerPublisher;
use crate::service::Envelope;

#[derive(Debug, serde::Deserialize)]
struct NatsConfig {
    url: String,
    /// Optional prefix prepended to the topic, dot separated.
    subject_prefix: Option<String>,
}

#[derive(Debug)]
pub struct NatsPublisher {
    client: async_nats::Client,
    subject_prefix: Option<String>,
}

impl NatsPublisher {
    pub async fn connect(config: &serde_json::Value) -> anyhow::Result<Self> {
        let parsed: NatsConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("invalid nats driver config: {e}"))?;
        let client = async_nats::connect(&parsed.url).await?;
        Ok(Self {
            client,
            subject_prefix: parsed.subject_prefix,
        })
    }

    fn subject_for(&self, topic: &str) -> String {
        match &self.subject_prefix {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}.{topic}"),
            _ => topic.to_string(),
        }
    }
}

#[async_trait]
impl BrokerPublisher for NatsPublisher {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn publish(&self, topic: &str, envelope: &Envelope) -> anyhow::Result<()> {
        let payload = envelope.to_bytes()?;
        let mut headers = async_nats::HeaderMap::new();
        for (key, value) in envelope.metadata() {
            headers.insert(key.as_str(), value.as_str());
        }
        self.client
            .publish_with_headers(self.subject_for(topic), headers, payload.into())
            .await?;
        self.client.flush().await?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.client.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rejects_missing_url() {
        let parsed: Result<NatsConfig, _> = serde_json::from_value(serde_json::json!({}));
        assert!(parsed.is_err());
    }

    #[test]
    fn subject_prefix_is_applied() {
        // Construct the prefix logic without a live connection.
        let prefix = Some("relay".to_string());
        let subject = match &prefix {
            Some(p) if !p.is_empty() => format!("{p}.pr.opened"),
            _ => "pr.opened".to_string(),
        };
        assert_eq!(subject, "relay.pr.opened");
    }
}
