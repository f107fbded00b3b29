//! Kafka broker backend (rdkafka).

use async_trait::async_trait;
use rdkafka::{
    ClientConfig,
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
};

use super::BrokerPublisher;
use crate::service::Envelope;

#[derive(Debug, serde::Deserialize)]
struct KafkaConfig {
    brokers: String,
    /// Extra librdkafka properties applied verbatim.
    #[serde(default)]
    properties: std::collections::BTreeMap<String, String>,
    send_timeout_ms: Option<u64>,
}

pub struct KafkaPublisher {
    producer: FutureProducer,
    send_timeout: std::time::Duration,
}

impl std::fmt::Debug for KafkaPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaPublisher").finish_non_exhaustive()
    }
}

impl KafkaPublisher {
    pub fn connect(config: &serde_json::Value) -> anyhow::Result<Self> {
        let parsed: KafkaConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("invalid kafka driver config: {e}"))?;
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", &parsed.brokers);
        for (key, value) in &parsed.properties {
            client_config.set(key, value);
        }
        let producer: FutureProducer = client_config.create()?;
        Ok(Self {
            producer,
            send_timeout: std::time::Duration::from_millis(
                parsed.send_timeout_ms.unwrap_or(10_000),
            ),
        })
    }
}

#[async_trait]
impl BrokerPublisher for KafkaPublisher {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn publish(&self, topic: &str, envelope: &Envelope) -> anyhow::Result<()> {
        let payload = envelope.to_bytes()?;
        let mut headers = OwnedHeaders::new();
        for (key, value) in envelope.metadata() {
            headers = headers.insert(Header {
                key: &key,
                value: Some(value.as_str()),
            });
        }
        let record = FutureRecord::to(topic)
            .payload(&payload)
            .key(&envelope.request_id)
            .headers(headers);
        self.producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map_err(|(e, _)| anyhow::anyhow!(e))?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        use rdkafka::producer::Producer as _;
        self.producer.flush(Timeout::After(self.send_timeout))?;
        Ok(())
    }
}
