//! AMQP broker backend (lapin).
//!
//! Four modes: `durable_queue`, `nondurable_queue`, `durable_pubsub`,
//! `nondurable_pubsub`. Queue modes publish to the default exchange with
//! the topic as routing key; pubsub modes declare a fanout exchange named
//! after the topic.

use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    options::{BasicPublishOptions, ExchangeDeclareOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
};
use tokio::sync::Mutex;

use super::BrokerPublisher;
use crate::service::Envelope;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum AmqpMode {
    #[default]
    DurableQueue,
    NondurableQueue,
    DurablePubsub,
    NondurablePubsub,
}

impl AmqpMode {
    fn durable(self) -> bool {
        matches!(self, Self::DurableQueue | Self::DurablePubsub)
    }

    fn is_pubsub(self) -> bool {
        matches!(self, Self::DurablePubsub | Self::NondurablePubsub)
    }
}

#[derive(Debug, serde::Deserialize)]
struct AmqpConfig {
    url: String,
    #[serde(default)]
    mode: AmqpMode,
}

pub struct AmqpPublisher {
    connection: Connection,
    channel: Mutex<Channel>,
    mode: AmqpMode,
}

impl std::fmt::Debug for AmqpPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpPublisher")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl AmqpPublisher {
    pub async fn connect(config: &serde_json::Value) -> anyhow::Result<Self> {
        let parsed: AmqpConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("invalid amqp driver config: {e}"))?;
        let connection =
            Connection::connect(&parsed.url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        Ok(Self {
            connection,
            channel: Mutex::new(channel),
            mode: parsed.mode,
        })
    }

    fn headers(envelope: &Envelope) -> FieldTable {
        let mut table = FieldTable::default();
        for (key, value) in envelope.metadata() {
            table.insert(key.into(), AMQPValue::LongString(value.into()));
        }
        table
    }
}

#[async_trait]
impl BrokerPublisher for AmqpPublisher {
    fn name(&self) -> &'static str {
        "amqp"
    }

    async fn publish(&self, topic: &str, envelope: &Envelope) -> anyhow::Result<()> {
        let payload = envelope.to_bytes()?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_headers(Self::headers(envelope));
        let channel = self.channel.lock().await;

        let (exchange, routing_key) = if self.mode.is_pubsub() {
            channel
                .exchange_declare(
                    topic,
                    ExchangeKind::Fanout,
                    ExchangeDeclareOptions {
                        durable: self.mode.durable(),
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            (topic, "")
        } else {
            channel
                .queue_declare(
                    topic,
                    QueueDeclareOptions {
                        durable: self.mode.durable(),
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            ("", topic)
        };

        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.connection.close(200, "shutdown").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn mode_parsing_and_flags() {
        assert_eq!(
            AmqpMode::from_str("durable_pubsub").unwrap(),
            AmqpMode::DurablePubsub
        );
        assert!(AmqpMode::DurableQueue.durable());
        assert!(!AmqpMode::NondurablePubsub.durable());
        assert!(AmqpMode::DurablePubsub.is_pubsub());
        assert!(!AmqpMode::NondurableQueue.is_pubsub());
    }

    #[test]
    fn default_mode_is_durable_queue() {
        let config: AmqpConfig =
            serde_json::from_value(serde_json::json!({"url": "amqp://localhost"})).unwrap();
        assert_eq!(config.mode, AmqpMode::DurableQueue);
    }
}
