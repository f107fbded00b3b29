//! In-memory broker backed by per-topic broadcast channels.
//!
//! Used for single-process deployments and tests. Topics are process-wide:
//! two `gochannel` drivers with different configs share the same topic
//! space, matching the in-memory broker of the reference deployments.

use std::{collections::HashMap, sync::LazyLock};

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};

use super::BrokerPublisher;
use crate::service::Envelope;

const DEFAULT_CAPACITY: usize = 256;

static TOPICS: LazyLock<RwLock<HashMap<String, broadcast::Sender<Envelope>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Subscribe to a topic. Used by the worker surface and tests.
pub async fn subscribe(topic: &str, capacity: usize) -> broadcast::Receiver<Envelope> {
    let mut topics = TOPICS.write().await;
    topics
        .entry(topic.to_string())
        .or_insert_with(|| broadcast::channel(capacity.max(1)).0)
        .subscribe()
}

#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    capacity: usize,
}

#[derive(Debug, serde::Deserialize, Default)]
struct ChannelConfig {
    capacity: Option<usize>,
}

impl ChannelPublisher {
    #[must_use]
    pub fn from_config(config: &serde_json::Value) -> Self {
        let parsed: ChannelConfig = serde_json::from_value(config.clone()).unwrap_or_default();
        Self {
            capacity: parsed.capacity.unwrap_or(DEFAULT_CAPACITY),
        }
    }
}

#[async_trait]
impl BrokerPublisher for ChannelPublisher {
    fn name(&self) -> &'static str {
        "gochannel"
    }

    async fn publish(&self, topic: &str, envelope: &Envelope) -> anyhow::Result<()> {
        let sender = {
            let topics = TOPICS.read().await;
            topics.get(topic).cloned()
        };
        let sender = match sender {
            Some(sender) => sender,
            None => {
                let mut topics = TOPICS.write().await;
                topics
                    .entry(topic.to_string())
                    .or_insert_with(|| broadcast::channel(self.capacity).0)
                    .clone()
            }
        };
        // A topic without subscribers drops the message, like a fanout
        // exchange without bound queues.
        let _ = sender.send(envelope.clone());
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(topic: &str) -> Envelope {
        Envelope {
            payload: b"{}".to_vec(),
            provider: "github".to_string(),
            event: "push".to_string(),
            request_id: "r".to_string(),
            log_id: "l".to_string(),
            topic: topic.to_string(),
            driver: "gochannel".to_string(),
            tenant_id: String::new(),
            webhook_token: None,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_envelope() {
        let publisher = ChannelPublisher::from_config(&serde_json::json!({}));
        let mut rx = subscribe("channel.test.roundtrip", 8).await;
        publisher
            .publish("channel.test.roundtrip", &envelope("channel.test.roundtrip"))
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.topic, "channel.test.roundtrip");
        assert_eq!(received.payload, b"{}");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped_not_an_error() {
        let publisher = ChannelPublisher::from_config(&serde_json::json!({"capacity": 4}));
        publisher
            .publish("channel.test.nobody", &envelope("channel.test.nobody"))
            .await
            .unwrap();
    }
}
