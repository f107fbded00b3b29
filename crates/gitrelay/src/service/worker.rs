//! Worker protocol plumbing: per-rule live event streams.
//!
//! The publish pipeline notifies the hub after each match; workers
//! subscribed to the rule receive the envelope plus routing metadata and
//! later report terminal status through the management surface.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use tokio::sync::broadcast;

use crate::service::{Envelope, EventLogRecord, RuleId};

const CHANNEL_CAPACITY: usize = 256;

/// One frame streamed to a subscribed worker.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct WorkerEvent {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub installation_id: String,
}

impl WorkerEvent {
    /// Rebuild a frame from a stored log row, used to replay the backlog
    /// on subscribe.
    #[must_use]
    pub fn from_record(record: &EventLogRecord) -> Self {
        Self {
            envelope: Envelope {
                payload: record.body.clone(),
                provider: record.provider.to_string(),
                event: record.name.clone(),
                request_id: record.request_id.clone(),
                log_id: record.id.to_string(),
                topic: record.topic.clone(),
                driver: record.drivers.first().cloned().unwrap_or_default(),
                tenant_id: record.tenant_id.to_string(),
                webhook_token: None,
            },
            installation_id: record.installation_id.clone(),
        }
    }
}

/// Fan-out point between the publish pipeline and subscribed workers.
#[derive(Clone, Default)]
pub struct WorkerHub {
    channels: Arc<RwLock<HashMap<RuleId, broadcast::Sender<WorkerEvent>>>>,
}

impl std::fmt::Debug for WorkerHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.channels.read().map(|c| c.len()).unwrap_or_default();
        f.debug_struct("WorkerHub").field("rules", &len).finish()
    }
}

impl WorkerHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a frame to the rule's subscribers. Events for rules nobody
    /// listens to are dropped; the event log is the durable record.
    pub fn notify(&self, rule_id: RuleId, envelope: &Envelope, installation_id: &str) {
        let sender = {
            let channels = match self.channels.read() {
                Ok(channels) => channels,
                Err(poisoned) => poisoned.into_inner(),
            };
            channels.get(&rule_id).cloned()
        };
        if let Some(sender) = sender {
            let _ = sender.send(WorkerEvent {
                envelope: envelope.clone(),
                installation_id: installation_id.to_string(),
            });
        }
    }

    /// Subscribe to a rule's live stream.
    #[must_use]
    pub fn subscribe(&self, rule_id: RuleId) -> broadcast::Receiver<WorkerEvent> {
        let mut channels = match self.channels.write() {
            Ok(channels) => channels,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .entry(rule_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope {
            payload: b"{}".to_vec(),
            provider: "github".to_string(),
            event: "push".to_string(),
            request_id: "r".to_string(),
            log_id: "l".to_string(),
            topic: "t".to_string(),
            driver: "gochannel".to_string(),
            tenant_id: "acme".to_string(),
            webhook_token: None,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_notified_frames() {
        let hub = WorkerHub::new();
        let rule_id = RuleId::new_random();
        let mut rx = hub.subscribe(rule_id);
        hub.notify(rule_id, &envelope(), "inst-1");
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.installation_id, "inst-1");
        assert_eq!(frame.envelope.topic, "t");
    }

    #[test]
    fn notify_without_subscribers_is_a_noop() {
        let hub = WorkerHub::new();
        hub.notify(RuleId::new_random(), &envelope(), "inst-1");
    }

    #[tokio::test]
    async fn frames_are_scoped_to_their_rule() {
        let hub = WorkerHub::new();
        let subscribed = RuleId::new_random();
        let other = RuleId::new_random();
        let mut rx = hub.subscribe(subscribed);
        hub.notify(other, &envelope(), "inst-1");
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
