//! Event-log records and the per-match delivery pipeline.
//!
//! Every matched (rule × topic) pair gets one log row; an event no rule
//! fires on gets a single `unmatched` row. Rows are written in one batch
//! with status `queued`, then each match is published and its row advanced
//! through the monotonic status machine.

use chrono::Utc;

use crate::service::{
    Envelope, Event, EventLogId, EventLogRecord, EventLogStatus, RouterStore, TenantId,
    drivers::RouterPublisher,
    rules::MatchedRule,
    store::StoreError,
    transform::{TransformContext, apply_transform},
    worker::WorkerHub,
};

/// Topic recorded on the single row written when no rule matches.
pub const UNMATCHED_TOPIC: &str = "unmatched";

/// What the ingress handler reports after the pipeline ran.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub log_ids: Vec<EventLogId>,
    pub matched: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Build the log row for one match.
#[must_use]
pub fn build_match_record(event: &Event, matched: &MatchedRule) -> EventLogRecord {
    let now = Utc::now();
    EventLogRecord {
        id: EventLogId::new(uuid::Uuid::now_v7()),
        tenant_id: event.tenant_id.clone(),
        provider: event.provider,
        name: event.name.clone(),
        request_id: event.request_id.clone(),
        state_id: event.state_id.clone(),
        installation_id: event.installation_id.clone(),
        namespace_id: event.namespace_id.clone(),
        namespace_name: event.namespace_name.clone(),
        topic: matched.topic.clone(),
        rule_id: Some(matched.rule_id),
        rule_when: Some(matched.when.clone()),
        drivers: vec![matched.driver_name.clone()],
        headers: serde_json::to_value(&event.headers).unwrap_or_default(),
        body: event.raw_payload.to_vec(),
        body_hash: crate::service::event::body_hash(&event.raw_payload),
        status: EventLogStatus::Queued,
        error_message: None,
        matched: true,
        latency_ms: None,
        created_at: now,
        updated_at: now,
    }
}

/// Build the single row recording that nothing matched.
#[must_use]
pub fn build_unmatched_record(event: &Event) -> EventLogRecord {
    let now = Utc::now();
    EventLogRecord {
        id: EventLogId::new(uuid::Uuid::now_v7()),
        tenant_id: event.tenant_id.clone(),
        provider: event.provider,
        name: event.name.clone(),
        request_id: event.request_id.clone(),
        state_id: event.state_id.clone(),
        installation_id: event.installation_id.clone(),
        namespace_id: event.namespace_id.clone(),
        namespace_name: event.namespace_name.clone(),
        topic: UNMATCHED_TOPIC.to_string(),
        rule_id: None,
        rule_when: None,
        drivers: Vec::new(),
        headers: serde_json::to_value(&event.headers).unwrap_or_default(),
        body: event.raw_payload.to_vec(),
        body_hash: crate::service::event::body_hash(&event.raw_payload),
        status: EventLogStatus::Unmatched,
        error_message: None,
        matched: false,
        latency_ms: None,
        created_at: now,
        updated_at: now,
    }
}

fn envelope_for(event: &Event, matched: &MatchedRule, log_id: EventLogId, payload: Vec<u8>) -> Envelope {
    let webhook_token = matched
        .driver_config
        .as_ref()
        .and_then(|c| c.get("webhook_token"))
        .and_then(|v| v.as_str())
        .map(ToString::to_string);
    Envelope {
        payload,
        provider: event.provider.to_string(),
        event: event.name.clone(),
        request_id: event.request_id.clone(),
        log_id: log_id.to_string(),
        topic: matched.topic.clone(),
        driver: matched.driver_name.clone(),
        tenant_id: event.tenant_id.to_string(),
        webhook_token,
    }
}

/// Run the publish pipeline for one event and its matches.
///
/// Matches are processed in engine order; a failing match never aborts its
/// siblings.
pub async fn process_event<C: RouterStore>(
    event: &Event,
    matches: &[MatchedRule],
    publisher: &RouterPublisher<C>,
    worker_hub: &WorkerHub,
    state: C::State,
) -> Result<PipelineOutcome, StoreError> {
    let tenant = event.tenant_id.clone();

    if matches.is_empty() {
        let record = build_unmatched_record(event);
        let log_id = record.id;
        C::insert_event_logs(vec![record], state).await?;
        tracing::debug!(request_id = %event.request_id, "No rule matched, recorded unmatched row");
        return Ok(PipelineOutcome {
            log_ids: vec![log_id],
            ..PipelineOutcome::default()
        });
    }

    let records: Vec<EventLogRecord> =
        matches.iter().map(|m| build_match_record(event, m)).collect();
    let log_ids: Vec<EventLogId> = records.iter().map(|r| r.id).collect();
    C::insert_event_logs(records, state.clone()).await?;

    let mut outcome = PipelineOutcome {
        log_ids: log_ids.clone(),
        matched: matches.len(),
        ..PipelineOutcome::default()
    };

    for (matched, log_id) in matches.iter().zip(log_ids) {
        let status = publish_match(event, matched, log_id, publisher, worker_hub, &tenant, &state)
            .await;
        match status {
            MatchStatus::Delivered => outcome.delivered += 1,
            MatchStatus::Failed(message) => {
                outcome.failed += 1;
                apply_status::<C>(
                    &tenant,
                    log_id,
                    EventLogStatus::Failed,
                    Some(message),
                    &state,
                )
                .await;
                continue;
            }
            MatchStatus::SkippedQueued => continue,
        }
        apply_status::<C>(&tenant, log_id, EventLogStatus::Delivered, None, &state).await;
    }

    Ok(outcome)
}

enum MatchStatus {
    Delivered,
    Failed(String),
    SkippedQueued,
}

#[allow(clippy::too_many_arguments)]
async fn publish_match<C: RouterStore>(
    event: &Event,
    matched: &MatchedRule,
    log_id: EventLogId,
    publisher: &RouterPublisher<C>,
    worker_hub: &WorkerHub,
    tenant: &TenantId,
    _state: &C::State,
) -> MatchStatus {
    // Transforms always observe the original body, never an upstream
    // transform's output.
    let payload = if let Some(script) = &matched.transform_js {
        match apply_transform(script, &event.raw_payload, &TransformContext::from(event)) {
            Ok(replaced) => replaced,
            Err(e) => {
                tracing::warn!(
                    rule_id = %matched.rule_id,
                    request_id = %event.request_id,
                    "Transform failed: {e}"
                );
                return MatchStatus::Failed(e.to_string());
            }
        }
    } else {
        event.raw_payload.to_vec()
    };

    let envelope = envelope_for(event, matched, log_id, payload);

    let dynamic_usable = matched.driver_enabled && matched.driver_config.is_some();
    if dynamic_usable {
        let config = matched.driver_config.as_ref().unwrap_or(&serde_json::Value::Null);
        match publisher
            .publish_dynamic(&matched.driver_name, config, &matched.topic, &envelope)
            .await
        {
            Ok(()) => {
                worker_hub.notify(matched.rule_id, &envelope, &event.installation_id);
                return MatchStatus::Delivered;
            }
            Err(dynamic_err) => {
                // A broken dynamic handle must not lose the event when a
                // default route exists.
                tracing::warn!(
                    rule_id = %matched.rule_id,
                    driver = %matched.driver_name,
                    request_id = %event.request_id,
                    "Dynamic publish failed, attempting fallback: {dynamic_err}"
                );
                match publisher
                    .publish_for_drivers(
                        tenant,
                        &matched.topic,
                        &envelope,
                        &[matched.driver_name.clone()],
                    )
                    .await
                {
                    Ok(()) => {
                        worker_hub.notify(matched.rule_id, &envelope, &event.installation_id);
                        return MatchStatus::Delivered;
                    }
                    Err(_) => return MatchStatus::Failed(dynamic_err.to_string()),
                }
            }
        }
    }

    // Dynamic publish skipped: driver disabled or config missing. Fall back
    // to the default publisher with the rule's driver name; without a
    // usable fallback the row stays queued.
    match publisher
        .publish_for_drivers(
            tenant,
            &matched.topic,
            &envelope,
            &[matched.driver_name.clone()],
        )
        .await
    {
        Ok(()) => {
            worker_hub.notify(matched.rule_id, &envelope, &event.installation_id);
            MatchStatus::Delivered
        }
        Err(e) => {
            tracing::warn!(
                rule_id = %matched.rule_id,
                driver = %matched.driver_name,
                request_id = %event.request_id,
                "Dynamic publish skipped and fallback unavailable, row stays queued: {e}"
            );
            worker_hub.notify(matched.rule_id, &envelope, &event.installation_id);
            MatchStatus::SkippedQueued
        }
    }
}

async fn apply_status<C: RouterStore>(
    tenant: &TenantId,
    log_id: EventLogId,
    status: EventLogStatus,
    error_message: Option<String>,
    state: &C::State,
) {
    if let Err(e) =
        C::update_event_log_status(tenant, log_id, status, error_message, state.clone()).await
    {
        tracing::error!(log_id = %log_id, "Event log status update failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::service::{DriverId, ProviderKind, RuleId, flatten::flatten};

    fn event() -> Event {
        let payload = json!({"action": "opened", "repository": {"id": 1}});
        Event {
            provider: ProviderKind::Github,
            name: "pull_request".to_string(),
            request_id: "req-42".to_string(),
            tenant_id: TenantId::from("acme"),
            installation_id: "77".to_string(),
            provider_instance_key: "github.com".to_string(),
            state_id: "acct-9".to_string(),
            namespace_id: "1".to_string(),
            namespace_name: "o/r".to_string(),
            headers: BTreeMap::from([("x-github-event".to_string(), "pull_request".to_string())]),
            raw_payload: bytes::Bytes::from(payload.to_string()),
            data: flatten(&payload),
            raw_object: payload,
            log_id: None,
        }
    }

    fn matched() -> MatchedRule {
        MatchedRule {
            rule_id: RuleId::new_random(),
            when: "action == \"opened\"".to_string(),
            topic: "pr.opened".to_string(),
            driver_id: DriverId::new_random(),
            driver_name: "gochannel".to_string(),
            driver_config: Some(json!({"webhook_token": "tok"})),
            driver_enabled: true,
            transform_js: None,
        }
    }

    #[test]
    fn match_record_carries_body_and_hash() {
        let event = event();
        let record = build_match_record(&event, &matched());
        assert_eq!(record.body, event.raw_payload.to_vec());
        assert_eq!(
            record.body_hash,
            crate::service::event::body_hash(&event.raw_payload)
        );
        assert_eq!(record.status, EventLogStatus::Queued);
        assert!(record.matched);
        assert_eq!(record.topic, "pr.opened");
        assert_eq!(record.drivers, vec!["gochannel".to_string()]);
    }

    #[test]
    fn unmatched_record_shape() {
        let event = event();
        let record = build_unmatched_record(&event);
        assert_eq!(record.topic, UNMATCHED_TOPIC);
        assert_eq!(record.status, EventLogStatus::Unmatched);
        assert!(!record.matched);
        assert!(record.rule_id.is_none());
        assert_eq!(record.body_hash, crate::service::event::body_hash(&event.raw_payload));
    }

    #[test]
    fn envelope_carries_metadata_and_token() {
        let event = event();
        let m = matched();
        let log_id = EventLogId::new(uuid::Uuid::now_v7());
        let envelope = envelope_for(&event, &m, log_id, event.raw_payload.to_vec());
        assert_eq!(envelope.log_id, log_id.to_string());
        assert_eq!(envelope.provider, "github");
        assert_eq!(envelope.webhook_token.as_deref(), Some("tok"));
        assert_eq!(envelope.payload, event.raw_payload.to_vec());
    }
}
