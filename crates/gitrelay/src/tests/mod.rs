//! End-to-end pipeline tests against the in-memory store and broker.

use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use http::HeaderMap;
use serde_json::json;
use sha2::Sha256;

use crate::{
    CONFIG,
    implementations::memory::{MemoryState, MemoryStore},
    service::{
        DriverId, ProviderKind, RouterState, RouterStore, RuleId, TenantId,
        drivers::channel,
        ingress::{self, IngressError, github::GithubHandler},
        store::{
            Driver, EventLogFilter, EventLogStatus, Namespace, ProviderInstance, Rule,
        },
    },
};

const WEBHOOK_SECRET: &str = "e2e-secret";

struct Harness {
    state: RouterState<MemoryStore>,
    tenant: TenantId,
}

impl Harness {
    async fn new(tenant: &str) -> Self {
        let state = RouterState::<MemoryStore>::new(MemoryState::new());
        let tenant = TenantId::from(tenant);
        let now = Utc::now();
        MemoryStore::upsert_provider_instance(
            ProviderInstance {
                tenant_id: tenant.clone(),
                provider: ProviderKind::Github,
                key: format!("github.com/{tenant}"),
                app_id: None,
                private_key: None,
                client_id: None,
                client_secret: None,
                webhook_secret: Some(WEBHOOK_SECRET.to_string()),
                api_base_url: None,
                webhook_path: None,
                enabled: true,
                created_at: now,
                updated_at: now,
            },
            state.store.clone(),
        )
        .await
        .unwrap();
        Self { state, tenant }
    }

    async fn seed_namespace(&self, repo_id: &str) {
        let now = Utc::now();
        MemoryStore::upsert_namespace(
            Namespace {
                tenant_id: self.tenant.clone(),
                provider: ProviderKind::Github,
                provider_instance_key: format!("github.com/{}", self.tenant),
                repo_id: repo_id.to_string(),
                account_id: "acct-1".to_string(),
                installation_id: "11".to_string(),
                owner: "o".to_string(),
                name: "r".to_string(),
                full_name: "o/r".to_string(),
                visibility: Some("public".to_string()),
                default_branch: Some("main".to_string()),
                clone_url: None,
                html_url: None,
                webhooks_enabled: true,
                created_at: now,
                updated_at: now,
            },
            self.state.store.clone(),
        )
        .await
        .unwrap();
    }

    async fn seed_driver(&self, enabled: bool) -> DriverId {
        let now = Utc::now();
        let driver = MemoryStore::upsert_driver(
            Driver {
                id: DriverId::new_random(),
                tenant_id: self.tenant.clone(),
                name: "gochannel".to_string(),
                config: json!({"capacity": 64}),
                enabled,
                created_at: now,
                updated_at: now,
            },
            self.state.store.clone(),
        )
        .await
        .unwrap();
        driver.id
    }

    async fn seed_rule(
        &self,
        when: &str,
        emit: &[&str],
        driver_id: DriverId,
        transform_js: Option<&str>,
    ) -> RuleId {
        let now = Utc::now();
        let rule = MemoryStore::create_rule(
            Rule {
                id: RuleId::new_random(),
                tenant_id: self.tenant.clone(),
                when: when.to_string(),
                emit: emit.iter().map(ToString::to_string).collect(),
                driver_id: Some(driver_id),
                transform_js: transform_js.map(ToString::to_string),
                position: 0,
                created_at: now,
                updated_at: now,
            },
            self.state.store.clone(),
        )
        .await
        .unwrap();
        crate::service::rules::invalidate_tenant(&self.tenant).await;
        rule.id
    }

    async fn deliver(
        &self,
        event: &str,
        body: &[u8],
        request_id: &str,
    ) -> Result<crate::service::eventlog::PipelineOutcome, IngressError> {
        let mut headers = HeaderMap::new();
        headers.insert("x-github-event", event.parse().unwrap());
        headers.insert(
            "x-hub-signature-256",
            sign_sha256(WEBHOOK_SECRET, body).parse().unwrap(),
        );
        ingress::handle_webhook::<MemoryStore>(
            &GithubHandler,
            &self.state,
            &headers,
            Bytes::copy_from_slice(body),
            request_id,
        )
        .await
    }

    async fn logs(&self, filter: EventLogFilter) -> Vec<crate::service::EventLogRecord> {
        MemoryStore::list_event_logs(&self.tenant, filter, 100, 0, self.state.store.clone())
            .await
            .unwrap()
    }
}

fn sign_sha256(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[tokio::test]
async fn pr_opened_single_match_is_delivered() {
    let harness = Harness::new("t-pr-opened").await;
    harness.seed_namespace("1").await;
    let driver_id = harness.seed_driver(true).await;
    harness
        .seed_rule(
            "action == \"opened\" && pull_request.draft == false",
            &["pr.opened.ready"],
            driver_id,
            None,
        )
        .await;

    let mut rx = channel::subscribe("pr.opened.ready", 16).await;
    let body = json!({
        "action": "opened",
        "pull_request": {"draft": false},
        "repository": {"id": 1, "full_name": "o/r"},
    })
    .to_string();

    let outcome = harness.deliver("pull_request", body.as_bytes(), "req-pr-1").await.unwrap();
    assert_eq!(outcome.matched, 1);
    assert_eq!(outcome.delivered, 1);
    assert_eq!(outcome.failed, 0);

    let logs = harness.logs(EventLogFilter::default()).await;
    assert_eq!(logs.len(), 1);
    let row = &logs[0];
    assert_eq!(row.topic, "pr.opened.ready");
    assert_eq!(row.status, EventLogStatus::Delivered);
    assert_eq!(row.request_id, "req-pr-1");
    assert_eq!(row.body, body.as_bytes());
    assert_eq!(row.body_hash, crate::service::event::body_hash(body.as_bytes()));

    let message = rx.try_recv().expect("one broker message");
    assert_eq!(message.payload, body.as_bytes());
    assert_eq!(message.log_id, row.id.to_string());
    assert_eq!(message.metadata()["provider"], "github");
}

#[tokio::test]
async fn multi_emit_merge_produces_two_rows_and_messages() {
    let harness = Harness::new("t-multi-emit").await;
    harness.seed_namespace("1").await;
    let driver_id = harness.seed_driver(true).await;
    harness
        .seed_rule(
            "action == \"closed\" && pull_request.merged == true",
            &["pr.merged.e2e", "audit.pr.merged.e2e"],
            driver_id,
            None,
        )
        .await;

    let mut rx_first = channel::subscribe("pr.merged.e2e", 16).await;
    let mut rx_second = channel::subscribe("audit.pr.merged.e2e", 16).await;
    let body = json!({
        "action": "closed",
        "pull_request": {"merged": true},
        "repository": {"id": 1, "full_name": "o/r"},
    })
    .to_string();

    let outcome = harness.deliver("pull_request", body.as_bytes(), "req-merge-1").await.unwrap();
    assert_eq!(outcome.matched, 2);
    assert_eq!(outcome.delivered, 2);

    let logs = harness.logs(EventLogFilter::default()).await;
    assert_eq!(logs.len(), 2);

    let first = rx_first.try_recv().expect("first topic message");
    let second = rx_second.try_recv().expect("second topic message");
    assert_ne!(first.log_id, second.log_id);
}

#[tokio::test]
async fn unknown_but_signed_event_writes_one_unmatched_row() {
    let harness = Harness::new("t-unknown-event").await;
    harness.seed_namespace("1").await;

    let body = json!({"repository": {"id": 1}, "anything": true}).to_string();
    let outcome = harness
        .deliver("repository_dispatch_extension", body.as_bytes(), "req-unknown-1")
        .await
        .unwrap();
    assert_eq!(outcome.matched, 0);
    assert_eq!(outcome.log_ids.len(), 1);

    let logs = harness.logs(EventLogFilter::default()).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].topic, "unmatched");
    assert!(!logs[0].matched);
    assert_eq!(logs[0].status, EventLogStatus::Unmatched);
}

#[tokio::test]
async fn bad_signature_writes_nothing() {
    let harness = Harness::new("t-bad-sig").await;
    harness.seed_namespace("1").await;

    let body = json!({"repository": {"id": 1}}).to_string();
    let mut headers = HeaderMap::new();
    headers.insert("x-github-event", "pull_request".parse().unwrap());
    headers.insert(
        "x-hub-signature-256",
        sign_sha256("tampered-secret", body.as_bytes()).parse().unwrap(),
    );
    let result = ingress::handle_webhook::<MemoryStore>(
        &GithubHandler,
        &harness.state,
        &headers,
        Bytes::from(body),
        "req-bad-sig",
    )
    .await;
    assert!(matches!(result, Err(IngressError::Signature)));
    assert!(harness.logs(EventLogFilter::default()).await.is_empty());
}

#[tokio::test]
async fn disabled_driver_match_is_logged_and_stays_queued() {
    let harness = Harness::new("t-disabled-driver").await;
    harness.seed_namespace("1").await;
    let driver_id = harness.seed_driver(false).await;
    harness
        .seed_rule("action == \"opened\"", &["pr.disabled.e2e"], driver_id, None)
        .await;

    let body = json!({"action": "opened", "repository": {"id": 1}}).to_string();
    let outcome = harness.deliver("pull_request", body.as_bytes(), "req-disabled-1").await.unwrap();
    assert_eq!(outcome.matched, 1);
    assert_eq!(outcome.delivered, 0);
    assert_eq!(outcome.failed, 0);

    // Dynamic publish skipped and the fallback driver row is disabled too:
    // the row stays queued.
    let logs = harness.logs(EventLogFilter::default()).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, EventLogStatus::Queued);
}

#[tokio::test]
async fn transform_failure_marks_only_its_match_failed() {
    let harness = Harness::new("t-transform-fail").await;
    harness.seed_namespace("1").await;
    let driver_id = harness.seed_driver(true).await;
    harness
        .seed_rule(
            "action == \"opened\"",
            &["transform.broken.e2e"],
            driver_id,
            Some("function transform(payload, event) { throw new Error(\"boom\"); }"),
        )
        .await;
    harness
        .seed_rule(
            "action == \"opened\"",
            &["transform.ok.e2e"],
            driver_id,
            Some("function transform(payload, event) { return { ok: true }; }"),
        )
        .await;

    let mut rx = channel::subscribe("transform.ok.e2e", 16).await;
    let body = json!({"action": "opened", "repository": {"id": 1}}).to_string();
    let outcome = harness.deliver("pull_request", body.as_bytes(), "req-transform-1").await.unwrap();
    assert_eq!(outcome.matched, 2);
    assert_eq!(outcome.delivered, 1);
    assert_eq!(outcome.failed, 1);

    let failed = harness
        .logs(EventLogFilter::builder().status(Some(EventLogStatus::Failed)).build())
        .await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].topic, "transform.broken.e2e");
    assert!(failed[0].error_message.as_deref().unwrap().contains("boom"));

    let delivered = harness
        .logs(EventLogFilter::builder().status(Some(EventLogStatus::Delivered)).build())
        .await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].topic, "transform.ok.e2e");

    // The delivered sibling carries the transform output, not the original
    // body.
    let message = rx.try_recv().expect("sibling message");
    let payload: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
    assert_eq!(payload, json!({"ok": true}));
}

#[tokio::test]
async fn unresolved_namespace_is_dropped_with_ok() {
    let harness = Harness::new("t-unresolved").await;
    // No namespace seeded.
    let body = json!({"action": "opened", "repository": {"id": 999_999}}).to_string();
    let result = harness.deliver("pull_request", body.as_bytes(), "req-drop-1").await;
    assert!(matches!(result, Err(IngressError::Dropped(_))));
    assert!(harness.logs(EventLogFilter::default()).await.is_empty());
}

#[tokio::test]
async fn body_size_cap_is_inclusive() {
    let harness = Harness::new("t-body-cap").await;
    harness.seed_namespace("1").await;

    let max = CONFIG.server.max_body_bytes;
    let payload = json!({"action": "opened", "repository": {"id": 1}}).to_string();
    let mut body = payload.into_bytes();
    // JSON tolerates trailing whitespace, so pad to exactly the cap.
    body.resize(max, b' ');
    let outcome = harness.deliver("pull_request", &body, "req-cap-ok").await;
    assert!(outcome.is_ok());

    body.push(b' ');
    let result = harness.deliver("pull_request", &body, "req-cap-over").await;
    assert!(matches!(result, Err(IngressError::PayloadTooLarge)));
}

#[tokio::test]
async fn worker_terminal_status_applies_and_sets_latency() {
    let harness = Harness::new("t-worker-terminal").await;
    harness.seed_namespace("1").await;
    let driver_id = harness.seed_driver(true).await;
    let rule_id = harness
        .seed_rule("action == \"opened\"", &["worker.terminal.e2e"], driver_id, None)
        .await;

    let body = json!({"action": "opened", "repository": {"id": 1}}).to_string();
    let outcome = harness.deliver("pull_request", body.as_bytes(), "req-worker-1").await.unwrap();
    let log_id = outcome.log_ids[0];

    let updated = MemoryStore::update_event_log_status(
        &harness.tenant,
        log_id,
        EventLogStatus::Success,
        None,
        harness.state.store.clone(),
    )
    .await
    .unwrap();
    assert_eq!(updated.status, EventLogStatus::Success);
    assert!(updated.latency_ms.is_some());
    assert_eq!(
        updated.rule_id,
        Some(rule_id),
        "terminal update applies to the matched rule's row"
    );
}

#[tokio::test]
async fn installation_event_syncs_namespace_rows() {
    let harness = Harness::new("t-install-sync").await;
    // Existing installation row resolves the tenant for lifecycle events.
    let now = Utc::now();
    MemoryStore::upsert_installation(
        crate::service::Installation {
            tenant_id: harness.tenant.clone(),
            provider: ProviderKind::Github,
            account_id: "acct-1".to_string(),
            installation_id: "77".to_string(),
            provider_instance_key: format!("github.com/{}", harness.tenant),
            access_token: None,
            refresh_token: None,
            token_expires_at: None,
            created_at: now,
            updated_at: now,
        },
        harness.state.store.clone(),
    )
    .await
    .unwrap();

    let body = json!({
        "action": "added",
        "installation": {"id": 77, "account": {"id": "acct-1", "login": "octo"}},
        "repositories_added": [
            {"id": 555, "name": "fresh", "full_name": "octo/fresh", "private": false},
        ],
    })
    .to_string();
    harness
        .deliver("installation_repositories", body.as_bytes(), "req-sync-1")
        .await
        .unwrap();

    let namespace = MemoryStore::resolve_namespace(
        ProviderKind::Github,
        "555",
        harness.state.store.clone(),
    )
    .await
    .unwrap()
    .expect("namespace synced from installation event");
    assert_eq!(namespace.full_name, "octo/fresh");
    assert_eq!(namespace.tenant_id, harness.tenant);
    assert_eq!(namespace.installation_id, "77");
}
