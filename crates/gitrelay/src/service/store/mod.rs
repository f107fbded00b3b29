//! Tenant-scoped store contracts.
//!
//! Every operation takes the tenant it is scoped to; the empty tenant is
//! the global scope. List operations accept typed filters whose optional
//! fields AND together. Upserts use natural keys; deletes are idempotent.

mod error;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use error::{StoreBackendError, StoreBackendErrorType, StoreError};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::service::{
    DriverId, EventLogId, ProviderKind, RuleId, TenantId, event::config_hash, health::HealthExt,
};

// ---------------- Entities ----------------

/// A configured provider endpoint, e.g. `github.com` or a GitHub Enterprise
/// host. `(tenant, provider, key)` is the natural key.
#[derive(Clone, PartialEq, Serialize, Deserialize, veil::Redact, utoipa::ToSchema)]
pub struct ProviderInstance {
    pub tenant_id: TenantId,
    pub provider: ProviderKind,
    pub key: String,
    /// App id for app-style providers.
    pub app_id: Option<String>,
    #[redact]
    pub private_key: Option<String>,
    pub client_id: Option<String>,
    #[redact]
    pub client_secret: Option<String>,
    #[redact]
    pub webhook_secret: Option<String>,
    pub api_base_url: Option<String>,
    /// Per-instance webhook path override.
    pub webhook_path: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderInstance {
    /// Deterministic short hash derived from the instance configuration.
    #[must_use]
    pub fn config_hash(&self) -> String {
        config_hash(&serde_json::json!({
            "provider": self.provider,
            "key": self.key,
            "app_id": self.app_id,
            "client_id": self.client_id,
            "api_base_url": self.api_base_url,
            "webhook_path": self.webhook_path,
        }))
    }

    /// API base URL with the provider default applied.
    #[must_use]
    pub fn api_base(&self) -> String {
        if let Some(base) = &self.api_base_url {
            return base.trim_end_matches('/').to_string();
        }
        match self.provider {
            ProviderKind::Github => "https://api.github.com".to_string(),
            ProviderKind::Gitlab => "https://gitlab.com/api/v4".to_string(),
            ProviderKind::Bitbucket => "https://api.bitbucket.org/2.0".to_string(),
            ProviderKind::Slack => "https://slack.com/api".to_string(),
        }
    }
}

/// Stored credential binding a provider account to a tenant. Uniqueness is
/// the full `(tenant, provider, account_id, installation_id, instance_key)`
/// five-tuple; latest `updated_at` wins in ambiguous lookups.
#[derive(Clone, PartialEq, Serialize, Deserialize, veil::Redact, utoipa::ToSchema)]
pub struct Installation {
    pub tenant_id: TenantId,
    pub provider: ProviderKind,
    pub account_id: String,
    pub installation_id: String,
    pub provider_instance_key: String,
    #[redact]
    pub access_token: Option<String>,
    #[redact]
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Repository identity routing webhooks to a tenant. Unique on
/// `(tenant, provider, instance_key, repo_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Namespace {
    pub tenant_id: TenantId,
    pub provider: ProviderKind,
    pub provider_instance_key: String,
    pub repo_id: String,
    pub account_id: String,
    pub installation_id: String,
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub visibility: Option<String>,
    pub default_branch: Option<String>,
    pub clone_url: Option<String>,
    pub html_url: Option<String>,
    pub webhooks_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A named broker configuration. `(tenant, name)` is unique; `name` selects
/// the backend kind and `config` is backend-specific.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Driver {
    pub id: DriverId,
    pub tenant_id: TenantId,
    pub name: String,
    pub config: serde_json::Value,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Rule {
    pub id: RuleId,
    pub tenant_id: TenantId,
    /// Expression source evaluated against the flattened payload.
    pub when: String,
    /// Ordered topic names, one publish per element.
    pub emit: Vec<String>,
    pub driver_id: Option<DriverId>,
    pub transform_js: Option<String>,
    /// Insertion-order position; evaluation iterates rules by it.
    pub position: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A rule joined with its driver row, the shape rule loading consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RuleWithDriver {
    #[serde(flatten)]
    pub rule: Rule,
    pub driver_name: Option<String>,
    pub driver_config: Option<serde_json::Value>,
    pub driver_enabled: Option<bool>,
}

/// Delivery status of one event-log row.
///
/// Transitions are monotonic: `queued → delivered → {success|failed}`,
/// `queued → failed`, and — when a worker reports before the delivery
/// callback — `queued → success`. `unmatched` rows never advance.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
    utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum EventLogStatus {
    Queued,
    Delivered,
    Success,
    Failed,
    Unmatched,
}

impl EventLogStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Unmatched)
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Delivered | Self::Success | Self::Failed)
                | (Self::Delivered, Self::Success | Self::Failed)
        )
    }
}

/// One row per (rule × topic) for matched events, plus a single `unmatched`
/// row when no rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct EventLogRecord {
    pub id: EventLogId,
    pub tenant_id: TenantId,
    pub provider: ProviderKind,
    /// Provider event name.
    pub name: String,
    pub request_id: String,
    pub state_id: String,
    pub installation_id: String,
    pub namespace_id: String,
    pub namespace_name: String,
    pub topic: String,
    pub rule_id: Option<RuleId>,
    pub rule_when: Option<String>,
    pub drivers: Vec<String>,
    pub headers: serde_json::Value,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub body: Vec<u8>,
    /// SHA-256 of `body`, hex encoded.
    pub body_hash: String,
    pub status: EventLogStatus,
    pub error_message: Option<String>,
    pub matched: bool,
    pub latency_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------- Filters ----------------

#[derive(Debug, Clone, Default, TypedBuilder, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ProviderInstanceFilter {
    #[builder(default)]
    pub provider: Option<ProviderKind>,
    #[builder(default)]
    pub key: Option<String>,
    #[builder(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, TypedBuilder, Serialize, Deserialize, utoipa::ToSchema)]
pub struct InstallationFilter {
    #[builder(default)]
    pub provider: Option<ProviderKind>,
    #[builder(default)]
    pub account_id: Option<String>,
    #[builder(default)]
    pub installation_id: Option<String>,
    #[builder(default)]
    pub provider_instance_key: Option<String>,
}

#[derive(Debug, Clone, Default, TypedBuilder, Serialize, Deserialize, utoipa::ToSchema)]
pub struct NamespaceFilter {
    #[builder(default)]
    pub provider: Option<ProviderKind>,
    #[builder(default)]
    pub provider_instance_key: Option<String>,
    #[builder(default)]
    pub repo_id: Option<String>,
    #[builder(default)]
    pub full_name: Option<String>,
    #[builder(default)]
    pub webhooks_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, TypedBuilder, Serialize, Deserialize, utoipa::ToSchema)]
pub struct DriverFilter {
    #[builder(default)]
    pub name: Option<String>,
    #[builder(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, TypedBuilder, Serialize, Deserialize, utoipa::ToSchema)]
pub struct EventLogFilter {
    #[builder(default)]
    pub provider: Option<ProviderKind>,
    #[builder(default)]
    pub name: Option<String>,
    #[builder(default)]
    pub request_id: Option<String>,
    #[builder(default)]
    pub topic: Option<String>,
    #[builder(default)]
    pub rule_id: Option<RuleId>,
    #[builder(default)]
    pub installation_id: Option<String>,
    #[builder(default)]
    pub namespace_id: Option<String>,
    #[builder(default)]
    pub status: Option<EventLogStatus>,
    #[builder(default)]
    pub matched: Option<bool>,
    #[builder(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[builder(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl EventLogFilter {
    /// Whether a record passes every set field.
    #[must_use]
    pub fn matches(&self, record: &EventLogRecord) -> bool {
        self.provider.is_none_or(|p| p == record.provider)
            && self.name.as_ref().is_none_or(|n| *n == record.name)
            && self
                .request_id
                .as_ref()
                .is_none_or(|r| *r == record.request_id)
            && self.topic.as_ref().is_none_or(|t| *t == record.topic)
            && self.rule_id.is_none_or(|r| Some(r) == record.rule_id)
            && self
                .installation_id
                .as_ref()
                .is_none_or(|i| *i == record.installation_id)
            && self
                .namespace_id
                .as_ref()
                .is_none_or(|n| *n == record.namespace_id)
            && self.status.is_none_or(|s| s == record.status)
            && self.matched.is_none_or(|m| m == record.matched)
            && self.start_time.is_none_or(|t| record.created_at >= t)
            && self.end_time.is_none_or(|t| record.created_at <= t)
    }
}

// ---------------- Analytics ----------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct CountBucket {
    pub key: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct EventLogAnalytics {
    pub total: i64,
    pub matched: i64,
    pub failed: i64,
    pub distinct_request_ids: i64,
    pub by_provider: Vec<CountBucket>,
    pub by_event: Vec<CountBucket>,
    pub by_topic: Vec<CountBucket>,
    pub by_rule: Vec<CountBucket>,
    pub by_installation: Vec<CountBucket>,
    pub by_namespace: Vec<CountBucket>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
    utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TimeseriesInterval {
    Hour,
    Day,
    Week,
}

impl TimeseriesInterval {
    #[must_use]
    pub fn duration(self) -> chrono::Duration {
        match self {
            Self::Hour => chrono::Duration::hours(1),
            Self::Day => chrono::Duration::days(1),
            Self::Week => chrono::Duration::weeks(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct TimeseriesBucket {
    pub bucket_start: DateTime<Utc>,
    pub event_count: i64,
    pub matched_count: i64,
    pub failure_count: i64,
    pub distinct_req: i64,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
    utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BreakdownGroupBy {
    Provider,
    Event,
    Topic,
    Rule,
    Installation,
    Namespace,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
    utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BreakdownSortBy {
    Events,
    Matched,
    Failed,
}

#[derive(Debug, Clone, TypedBuilder, Serialize, Deserialize, utoipa::ToSchema)]
pub struct BreakdownQuery {
    #[builder(default)]
    pub filter: EventLogFilter,
    pub group_by: BreakdownGroupBy,
    pub sort_by: BreakdownSortBy,
    #[builder(default = true)]
    pub desc: bool,
    #[builder(default = 50)]
    pub page_size: usize,
    #[builder(default)]
    pub page_token: Option<String>,
    #[builder(default)]
    pub include_latency: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct BreakdownRow {
    pub key: String,
    pub events: i64,
    pub matched: i64,
    pub failed: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub p50_latency_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub p95_latency_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub p99_latency_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct BreakdownPage {
    pub rows: Vec<BreakdownRow>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub next_page_token: Option<String>,
}

/// Latency percentile by sorted-sample index, the `index-at-p` method.
#[must_use]
pub fn percentile(sorted_samples: &[i64], p: f64) -> Option<i64> {
    if sorted_samples.is_empty() {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let idx = ((sorted_samples.len() as f64 - 1.0) * p).round() as usize;
    sorted_samples.get(idx).copied()
}

// ---------------- Contract ----------------

/// The storage contract the core depends on. Implementations are external
/// to the pipeline; `implementations::postgres` and
/// `implementations::memory` ship with the crate.
#[async_trait]
pub trait RouterStore
where
    Self: std::fmt::Debug + Clone + Send + Sync + 'static,
{
    type State: Clone + std::fmt::Debug + Send + Sync + 'static + HealthExt;

    // ---------------- Provider instances ----------------
    async fn list_provider_instances(
        tenant: &TenantId,
        filter: ProviderInstanceFilter,
        state: Self::State,
    ) -> Result<Vec<ProviderInstance>, StoreError>;

    async fn get_provider_instance(
        tenant: &TenantId,
        provider: ProviderKind,
        key: &str,
        state: Self::State,
    ) -> Result<Option<ProviderInstance>, StoreError>;

    /// Cross-tenant lookup of every enabled instance of a provider, used
    /// by ingress signature verification before a tenant is known.
    async fn resolve_provider_instances(
        provider: ProviderKind,
        state: Self::State,
    ) -> Result<Vec<ProviderInstance>, StoreError>;

    async fn upsert_provider_instance(
        instance: ProviderInstance,
        state: Self::State,
    ) -> Result<ProviderInstance, StoreError>;

    async fn delete_provider_instance(
        tenant: &TenantId,
        provider: ProviderKind,
        key: &str,
        state: Self::State,
    ) -> Result<(), StoreError>;

    // ---------------- Installations ----------------
    async fn list_installations(
        tenant: &TenantId,
        filter: InstallationFilter,
        state: Self::State,
    ) -> Result<Vec<Installation>, StoreError>;

    /// Latest `updated_at` wins when several rows share the installation id.
    async fn get_installation_by_id(
        tenant: &TenantId,
        provider: ProviderKind,
        installation_id: &str,
        state: Self::State,
    ) -> Result<Option<Installation>, StoreError>;

    /// Latest `updated_at` wins when several rows share the account id.
    async fn get_installation_by_account(
        tenant: &TenantId,
        provider: ProviderKind,
        account_id: &str,
        state: Self::State,
    ) -> Result<Option<Installation>, StoreError>;

    /// Cross-tenant installation resolution for deliveries that carry no
    /// resolvable repository (installation lifecycle events). Latest
    /// `updated_at` wins.
    async fn resolve_installation(
        provider: ProviderKind,
        installation_id: &str,
        state: Self::State,
    ) -> Result<Option<Installation>, StoreError>;

    async fn upsert_installation(
        installation: Installation,
        state: Self::State,
    ) -> Result<Installation, StoreError>;

    async fn delete_installation(
        tenant: &TenantId,
        provider: ProviderKind,
        installation_id: &str,
        state: Self::State,
    ) -> Result<(), StoreError>;

    // ---------------- Namespaces ----------------
    async fn list_namespaces(
        tenant: &TenantId,
        filter: NamespaceFilter,
        state: Self::State,
    ) -> Result<Vec<Namespace>, StoreError>;

    /// Cross-tenant resolution from a webhook payload: namespaces are the
    /// primary mapping from `(provider, repo_id)` to a tenant. Latest
    /// `updated_at` wins.
    async fn resolve_namespace(
        provider: ProviderKind,
        repo_id: &str,
        state: Self::State,
    ) -> Result<Option<Namespace>, StoreError>;

    async fn upsert_namespace(
        namespace: Namespace,
        state: Self::State,
    ) -> Result<Namespace, StoreError>;

    async fn delete_namespace(
        tenant: &TenantId,
        provider: ProviderKind,
        provider_instance_key: &str,
        repo_id: &str,
        state: Self::State,
    ) -> Result<(), StoreError>;

    async fn set_namespace_webhooks_enabled(
        tenant: &TenantId,
        provider: ProviderKind,
        provider_instance_key: &str,
        repo_id: &str,
        enabled: bool,
        state: Self::State,
    ) -> Result<Namespace, StoreError>;

    // ---------------- Drivers ----------------
    async fn list_drivers(
        tenant: &TenantId,
        filter: DriverFilter,
        state: Self::State,
    ) -> Result<Vec<Driver>, StoreError>;

    async fn get_driver(
        tenant: &TenantId,
        id: DriverId,
        state: Self::State,
    ) -> Result<Option<Driver>, StoreError>;

    async fn get_driver_by_name(
        tenant: &TenantId,
        name: &str,
        state: Self::State,
    ) -> Result<Option<Driver>, StoreError>;

    async fn upsert_driver(driver: Driver, state: Self::State) -> Result<Driver, StoreError>;

    async fn delete_driver(
        tenant: &TenantId,
        id: DriverId,
        state: Self::State,
    ) -> Result<(), StoreError>;

    // ---------------- Rules ----------------
    /// Rules joined with driver name, config and enabled state, in stored
    /// (insertion-time) order.
    async fn list_rules(
        tenant: &TenantId,
        state: Self::State,
    ) -> Result<Vec<RuleWithDriver>, StoreError>;

    async fn get_rule(
        tenant: &TenantId,
        id: RuleId,
        state: Self::State,
    ) -> Result<Option<RuleWithDriver>, StoreError>;

    async fn create_rule(rule: Rule, state: Self::State) -> Result<Rule, StoreError>;

    async fn update_rule(rule: Rule, state: Self::State) -> Result<Rule, StoreError>;

    async fn delete_rule(
        tenant: &TenantId,
        id: RuleId,
        state: Self::State,
    ) -> Result<(), StoreError>;

    // ---------------- Event logs ----------------
    /// Insert all records of one ingress event in a single batch.
    async fn insert_event_logs(
        records: Vec<EventLogRecord>,
        state: Self::State,
    ) -> Result<(), StoreError>;

    /// Monotonic status update. Re-applying the current status is a no-op
    /// (terminal updates are idempotent); an illegal transition errors.
    /// Terminal transitions set `latency_ms = updated_at - created_at`.
    async fn update_event_log_status(
        tenant: &TenantId,
        id: EventLogId,
        status: EventLogStatus,
        error_message: Option<String>,
        state: Self::State,
    ) -> Result<EventLogRecord, StoreError>;

    async fn get_event_log(
        tenant: &TenantId,
        id: EventLogId,
        state: Self::State,
    ) -> Result<Option<EventLogRecord>, StoreError>;

    /// Sorted by `created_at desc`.
    async fn list_event_logs(
        tenant: &TenantId,
        filter: EventLogFilter,
        limit: usize,
        offset: usize,
        state: Self::State,
    ) -> Result<Vec<EventLogRecord>, StoreError>;

    async fn get_event_log_analytics(
        tenant: &TenantId,
        filter: EventLogFilter,
        state: Self::State,
    ) -> Result<EventLogAnalytics, StoreError>;

    /// Contiguous buckets within `[start_time, end_time]`; empty buckets are
    /// zero-filled.
    async fn get_event_log_timeseries(
        tenant: &TenantId,
        filter: EventLogFilter,
        interval: TimeseriesInterval,
        state: Self::State,
    ) -> Result<Vec<TimeseriesBucket>, StoreError>;

    async fn get_event_log_breakdown(
        tenant: &TenantId,
        query: BreakdownQuery,
        state: Self::State,
    ) -> Result<BreakdownPage, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        use EventLogStatus::{Delivered, Failed, Queued, Success, Unmatched};
        assert!(Queued.can_transition_to(Delivered));
        assert!(Queued.can_transition_to(Failed));
        assert!(Queued.can_transition_to(Success));
        assert!(Delivered.can_transition_to(Success));
        assert!(Delivered.can_transition_to(Failed));

        assert!(!Delivered.can_transition_to(Queued));
        assert!(!Success.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Success));
        assert!(!Failed.can_transition_to(Delivered));
        assert!(!Unmatched.can_transition_to(Delivered));
        assert!(!Unmatched.can_transition_to(Success));
    }

    #[test]
    fn terminal_states() {
        assert!(EventLogStatus::Success.is_terminal());
        assert!(EventLogStatus::Failed.is_terminal());
        assert!(EventLogStatus::Unmatched.is_terminal());
        assert!(!EventLogStatus::Queued.is_terminal());
        assert!(!EventLogStatus::Delivered.is_terminal());
    }

    #[test]
    fn percentile_index_at_p() {
        let samples = vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100];
        assert_eq!(percentile(&samples, 0.5), Some(60));
        assert_eq!(percentile(&samples, 0.95), Some(100));
        assert_eq!(percentile(&samples, 0.0), Some(10));
        assert_eq!(percentile(&[], 0.5), None);
        assert_eq!(percentile(&[42], 0.99), Some(42));
    }

    #[test]
    fn provider_instance_hash_is_stable_and_credential_free() {
        let now = chrono::Utc::now();
        let mut instance = ProviderInstance {
            tenant_id: TenantId::from("acme"),
            provider: ProviderKind::Github,
            key: "github.com".to_string(),
            app_id: Some("1234".to_string()),
            private_key: Some("PEM".to_string()),
            client_id: None,
            client_secret: None,
            webhook_secret: Some("s3cret".to_string()),
            api_base_url: None,
            webhook_path: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        };
        let first = instance.config_hash();
        // Rotating a secret must not change the instance identity.
        instance.webhook_secret = Some("rotated".to_string());
        assert_eq!(instance.config_hash(), first);
        instance.api_base_url = Some("https://ghe.example.com/api/v3".to_string());
        assert_ne!(instance.config_hash(), first);
    }

    #[test]
    fn redacted_debug_hides_secrets() {
        let now = chrono::Utc::now();
        let instance = ProviderInstance {
            tenant_id: TenantId::global(),
            provider: ProviderKind::Gitlab,
            key: "gitlab.com".to_string(),
            app_id: None,
            private_key: None,
            client_id: None,
            client_secret: Some("super-secret".to_string()),
            webhook_secret: None,
            api_base_url: None,
            webhook_path: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        };
        let rendered = format!("{instance:?}");
        assert!(!rendered.contains("super-secret"));
    }
}
