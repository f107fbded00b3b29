//! In-memory store backend.
//!
//! Single-process deployments and tests run against this backend; it
//! implements the full contract including the analytics surface.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use tokio::sync::RwLock;

use crate::service::{
    DriverId, EventLogId, ProviderKind, RuleId, TenantId,
    health::{Health, HealthExt},
    store::{
        BreakdownGroupBy, BreakdownPage, BreakdownQuery, BreakdownRow, BreakdownSortBy,
        CountBucket, Driver, DriverFilter, EventLogAnalytics, EventLogFilter, EventLogRecord,
        EventLogStatus, Installation, InstallationFilter, Namespace, NamespaceFilter,
        ProviderInstance, ProviderInstanceFilter, RouterStore, Rule, RuleWithDriver, StoreError,
        TimeseriesBucket, TimeseriesInterval, percentile,
    },
};

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStore;

#[derive(Debug, Default)]
struct Inner {
    provider_instances: Vec<ProviderInstance>,
    installations: Vec<Installation>,
    namespaces: Vec<Namespace>,
    drivers: Vec<Driver>,
    rules: Vec<Rule>,
    event_logs: Vec<EventLogRecord>,
    next_rule_position: i64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HealthExt for MemoryState {
    async fn health(&self) -> Health {
        Health::Healthy
    }
}

#[async_trait]
impl RouterStore for MemoryStore {
    type State = MemoryState;

    // ---------------- Provider instances ----------------
    async fn list_provider_instances(
        tenant: &TenantId,
        filter: ProviderInstanceFilter,
        state: Self::State,
    ) -> Result<Vec<ProviderInstance>, StoreError> {
        let inner = state.inner.read().await;
        Ok(inner
            .provider_instances
            .iter()
            .filter(|i| i.tenant_id == *tenant)
            .filter(|i| filter.provider.is_none_or(|p| p == i.provider))
            .filter(|i| filter.key.as_ref().is_none_or(|k| *k == i.key))
            .filter(|i| filter.enabled.is_none_or(|e| e == i.enabled))
            .cloned()
            .collect())
    }

    async fn get_provider_instance(
        tenant: &TenantId,
        provider: ProviderKind,
        key: &str,
        state: Self::State,
    ) -> Result<Option<ProviderInstance>, StoreError> {
        let inner = state.inner.read().await;
        Ok(inner
            .provider_instances
            .iter()
            .find(|i| i.tenant_id == *tenant && i.provider == provider && i.key == key)
            .cloned())
    }

    async fn resolve_provider_instances(
        provider: ProviderKind,
        state: Self::State,
    ) -> Result<Vec<ProviderInstance>, StoreError> {
        let inner = state.inner.read().await;
        Ok(inner
            .provider_instances
            .iter()
            .filter(|i| i.provider == provider && i.enabled)
            .cloned()
            .collect())
    }

    async fn upsert_provider_instance(
        instance: ProviderInstance,
        state: Self::State,
    ) -> Result<ProviderInstance, StoreError> {
        let mut inner = state.inner.write().await;
        let now = Utc::now();
        if let Some(existing) = inner.provider_instances.iter_mut().find(|i| {
            i.tenant_id == instance.tenant_id
                && i.provider == instance.provider
                && i.key == instance.key
        }) {
            let created_at = existing.created_at;
            *existing = ProviderInstance {
                created_at,
                updated_at: now,
                ..instance.clone()
            };
            return Ok(existing.clone());
        }
        let stored = ProviderInstance {
            created_at: now,
            updated_at: now,
            ..instance
        };
        inner.provider_instances.push(stored.clone());
        Ok(stored)
    }

    async fn delete_provider_instance(
        tenant: &TenantId,
        provider: ProviderKind,
        key: &str,
        state: Self::State,
    ) -> Result<(), StoreError> {
        let mut inner = state.inner.write().await;
        inner
            .provider_instances
            .retain(|i| !(i.tenant_id == *tenant && i.provider == provider && i.key == key));
        Ok(())
    }

    // ---------------- Installations ----------------
    async fn list_installations(
        tenant: &TenantId,
        filter: InstallationFilter,
        state: Self::State,
    ) -> Result<Vec<Installation>, StoreError> {
        let inner = state.inner.read().await;
        Ok(inner
            .installations
            .iter()
            .filter(|i| i.tenant_id == *tenant)
            .filter(|i| filter.provider.is_none_or(|p| p == i.provider))
            .filter(|i| {
                filter
                    .account_id
                    .as_ref()
                    .is_none_or(|a| *a == i.account_id)
            })
            .filter(|i| {
                filter
                    .installation_id
                    .as_ref()
                    .is_none_or(|id| *id == i.installation_id)
            })
            .filter(|i| {
                filter
                    .provider_instance_key
                    .as_ref()
                    .is_none_or(|k| *k == i.provider_instance_key)
            })
            .cloned()
            .collect())
    }

    async fn get_installation_by_id(
        tenant: &TenantId,
        provider: ProviderKind,
        installation_id: &str,
        state: Self::State,
    ) -> Result<Option<Installation>, StoreError> {
        let inner = state.inner.read().await;
        Ok(inner
            .installations
            .iter()
            .filter(|i| {
                i.tenant_id == *tenant
                    && i.provider == provider
                    && i.installation_id == installation_id
            })
            .max_by_key(|i| i.updated_at)
            .cloned())
    }

    async fn get_installation_by_account(
        tenant: &TenantId,
        provider: ProviderKind,
        account_id: &str,
        state: Self::State,
    ) -> Result<Option<Installation>, StoreError> {
        let inner = state.inner.read().await;
        Ok(inner
            .installations
            .iter()
            .filter(|i| {
                i.tenant_id == *tenant && i.provider == provider && i.account_id == account_id
            })
            .max_by_key(|i| i.updated_at)
            .cloned())
    }

    async fn resolve_installation(
        provider: ProviderKind,
        installation_id: &str,
        state: Self::State,
    ) -> Result<Option<Installation>, StoreError> {
        let inner = state.inner.read().await;
        Ok(inner
            .installations
            .iter()
            .filter(|i| i.provider == provider && i.installation_id == installation_id)
            .max_by_key(|i| i.updated_at)
            .cloned())
    }

    async fn upsert_installation(
        installation: Installation,
        state: Self::State,
    ) -> Result<Installation, StoreError> {
        let mut inner = state.inner.write().await;
        let now = Utc::now();
        if let Some(existing) = inner.installations.iter_mut().find(|i| {
            i.tenant_id == installation.tenant_id
                && i.provider == installation.provider
                && i.account_id == installation.account_id
                && i.installation_id == installation.installation_id
                && i.provider_instance_key == installation.provider_instance_key
        }) {
            let created_at = existing.created_at;
            *existing = Installation {
                created_at,
                updated_at: now,
                ..installation.clone()
            };
            return Ok(existing.clone());
        }
        let stored = Installation {
            created_at: now,
            updated_at: now,
            ..installation
        };
        inner.installations.push(stored.clone());
        Ok(stored)
    }

    async fn delete_installation(
        tenant: &TenantId,
        provider: ProviderKind,
        installation_id: &str,
        state: Self::State,
    ) -> Result<(), StoreError> {
        let mut inner = state.inner.write().await;
        inner.installations.retain(|i| {
            !(i.tenant_id == *tenant
                && i.provider == provider
                && i.installation_id == installation_id)
        });
        Ok(())
    }

    // ---------------- Namespaces ----------------
    async fn list_namespaces(
        tenant: &TenantId,
        filter: NamespaceFilter,
        state: Self::State,
    ) -> Result<Vec<Namespace>, StoreError> {
        let inner = state.inner.read().await;
        Ok(inner
            .namespaces
            .iter()
            .filter(|n| n.tenant_id == *tenant)
            .filter(|n| filter.provider.is_none_or(|p| p == n.provider))
            .filter(|n| {
                filter
                    .provider_instance_key
                    .as_ref()
                    .is_none_or(|k| *k == n.provider_instance_key)
            })
            .filter(|n| filter.repo_id.as_ref().is_none_or(|r| *r == n.repo_id))
            .filter(|n| {
                filter
                    .full_name
                    .as_ref()
                    .is_none_or(|f| *f == n.full_name)
            })
            .filter(|n| {
                filter
                    .webhooks_enabled
                    .is_none_or(|w| w == n.webhooks_enabled)
            })
            .cloned()
            .collect())
    }

    async fn resolve_namespace(
        provider: ProviderKind,
        repo_id: &str,
        state: Self::State,
    ) -> Result<Option<Namespace>, StoreError> {
        let inner = state.inner.read().await;
        Ok(inner
            .namespaces
            .iter()
            .filter(|n| n.provider == provider && n.repo_id == repo_id)
            .max_by_key(|n| n.updated_at)
            .cloned())
    }

    async fn upsert_namespace(
        namespace: Namespace,
        state: Self::State,
    ) -> Result<Namespace, StoreError> {
        let mut inner = state.inner.write().await;
        let now = Utc::now();
        if let Some(existing) = inner.namespaces.iter_mut().find(|n| {
            n.tenant_id == namespace.tenant_id
                && n.provider == namespace.provider
                && n.provider_instance_key == namespace.provider_instance_key
                && n.repo_id == namespace.repo_id
        }) {
            let created_at = existing.created_at;
            *existing = Namespace {
                created_at,
                updated_at: now,
                ..namespace.clone()
            };
            return Ok(existing.clone());
        }
        let stored = Namespace {
            created_at: now,
            updated_at: now,
            ..namespace
        };
        inner.namespaces.push(stored.clone());
        Ok(stored)
    }

    async fn delete_namespace(
        tenant: &TenantId,
        provider: ProviderKind,
        provider_instance_key: &str,
        repo_id: &str,
        state: Self::State,
    ) -> Result<(), StoreError> {
        let mut inner = state.inner.write().await;
        inner.namespaces.retain(|n| {
            !(n.tenant_id == *tenant
                && n.provider == provider
                && n.provider_instance_key == provider_instance_key
                && n.repo_id == repo_id)
        });
        Ok(())
    }

    async fn set_namespace_webhooks_enabled(
        tenant: &TenantId,
        provider: ProviderKind,
        provider_instance_key: &str,
        repo_id: &str,
        enabled: bool,
        state: Self::State,
    ) -> Result<Namespace, StoreError> {
        let mut inner = state.inner.write().await;
        let namespace = inner
            .namespaces
            .iter_mut()
            .find(|n| {
                n.tenant_id == *tenant
                    && n.provider == provider
                    && n.provider_instance_key == provider_instance_key
                    && n.repo_id == repo_id
            })
            .ok_or_else(|| StoreError::not_found("namespace"))?;
        namespace.webhooks_enabled = enabled;
        namespace.updated_at = Utc::now();
        Ok(namespace.clone())
    }

    // ---------------- Drivers ----------------
    async fn list_drivers(
        tenant: &TenantId,
        filter: DriverFilter,
        state: Self::State,
    ) -> Result<Vec<Driver>, StoreError> {
        let inner = state.inner.read().await;
        Ok(inner
            .drivers
            .iter()
            .filter(|d| d.tenant_id == *tenant)
            .filter(|d| filter.name.as_ref().is_none_or(|n| *n == d.name))
            .filter(|d| filter.enabled.is_none_or(|e| e == d.enabled))
            .cloned()
            .collect())
    }

    async fn get_driver(
        tenant: &TenantId,
        id: DriverId,
        state: Self::State,
    ) -> Result<Option<Driver>, StoreError> {
        let inner = state.inner.read().await;
        Ok(inner
            .drivers
            .iter()
            .find(|d| d.tenant_id == *tenant && d.id == id)
            .cloned())
    }

    async fn get_driver_by_name(
        tenant: &TenantId,
        name: &str,
        state: Self::State,
    ) -> Result<Option<Driver>, StoreError> {
        let inner = state.inner.read().await;
        Ok(inner
            .drivers
            .iter()
            .find(|d| d.tenant_id == *tenant && d.name == name)
            .cloned())
    }

    async fn upsert_driver(driver: Driver, state: Self::State) -> Result<Driver, StoreError> {
        let mut inner = state.inner.write().await;
        let now = Utc::now();
        if let Some(existing) = inner
            .drivers
            .iter_mut()
            .find(|d| d.tenant_id == driver.tenant_id && d.name == driver.name)
        {
            let created_at = existing.created_at;
            let id = existing.id;
            *existing = Driver {
                id,
                created_at,
                updated_at: now,
                ..driver.clone()
            };
            return Ok(existing.clone());
        }
        let stored = Driver {
            created_at: now,
            updated_at: now,
            ..driver
        };
        inner.drivers.push(stored.clone());
        Ok(stored)
    }

    async fn delete_driver(
        tenant: &TenantId,
        id: DriverId,
        state: Self::State,
    ) -> Result<(), StoreError> {
        let mut inner = state.inner.write().await;
        inner
            .drivers
            .retain(|d| !(d.tenant_id == *tenant && d.id == id));
        Ok(())
    }

    // ---------------- Rules ----------------
    async fn list_rules(
        tenant: &TenantId,
        state: Self::State,
    ) -> Result<Vec<RuleWithDriver>, StoreError> {
        let inner = state.inner.read().await;
        let mut rules: Vec<&Rule> = inner
            .rules
            .iter()
            .filter(|r| r.tenant_id == *tenant)
            .collect();
        rules.sort_by_key(|r| r.position);
        Ok(rules
            .into_iter()
            .map(|rule| {
                let driver = rule
                    .driver_id
                    .and_then(|id| inner.drivers.iter().find(|d| d.id == id));
                RuleWithDriver {
                    rule: rule.clone(),
                    driver_name: driver.map(|d| d.name.clone()),
                    driver_config: driver.map(|d| d.config.clone()),
                    driver_enabled: driver.map(|d| d.enabled),
                }
            })
            .collect())
    }

    async fn get_rule(
        tenant: &TenantId,
        id: RuleId,
        state: Self::State,
    ) -> Result<Option<RuleWithDriver>, StoreError> {
        let rules = Self::list_rules(tenant, state).await?;
        Ok(rules.into_iter().find(|r| r.rule.id == id))
    }

    async fn create_rule(rule: Rule, state: Self::State) -> Result<Rule, StoreError> {
        let mut inner = state.inner.write().await;
        let now = Utc::now();
        inner.next_rule_position += 1;
        let stored = Rule {
            position: inner.next_rule_position,
            created_at: now,
            updated_at: now,
            ..rule
        };
        inner.rules.push(stored.clone());
        Ok(stored)
    }

    async fn update_rule(rule: Rule, state: Self::State) -> Result<Rule, StoreError> {
        let mut inner = state.inner.write().await;
        let existing = inner
            .rules
            .iter_mut()
            .find(|r| r.tenant_id == rule.tenant_id && r.id == rule.id)
            .ok_or_else(|| StoreError::not_found("rule"))?;
        let created_at = existing.created_at;
        let position = existing.position;
        *existing = Rule {
            position,
            created_at,
            updated_at: Utc::now(),
            ..rule
        };
        Ok(existing.clone())
    }

    async fn delete_rule(
        tenant: &TenantId,
        id: RuleId,
        state: Self::State,
    ) -> Result<(), StoreError> {
        let mut inner = state.inner.write().await;
        inner
            .rules
            .retain(|r| !(r.tenant_id == *tenant && r.id == id));
        Ok(())
    }

    // ---------------- Event logs ----------------
    async fn insert_event_logs(
        records: Vec<EventLogRecord>,
        state: Self::State,
    ) -> Result<(), StoreError> {
        let mut inner = state.inner.write().await;
        inner.event_logs.extend(records);
        Ok(())
    }

    async fn update_event_log_status(
        tenant: &TenantId,
        id: EventLogId,
        status: EventLogStatus,
        error_message: Option<String>,
        state: Self::State,
    ) -> Result<EventLogRecord, StoreError> {
        let mut inner = state.inner.write().await;
        let record = inner
            .event_logs
            .iter_mut()
            .find(|r| r.tenant_id == *tenant && r.id == id)
            .ok_or_else(|| StoreError::not_found("event log"))?;
        if record.status == status {
            // Terminal updates are idempotent.
            return Ok(record.clone());
        }
        if !record.status.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                from: record.status.to_string(),
                to: status.to_string(),
            });
        }
        record.status = status;
        record.updated_at = Utc::now();
        if let Some(message) = error_message {
            record.error_message = Some(message);
        }
        if status.is_terminal() {
            record.latency_ms =
                Some((record.updated_at - record.created_at).num_milliseconds());
        }
        Ok(record.clone())
    }

    async fn get_event_log(
        tenant: &TenantId,
        id: EventLogId,
        state: Self::State,
    ) -> Result<Option<EventLogRecord>, StoreError> {
        let inner = state.inner.read().await;
        Ok(inner
            .event_logs
            .iter()
            .find(|r| r.tenant_id == *tenant && r.id == id)
            .cloned())
    }

    async fn list_event_logs(
        tenant: &TenantId,
        filter: EventLogFilter,
        limit: usize,
        offset: usize,
        state: Self::State,
    ) -> Result<Vec<EventLogRecord>, StoreError> {
        let inner = state.inner.read().await;
        let mut records: Vec<EventLogRecord> = inner
            .event_logs
            .iter()
            .filter(|r| r.tenant_id == *tenant && filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_event_log_analytics(
        tenant: &TenantId,
        filter: EventLogFilter,
        state: Self::State,
    ) -> Result<EventLogAnalytics, StoreError> {
        let inner = state.inner.read().await;
        let records: Vec<&EventLogRecord> = inner
            .event_logs
            .iter()
            .filter(|r| r.tenant_id == *tenant && filter.matches(r))
            .collect();

        let mut analytics = EventLogAnalytics {
            total: records.len() as i64,
            matched: records.iter().filter(|r| r.matched).count() as i64,
            failed: records
                .iter()
                .filter(|r| r.status == EventLogStatus::Failed)
                .count() as i64,
            distinct_request_ids: records
                .iter()
                .map(|r| r.request_id.as_str())
                .collect::<HashSet<_>>()
                .len() as i64,
            ..EventLogAnalytics::default()
        };
        analytics.by_provider = count_by(&records, |r| r.provider.to_string());
        analytics.by_event = count_by(&records, |r| r.name.clone());
        analytics.by_topic = count_by(&records, |r| r.topic.clone());
        analytics.by_rule = count_by(&records, |r| {
            r.rule_id.map(|id| id.to_string()).unwrap_or_default()
        });
        analytics.by_installation = count_by(&records, |r| r.installation_id.clone());
        analytics.by_namespace = count_by(&records, |r| r.namespace_name.clone());
        Ok(analytics)
    }

    async fn get_event_log_timeseries(
        tenant: &TenantId,
        filter: EventLogFilter,
        interval: TimeseriesInterval,
        state: Self::State,
    ) -> Result<Vec<TimeseriesBucket>, StoreError> {
        let inner = state.inner.read().await;
        let records: Vec<&EventLogRecord> = inner
            .event_logs
            .iter()
            .filter(|r| r.tenant_id == *tenant && filter.matches(r))
            .collect();

        let start = filter
            .start_time
            .or_else(|| records.iter().map(|r| r.created_at).min());
        let end = filter
            .end_time
            .or_else(|| records.iter().map(|r| r.created_at).max());
        let (Some(start), Some(end)) = (start, end) else {
            return Ok(Vec::new());
        };

        let mut buckets: BTreeMap<DateTime<Utc>, TimeseriesBucket> = BTreeMap::new();
        let mut cursor = truncate_to_bucket(start, interval);
        let last = truncate_to_bucket(end, interval);
        // Contiguous buckets, zero-filled.
        while cursor <= last {
            buckets.insert(
                cursor,
                TimeseriesBucket {
                    bucket_start: cursor,
                    event_count: 0,
                    matched_count: 0,
                    failure_count: 0,
                    distinct_req: 0,
                },
            );
            cursor += interval.duration();
        }

        let mut request_ids: BTreeMap<DateTime<Utc>, HashSet<&str>> = BTreeMap::new();
        for record in &records {
            let key = truncate_to_bucket(record.created_at, interval);
            if let Some(bucket) = buckets.get_mut(&key) {
                bucket.event_count += 1;
                if record.matched {
                    bucket.matched_count += 1;
                }
                if record.status == EventLogStatus::Failed {
                    bucket.failure_count += 1;
                }
                request_ids.entry(key).or_default().insert(&record.request_id);
            }
        }
        for (key, ids) in request_ids {
            if let Some(bucket) = buckets.get_mut(&key) {
                bucket.distinct_req = ids.len() as i64;
            }
        }
        Ok(buckets.into_values().collect())
    }

    async fn get_event_log_breakdown(
        tenant: &TenantId,
        query: BreakdownQuery,
        state: Self::State,
    ) -> Result<BreakdownPage, StoreError> {
        let inner = state.inner.read().await;
        let records: Vec<&EventLogRecord> = inner
            .event_logs
            .iter()
            .filter(|r| r.tenant_id == *tenant && query.filter.matches(r))
            .collect();

        let mut groups: BTreeMap<String, (i64, i64, i64, Vec<i64>)> = BTreeMap::new();
        for record in &records {
            let key = breakdown_key(record, query.group_by);
            let entry = groups.entry(key).or_default();
            entry.0 += 1;
            if record.matched {
                entry.1 += 1;
            }
            if record.status == EventLogStatus::Failed {
                entry.2 += 1;
            }
            if let Some(latency) = record.latency_ms {
                entry.3.push(latency);
            }
        }

        let mut rows: Vec<BreakdownRow> = groups
            .into_iter()
            .map(|(key, (events, matched, failed, mut latencies))| {
                latencies.sort_unstable();
                let (p50, p95, p99) = if query.include_latency {
                    (
                        percentile(&latencies, 0.50),
                        percentile(&latencies, 0.95),
                        percentile(&latencies, 0.99),
                    )
                } else {
                    (None, None, None)
                };
                BreakdownRow {
                    key,
                    events,
                    matched,
                    failed,
                    p50_latency_ms: p50,
                    p95_latency_ms: p95,
                    p99_latency_ms: p99,
                }
            })
            .collect();

        rows.sort_by_key(|row| match query.sort_by {
            BreakdownSortBy::Events => row.events,
            BreakdownSortBy::Matched => row.matched,
            BreakdownSortBy::Failed => row.failed,
        });
        if query.desc {
            rows.reverse();
        }

        let offset: usize = query
            .page_token
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);
        let page_size = query.page_size.max(1);
        let next_page_token = if offset + page_size < rows.len() {
            Some((offset + page_size).to_string())
        } else {
            None
        };
        let rows = rows.into_iter().skip(offset).take(page_size).collect();
        Ok(BreakdownPage {
            rows,
            next_page_token,
        })
    }
}

fn count_by(
    records: &[&EventLogRecord],
    key: impl Fn(&EventLogRecord) -> String,
) -> Vec<CountBucket> {
    let mut counts: BTreeMap<String, i64> = BTreeMap::new();
    for record in records {
        *counts.entry(key(record)).or_default() += 1;
    }
    let mut buckets: Vec<CountBucket> = counts
        .into_iter()
        .map(|(key, count)| CountBucket { key, count })
        .collect();
    buckets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    buckets
}

fn breakdown_key(record: &EventLogRecord, group_by: BreakdownGroupBy) -> String {
    match group_by {
        BreakdownGroupBy::Provider => record.provider.to_string(),
        BreakdownGroupBy::Event => record.name.clone(),
        BreakdownGroupBy::Topic => record.topic.clone(),
        BreakdownGroupBy::Rule => record
            .rule_id
            .map(|id| id.to_string())
            .unwrap_or_default(),
        BreakdownGroupBy::Installation => record.installation_id.clone(),
        BreakdownGroupBy::Namespace => record.namespace_name.clone(),
    }
}

fn truncate_to_bucket(ts: DateTime<Utc>, interval: TimeseriesInterval) -> DateTime<Utc> {
    let day = Utc
        .with_ymd_and_hms(ts.year(), ts.month(), ts.day(), 0, 0, 0)
        .single()
        .unwrap_or(ts);
    match interval {
        TimeseriesInterval::Hour => day + ChronoDuration::hours(i64::from(ts.hour())),
        TimeseriesInterval::Day => day,
        TimeseriesInterval::Week => {
            day - ChronoDuration::days(i64::from(ts.weekday().num_days_from_monday()))
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn record(
        tenant: &str,
        request_id: &str,
        topic: &str,
        status: EventLogStatus,
        matched: bool,
        created_at: DateTime<Utc>,
    ) -> EventLogRecord {
        EventLogRecord {
            id: EventLogId::new(uuid::Uuid::now_v7()),
            tenant_id: TenantId::from(tenant),
            provider: ProviderKind::Github,
            name: "pull_request".to_string(),
            request_id: request_id.to_string(),
            state_id: "acct".to_string(),
            installation_id: "inst".to_string(),
            namespace_id: "1".to_string(),
            namespace_name: "o/r".to_string(),
            topic: topic.to_string(),
            rule_id: matched.then(RuleId::new_random),
            rule_when: None,
            drivers: vec!["gochannel".to_string()],
            headers: serde_json::json!({}),
            body: b"{}".to_vec(),
            body_hash: crate::service::event::body_hash(b"{}"),
            status,
            error_message: None,
            matched,
            latency_ms: None,
            created_at,
            updated_at: created_at,
        }
    }

    #[tokio::test]
    async fn tenant_scoping_never_leaks_rows() {
        let state = MemoryState::new();
        let now = Utc::now();
        MemoryStore::insert_event_logs(
            vec![
                record("acme", "r1", "t", EventLogStatus::Queued, true, now),
                record("umbrella", "r2", "t", EventLogStatus::Queued, true, now),
            ],
            state.clone(),
        )
        .await
        .unwrap();
        let acme = MemoryStore::list_event_logs(
            &TenantId::from("acme"),
            EventLogFilter::default(),
            100,
            0,
            state.clone(),
        )
        .await
        .unwrap();
        assert_eq!(acme.len(), 1);
        assert!(acme.iter().all(|r| r.tenant_id == TenantId::from("acme")));
    }

    #[tokio::test]
    async fn status_updates_are_monotonic_and_idempotent() {
        let state = MemoryState::new();
        let now = Utc::now();
        let row = record("acme", "r1", "t", EventLogStatus::Queued, true, now);
        let id = row.id;
        let tenant = TenantId::from("acme");
        MemoryStore::insert_event_logs(vec![row], state.clone()).await.unwrap();

        let delivered = MemoryStore::update_event_log_status(
            &tenant,
            id,
            EventLogStatus::Delivered,
            None,
            state.clone(),
        )
        .await
        .unwrap();
        assert_eq!(delivered.status, EventLogStatus::Delivered);
        assert!(delivered.latency_ms.is_none());

        let success = MemoryStore::update_event_log_status(
            &tenant,
            id,
            EventLogStatus::Success,
            None,
            state.clone(),
        )
        .await
        .unwrap();
        assert_eq!(success.status, EventLogStatus::Success);
        let latency = success.latency_ms.expect("terminal sets latency");

        // Idempotent terminal re-apply.
        let again = MemoryStore::update_event_log_status(
            &tenant,
            id,
            EventLogStatus::Success,
            None,
            state.clone(),
        )
        .await
        .unwrap();
        assert_eq!(again.latency_ms, Some(latency));
        assert_eq!(again.updated_at, success.updated_at);

        // Regression is rejected.
        let err = MemoryStore::update_event_log_status(
            &tenant,
            id,
            EventLogStatus::Queued,
            None,
            state.clone(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_natural_keys() {
        let state = MemoryState::new();
        let now = Utc::now();
        let namespace = Namespace {
            tenant_id: TenantId::from("acme"),
            provider: ProviderKind::Github,
            provider_instance_key: "github.com".to_string(),
            repo_id: "1".to_string(),
            account_id: "a".to_string(),
            installation_id: "i".to_string(),
            owner: "o".to_string(),
            name: "r".to_string(),
            full_name: "o/r".to_string(),
            visibility: None,
            default_branch: None,
            clone_url: None,
            html_url: None,
            webhooks_enabled: true,
            created_at: now,
            updated_at: now,
        };
        let first = MemoryStore::upsert_namespace(namespace.clone(), state.clone())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = MemoryStore::upsert_namespace(namespace, state.clone())
            .await
            .unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at > first.updated_at);

        let all = MemoryStore::list_namespaces(
            &TenantId::from("acme"),
            NamespaceFilter::default(),
            state,
        )
        .await
        .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn analytics_counts_and_distinct_requests() {
        let state = MemoryState::new();
        let now = Utc::now();
        MemoryStore::insert_event_logs(
            vec![
                record("acme", "r1", "a", EventLogStatus::Delivered, true, now),
                record("acme", "r1", "b", EventLogStatus::Failed, true, now),
                record("acme", "r2", "unmatched", EventLogStatus::Unmatched, false, now),
            ],
            state.clone(),
        )
        .await
        .unwrap();
        let analytics = MemoryStore::get_event_log_analytics(
            &TenantId::from("acme"),
            EventLogFilter::default(),
            state,
        )
        .await
        .unwrap();
        assert_eq!(analytics.total, 3);
        assert_eq!(analytics.matched, 2);
        assert_eq!(analytics.failed, 1);
        assert_eq!(analytics.distinct_request_ids, 2);
        assert_eq!(analytics.by_provider[0].key, "github");
        assert_eq!(analytics.by_provider[0].count, 3);
    }

    #[tokio::test]
    async fn timeseries_buckets_are_contiguous() {
        let state = MemoryState::new();
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 0).unwrap();
        MemoryStore::insert_event_logs(
            vec![
                record("acme", "r1", "t", EventLogStatus::Delivered, true, base),
                record(
                    "acme",
                    "r2",
                    "t",
                    EventLogStatus::Delivered,
                    true,
                    base + ChronoDuration::hours(3),
                ),
            ],
            state.clone(),
        )
        .await
        .unwrap();
        let buckets = MemoryStore::get_event_log_timeseries(
            &TenantId::from("acme"),
            EventLogFilter::default(),
            TimeseriesInterval::Hour,
            state,
        )
        .await
        .unwrap();
        // 10:00 through 13:00 inclusive, middle buckets zero-filled.
        assert_eq!(buckets.len(), 4);
        assert_eq!(buckets[0].event_count, 1);
        assert_eq!(buckets[1].event_count, 0);
        assert_eq!(buckets[2].event_count, 0);
        assert_eq!(buckets[3].event_count, 1);
    }

    #[tokio::test]
    async fn breakdown_sorts_and_paginates() {
        let state = MemoryState::new();
        let now = Utc::now();
        let mut rows = Vec::new();
        for _ in 0..3 {
            rows.push(record("acme", "r", "hot", EventLogStatus::Delivered, true, now));
        }
        rows.push(record("acme", "r", "cold", EventLogStatus::Failed, true, now));
        MemoryStore::insert_event_logs(rows, state.clone()).await.unwrap();

        let page = MemoryStore::get_event_log_breakdown(
            &TenantId::from("acme"),
            BreakdownQuery {
                filter: EventLogFilter::default(),
                group_by: BreakdownGroupBy::Topic,
                sort_by: BreakdownSortBy::Events,
                desc: true,
                page_size: 1,
                page_token: None,
                include_latency: false,
            },
            state.clone(),
        )
        .await
        .unwrap();
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0].key, "hot");
        assert_eq!(page.rows[0].events, 3);
        let token = page.next_page_token.expect("second page");

        let second = MemoryStore::get_event_log_breakdown(
            &TenantId::from("acme"),
            BreakdownQuery {
                filter: EventLogFilter::default(),
                group_by: BreakdownGroupBy::Topic,
                sort_by: BreakdownSortBy::Events,
                desc: true,
                page_size: 1,
                page_token: Some(token),
                include_latency: false,
            },
            state,
        )
        .await
        .unwrap();
        assert_eq!(second.rows[0].key, "cold");
        assert!(second.next_page_token.is_none());
    }
}
